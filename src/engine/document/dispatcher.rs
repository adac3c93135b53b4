//! Operation dispatcher
//!
//! Executes a [`StructuredOperation`] against a [`DocumentStore`]: policy
//! check first, then the native call under the config's deadline, then
//! normalization and, for audited kinds, the audit hook.

use std::time::Instant;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document};

use crate::engine::document::normalizer;
use crate::engine::document::operation::{
    CursorModifiers, Operation, StructuredOperation, UpdateSpec,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{QueryConfig, TabularResult};

/// Cursor over native documents. Items fail individually on decode errors.
pub type DocumentStream = BoxStream<'static, EngineResult<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

/// Native seam of a document database session.
///
/// Every method is one round trip (plus cursor iteration); none of them
/// applies policy.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(&self, collection: &str, filter: Document) -> EngineResult<Option<Document>>;

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        modifiers: CursorModifiers,
    ) -> EngineResult<DocumentStream>;

    async fn insert_one(&self, collection: &str, document: Document) -> EngineResult<Bson>;

    /// Returns inserted ids in input order.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<Vec<Bson>>;

    async fn delete_one(&self, collection: &str, filter: Document) -> EngineResult<u64>;

    async fn delete_many(&self, collection: &str, filter: Document) -> EngineResult<u64>;

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateSpec,
    ) -> EngineResult<UpdateOutcome>;

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateSpec,
    ) -> EngineResult<UpdateOutcome>;

    async fn run_command(&self, command: Document) -> EngineResult<Document>;

    async fn list_indexes(&self, collection: &str) -> EngineResult<DocumentStream>;

    async fn list_collection_names(&self, filter: Document) -> EngineResult<Vec<String>>;

    async fn count_documents(&self, collection: &str, filter: Document) -> EngineResult<u64>;

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> EngineResult<DocumentStream>;

    async fn close(&self);
}

/// Driver-native result of one operation, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeOutcome {
    /// `findOne`: `None` when nothing matched.
    Single(Option<Document>),
    /// Fully drained cursor or command reply.
    Documents(Vec<Document>),
    Inserted(Bson),
    InsertedMany(Vec<Bson>),
    Deleted(u64),
    Updated(UpdateOutcome),
    Count(u64),
    CollectionNames(Vec<String>),
}

/// Policy check plus native call. Never audits.
pub async fn perform<S>(
    store: &S,
    structured: &StructuredOperation,
    config: &QueryConfig,
) -> EngineResult<NativeOutcome>
where
    S: DocumentStore + ?Sized,
{
    let operation = &structured.operation;
    if config.read_only && operation.is_write(config) {
        return Err(EngineError::read_only_violation(operation.kind().method_name()));
    }

    let collection = structured.collection_name();
    let native = async {
        let outcome = match operation.clone() {
            Operation::FindOne { filter } => {
                NativeOutcome::Single(store.find_one(collection, filter).await?)
            }
            Operation::Find { filter, modifiers } => {
                NativeOutcome::Documents(drain(store.find(collection, filter, modifiers).await?).await?)
            }
            Operation::InsertOne { document } => {
                NativeOutcome::Inserted(store.insert_one(collection, document).await?)
            }
            Operation::InsertMany { documents } => {
                NativeOutcome::InsertedMany(store.insert_many(collection, documents).await?)
            }
            Operation::DeleteOne { filter } => {
                NativeOutcome::Deleted(store.delete_one(collection, filter).await?)
            }
            Operation::DeleteMany { filter } => {
                NativeOutcome::Deleted(store.delete_many(collection, filter).await?)
            }
            Operation::UpdateOne { filter, update } => {
                NativeOutcome::Updated(store.update_one(collection, filter, update).await?)
            }
            Operation::UpdateMany { filter, update } => {
                NativeOutcome::Updated(store.update_many(collection, filter, update).await?)
            }
            Operation::RunCommand { command } => {
                NativeOutcome::Documents(vec![store.run_command(command).await?])
            }
            Operation::ListIndexes => {
                NativeOutcome::Documents(drain(store.list_indexes(collection).await?).await?)
            }
            Operation::ListCollections { filter } => {
                NativeOutcome::CollectionNames(store.list_collection_names(filter).await?)
            }
            Operation::Count { filter } => {
                NativeOutcome::Count(store.count_documents(collection, filter).await?)
            }
            Operation::Aggregate { pipeline } => {
                NativeOutcome::Documents(drain(store.aggregate(collection, pipeline).await?).await?)
            }
        };
        Ok::<_, EngineError>(outcome)
    };

    config.guard(native).await
}

/// Executes, normalizes and audits one operation.
///
/// `query_text` is what the audit hook receives; it is only reported after
/// the whole call succeeded.
pub async fn execute<S>(
    store: &S,
    structured: &StructuredOperation,
    query_text: &str,
    config: &QueryConfig,
) -> EngineResult<TabularResult>
where
    S: DocumentStore + ?Sized,
{
    let started = Instant::now();
    let outcome = perform(store, structured, config).await?;
    let mut result = normalizer::normalize(outcome);
    result.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    if structured.kind().is_audited() {
        config.audit(query_text);
    }
    Ok(result)
}

/// Iterates a cursor to completion; any item error discards the batch.
async fn drain(stream: DocumentStream) -> EngineResult<Vec<Document>> {
    stream.try_collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::audit::testing::RecordingSink;
    use crate::engine::audit::AuditLog;
    use crate::engine::document::operation::OperationKind;
    use crate::engine::document::testing::MemoryStore;
    use crate::engine::document::translator::translate;
    use crate::engine::error::ErrorKind;
    use crate::engine::types::{ConnectionId, Value};
    use mongodb::bson::doc;
    use std::sync::Arc;
    use std::time::Duration;

    async fn run(
        store: &MemoryStore,
        text: &str,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        execute(store, &translate(text)?, text, config).await
    }

    #[tokio::test]
    async fn find_with_limit_and_skip_returns_cursor_order() {
        let store = MemoryStore::new();
        store.seed(
            "users",
            (0..20).map(|i| doc! { "_id": i, "name": format!("user{}", i) }),
        );

        let result = run(
            &store,
            "db.users.find({}).limit(10).skip(0)",
            &QueryConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.rows.len(), 10);
        assert_eq!(result.keys, vec!["_id", "name"]);
        let ids: Vec<i64> = result.rows.iter().map(|row| row["_id"].as_i64().unwrap()).collect();
        assert_eq!(ids, (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn insert_one_reports_id_and_is_not_audited() {
        let store = MemoryStore::new();
        let sink = Arc::new(RecordingSink::default());
        let log = AuditLog::spawn(sink.clone(), 8);
        let config = QueryConfig::default().with_audit(log.hook(ConnectionId::new("c1")));

        let result = run(&store, r#"db.users.insertOne({"name":"a"})"#, &config)
            .await
            .unwrap();

        assert_eq!(result.keys, vec!["insertedId"]);
        assert!(matches!(result.first_value("insertedId"), Some(Value::Text(_))));
        assert_eq!(store.documents("users").len(), 1);

        log.close().await;
        assert!(sink.queries().is_empty());
    }

    #[tokio::test]
    async fn read_only_rejects_every_write_without_touching_the_store() {
        let store = MemoryStore::new();
        store.seed("users", [doc! { "_id": 1 }, doc! { "_id": 2 }]);
        let sink = Arc::new(RecordingSink::default());
        let log = AuditLog::spawn(sink.clone(), 8);
        let config = QueryConfig::read_only().with_audit(log.hook(ConnectionId::new("c1")));

        let writes = [
            "db.users.insertOne({a: 1})",
            "db.users.insertMany([{a: 1}])",
            "db.users.deleteOne({_id: 1})",
            "db.users.deleteMany({})",
            "db.users.updateOne({_id: 1}, {$set: {a: 1}})",
            "db.users.updateMany({}, {$set: {a: 1}})",
        ];
        for text in writes {
            let err = run(&store, text, &config).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Permission, "{}", text);
        }

        assert_eq!(store.call_count(), 0);
        assert_eq!(store.documents("users").len(), 2);
        log.close().await;
        assert!(sink.queries().is_empty());
    }

    #[tokio::test]
    async fn read_only_honours_mutating_command_overrides() {
        let store = MemoryStore::new();
        let config = QueryConfig::read_only()
            .with_mutating_commands(Arc::from(vec!["dropDatabase".to_string()]));

        let err = run(&store, "db.runCommand({dropDatabase: 1})", &config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);

        run(&store, "db.runCommand({ping: 1})", &config).await.unwrap();
    }

    #[tokio::test]
    async fn audited_reads_report_the_original_text() {
        let store = MemoryStore::new();
        store.seed("users", [doc! { "_id": 1 }]);
        let sink = Arc::new(RecordingSink::default());
        let log = AuditLog::spawn(sink.clone(), 8);
        let config = QueryConfig::default().with_audit(log.hook(ConnectionId::new("c1")));

        run(&store, "db.users.find()", &config).await.unwrap();
        run(&store, "db.users.findOne()", &config).await.unwrap();
        run(&store, "db.users.count()", &config).await.unwrap();

        log.close().await;
        assert_eq!(sink.queries(), vec!["db.users.find()", "db.users.count()"]);
    }

    #[tokio::test]
    async fn driver_failure_is_not_audited() {
        let store = MemoryStore::new();
        store.fail_next(EngineError::execution_error("boom"));
        let sink = Arc::new(RecordingSink::default());
        let log = AuditLog::spawn(sink.clone(), 8);
        let config = QueryConfig::default().with_audit(log.hook(ConnectionId::new("c1")));

        let err = run(&store, "db.users.find()", &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Driver);

        log.close().await;
        assert!(sink.queries().is_empty());
    }

    #[tokio::test]
    async fn decode_error_mid_cursor_discards_the_batch() {
        let store = MemoryStore::new();
        store.seed("users", (0..5).map(|i| doc! { "_id": i }));
        store.fail_cursor_after(2);

        let err = run(&store, "db.users.find()", &QueryConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Driver);
    }

    #[tokio::test]
    async fn slow_native_call_times_out() {
        let store = MemoryStore::new().with_latency(Duration::from_millis(200));
        let config = QueryConfig::default().with_timeout(Duration::from_millis(10));

        let err = run(&store, "db.users.find()", &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn scalar_results_use_fixed_keys() {
        let store = MemoryStore::new();
        store.seed("users", [doc! { "_id": 1, "a": 1 }, doc! { "_id": 2, "a": 1 }]);
        let config = QueryConfig::default();

        let updated = run(&store, "db.users.updateMany({a: 1}, {$set: {b: 2}})", &config)
            .await
            .unwrap();
        assert_eq!(updated.keys, vec!["updatedCount", "upsertedCount"]);
        assert_eq!(updated.first_value("updatedCount"), Some(&Value::Int(2)));

        let counted = run(&store, "db.users.count({b: 2})", &config).await.unwrap();
        assert_eq!(counted.first_value("count"), Some(&Value::Int(2)));

        let deleted = run(&store, "db.users.deleteOne({_id: 1})", &config).await.unwrap();
        assert_eq!(deleted.first_value("deletedCount"), Some(&Value::Int(1)));

        let inserted = run(&store, "db.users.insertMany([{_id: 7}, {_id: 8}])", &config)
            .await
            .unwrap();
        assert_eq!(inserted.keys, vec!["insertedIDs"]);
    }

    #[tokio::test]
    async fn perform_checks_policy_before_io() {
        let store = MemoryStore::new();
        let structured = translate("db.users.deleteMany({})").unwrap();
        assert_eq!(structured.kind(), OperationKind::DeleteMany);

        let err = perform(&store, &structured, &QueryConfig::read_only())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReadOnlyViolation { ref operation } if operation == "deleteMany"));
        assert_eq!(store.call_count(), 0);
    }
}
