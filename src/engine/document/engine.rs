//! Document backend capability
//!
//! Semantic requests are rendered as shell expressions and go through the
//! same translate/dispatch/normalize pipeline as raw queries. Only raw
//! queries carry the caller's audit hook.

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::instrument;

use crate::engine::document::dispatcher::{execute, DocumentStore};
use crate::engine::document::introspector::{self, DEFAULT_SAMPLE_SIZE};
use crate::engine::document::literal::parse_literal;
use crate::engine::document::translator::translate;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    BackendKind, DataModel, DataRequest, QueryConfig, TabularResult, Value,
};

pub struct DocumentEngine<S> {
    backend: BackendKind,
    store: S,
    sample_size: u32,
}

impl<S: DocumentStore> DocumentEngine<S> {
    pub fn new(backend: BackendKind, store: S) -> Self {
        Self {
            backend,
            store,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn run(&self, text: &str, config: &QueryConfig) -> EngineResult<TabularResult> {
        let structured = translate(text)?;
        execute(&self.store, &structured, text, config).await
    }
}

/// `db.getCollection("<name>")` with the name JSON-quoted.
fn collection(name: &str) -> EngineResult<String> {
    if name.is_empty() {
        return Err(EngineError::syntax_error("Collection name is empty"));
    }
    let quoted = serde_json::to_string(name)
        .map_err(|e| EngineError::internal(format!("Failed to quote collection name: {}", e)))?;
    Ok(format!("db.getCollection({})", quoted))
}

/// First entry of `parts`, when it is a `{...}` document.
fn document_argument(parts: &[String]) -> Option<&str> {
    parts
        .first()
        .map(|part| part.trim())
        .filter(|part| part.starts_with('{') && part.ends_with('}'))
}

/// Renders a row id: 24 hex digits become an ObjectId, integers stay numbers.
fn id_literal(id: &str) -> String {
    let id = id.trim();
    if id.len() == 24 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        return format!("ObjectId(\"{}\")", id);
    }
    if id.parse::<i64>().is_ok() {
        return id.to_string();
    }
    JsonValue::String(id.to_string()).to_string()
}

/// Keeps `value` when it parses as a shell literal, otherwise quotes it.
fn value_literal(value: &str) -> String {
    match parse_literal(value) {
        Ok(_) => value.trim().to_string(),
        Err(_) => JsonValue::String(value.to_string()).to_string(),
    }
}

fn is_ok_reply(result: &TabularResult) -> bool {
    match result.first_value("ok") {
        Some(Value::Float(ok)) => *ok == 1.0,
        Some(Value::Int(ok)) => *ok == 1,
        Some(Value::Bool(ok)) => *ok,
        _ => false,
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> DataEngine for DocumentEngine<S> {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    async fn test_connection(&self, config: &QueryConfig) -> EngineResult<()> {
        let reply = self.run("db.runCommand({ping: 1})", &config.unaudited()).await?;
        if is_ok_reply(&reply) {
            Ok(())
        } else {
            Err(EngineError::connection_failed("Server did not acknowledge ping"))
        }
    }

    #[instrument(skip(self, query, config), fields(query_len = query.len()))]
    async fn run_query(&self, query: &str, config: &QueryConfig) -> EngineResult<TabularResult> {
        self.run(query.trim(), config).await
    }

    async fn get_data_models(&self, config: &QueryConfig) -> EngineResult<Vec<DataModel>> {
        let names = self.run("db.getCollectionNames()", &config.unaudited()).await?;
        Ok(names
            .rows
            .iter()
            .filter_map(|row| row.get("collectionName").and_then(Value::as_str))
            .map(|name| DataModel {
                name: name.to_string(),
                ..DataModel::default()
            })
            .collect())
    }

    async fn get_single_data_model(
        &self,
        _schema: &str,
        name: &str,
        config: &QueryConfig,
    ) -> EngineResult<DataModel> {
        let config = config.unaudited();
        let fields = introspector::fields(&self.store, name, self.sample_size, &config).await?;
        let indexes = introspector::indexes(&self.store, name, &config).await?;
        Ok(DataModel {
            name: name.to_string(),
            schema_name: String::new(),
            fields,
            indexes,
        })
    }

    async fn get_data(
        &self,
        request: &DataRequest,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        let config = config.unaudited();
        let target = collection(&request.name)?;
        let filter = document_argument(&request.filter).unwrap_or("{}");

        let mut text = format!("{}.find({})", target, filter);
        if request.limit > 0 {
            text.push_str(&format!(".limit({})", request.limit));
        }
        text.push_str(&format!(".skip({})", request.offset));
        if let Some(sort) = document_argument(&request.sort) {
            text.push_str(&format!(".sort({})", sort));
        }

        let mut result = self.run(&text, &config).await?;
        if request.fetch_count {
            let counted = self
                .run(&format!("{}.count({})", target, filter), &config)
                .await?;
            result.count = counted
                .first_value("count")
                .and_then(Value::as_i64)
                .map(|count| count.max(0) as u64);
        }
        Ok(result)
    }

    async fn add_row(
        &self,
        _schema: &str,
        name: &str,
        row: &JsonMap<String, JsonValue>,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        let document = JsonValue::Object(row.clone()).to_string();
        let text = format!("{}.insertOne({})", collection(name)?, document);
        self.run(&text, &config.unaudited()).await
    }

    async fn delete_rows(
        &self,
        _schema: &str,
        name: &str,
        ids: &[String],
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        if ids.is_empty() {
            return Ok(TabularResult::scalars([("deletedCount", Value::Int(0))]));
        }
        let ids: Vec<String> = ids.iter().map(|id| id_literal(id)).collect();
        let text = format!(
            "{}.deleteMany({{_id: {{$in: [{}]}}}})",
            collection(name)?,
            ids.join(", ")
        );
        self.run(&text, &config.unaudited()).await
    }

    async fn update_single_cell(
        &self,
        _schema: &str,
        name: &str,
        id: &str,
        column: &str,
        value: &str,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        if column.is_empty() {
            return Err(EngineError::syntax_error("Column name is empty"));
        }
        let text = format!(
            "{}.updateOne({{_id: {}}}, {{$set: {{{}: {}}}}})",
            collection(name)?,
            id_literal(id),
            JsonValue::String(column.to_string()),
            value_literal(value)
        );
        self.run(&text, &config.unaudited()).await
    }

    async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::audit::testing::RecordingSink;
    use crate::engine::audit::AuditLog;
    use crate::engine::document::testing::MemoryStore;
    use crate::engine::error::ErrorKind;
    use crate::engine::types::{ConnectionId, DataModelField};
    use mongodb::bson::{doc, oid::ObjectId, Bson};
    use std::sync::Arc;

    fn engine() -> DocumentEngine<MemoryStore> {
        DocumentEngine::new(BackendKind::MongoDb, MemoryStore::new())
    }

    #[test]
    fn ids_render_as_shell_literals() {
        assert_eq!(
            id_literal("507f1f77bcf86cd799439011"),
            r#"ObjectId("507f1f77bcf86cd799439011")"#
        );
        assert_eq!(id_literal("42"), "42");
        assert_eq!(id_literal("alice"), r#""alice""#);
    }

    #[test]
    fn unparseable_values_fall_back_to_strings() {
        assert_eq!(value_literal("12"), "12");
        assert_eq!(value_literal("{a: 1}"), "{a: 1}");
        assert_eq!(value_literal("hello world"), r#""hello world""#);
    }

    #[tokio::test]
    async fn get_data_pages_and_counts() {
        let engine = engine();
        engine
            .store()
            .seed("users", (0..20).map(|i| doc! { "_id": i, "even": (i % 2 == 0) }));

        let request = DataRequest {
            name: "users".into(),
            limit: 5,
            offset: 2,
            fetch_count: true,
            filter: vec!["{even: true}".into()],
            sort: vec!["{_id: -1}".into()],
            ..DataRequest::default()
        };
        let result = engine.get_data(&request, &QueryConfig::default()).await.unwrap();

        let ids: Vec<i64> = result.rows.iter().map(|r| r["_id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![14, 12, 10, 8, 6]);
        assert_eq!(result.count, Some(10));
    }

    #[tokio::test]
    async fn non_document_filters_are_ignored() {
        let engine = engine();
        engine.store().seed("users", (0..3).map(|i| doc! { "_id": i }));

        let request = DataRequest {
            name: "users".into(),
            filter: vec!["name".into(), "=".into(), "x".into()],
            ..DataRequest::default()
        };
        let result = engine.get_data(&request, &QueryConfig::default()).await.unwrap();
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.count, None);
    }

    #[tokio::test]
    async fn row_edits_round_through_the_pipeline() {
        let engine = engine();
        let config = QueryConfig::default();

        let mut row = JsonMap::new();
        row.insert("name".into(), JsonValue::String("ada".into()));
        let inserted = engine.add_row("", "users", &row, &config).await.unwrap();
        let id = inserted.first_value("insertedId").and_then(Value::as_str).unwrap().to_string();

        let updated = engine
            .update_single_cell("", "users", &id, "age", "37", &config)
            .await
            .unwrap();
        assert_eq!(updated.first_value("updatedCount"), Some(&Value::Int(1)));
        let stored = engine.store().documents("users");
        assert_eq!(stored[0].get("age"), Some(&Bson::Int32(37)));
        assert_eq!(
            stored[0].get("_id"),
            Some(&Bson::ObjectId(ObjectId::parse_str(&id).unwrap()))
        );

        let deleted = engine.delete_rows("", "users", &[id], &config).await.unwrap();
        assert_eq!(deleted.first_value("deletedCount"), Some(&Value::Int(1)));
        assert!(engine.store().documents("users").is_empty());
    }

    #[tokio::test]
    async fn text_cells_are_stored_as_strings() {
        let engine = engine();
        engine.store().seed("users", [doc! { "_id": 1 }]);

        engine
            .update_single_cell("", "users", "1", "note", "not a literal", &QueryConfig::default())
            .await
            .unwrap();
        assert_eq!(
            engine.store().documents("users")[0].get_str("note").unwrap(),
            "not a literal"
        );
    }

    #[tokio::test]
    async fn read_only_blocks_row_edits() {
        let engine = engine();
        let err = engine
            .add_row("", "users", &JsonMap::new(), &QueryConfig::read_only())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert_eq!(engine.store().call_count(), 0);
    }

    #[tokio::test]
    async fn schema_edits_are_not_supported() {
        let field = DataModelField {
            name: "age".into(),
            data_type: "int32".into(),
            is_primary: false,
            is_nullable: true,
            tags: Vec::new(),
        };
        let err = engine()
            .add_field("", "users", &field, &QueryConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        let err = engine()
            .delete_field("", "users", "age", &QueryConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn models_list_collections_and_describe_one() {
        let engine = engine().with_sample_size(10);
        engine.store().seed("users", [doc! { "_id": 1, "a": 1 }, doc! { "_id": 2, "b": "x" }]);
        engine.store().seed("orders", [doc! { "_id": 1 }]);

        let models = engine.get_data_models(&QueryConfig::default()).await.unwrap();
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);
        assert!(models.iter().all(|m| m.schema_name.is_empty()));

        let model = engine
            .get_single_data_model("", "users", &QueryConfig::default())
            .await
            .unwrap();
        let fields: Vec<&str> = model.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(fields, vec!["_id", "a", "b"]);
        assert_eq!(model.indexes[0].name, "_id_");
        assert_eq!(
            engine.store().last_pipeline(),
            Some(vec![doc! { "$sample": { "size": 10_i64 } }])
        );
    }

    #[tokio::test]
    async fn ping_must_be_acknowledged() {
        let engine = engine();
        engine.test_connection(&QueryConfig::default()).await.unwrap();

        engine.store().fail_next(EngineError::connection_failed("refused"));
        let err = engine.test_connection(&QueryConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn only_raw_queries_are_audited() {
        let engine = engine();
        engine.store().seed("users", [doc! { "_id": 1 }]);
        let sink = Arc::new(RecordingSink::default());
        let log = AuditLog::spawn(sink.clone(), 8);
        let config = QueryConfig::default().with_audit(log.hook(ConnectionId::new("c1")));

        engine.run_query("  db.users.find({})  ", &config).await.unwrap();
        let request = DataRequest {
            name: "users".into(),
            fetch_count: true,
            ..DataRequest::default()
        };
        engine.get_data(&request, &config).await.unwrap();
        engine.get_single_data_model("", "users", &config).await.unwrap();

        log.close().await;
        assert_eq!(sink.queries(), vec!["db.users.find({})"]);
    }
}
