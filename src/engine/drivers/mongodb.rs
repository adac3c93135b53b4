//! MongoDB Driver
//!
//! Dials a `mongodb::Client` and exposes it as a [`DocumentStore`]; the
//! shell-language pipeline on top lives in `engine::document`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential, FindOptions, ServerAddress, Tls, TlsOptions};
use mongodb::{Client, Collection, Database};
use tracing::instrument;

use crate::engine::document::dispatcher::{DocumentStore, DocumentStream, UpdateOutcome};
use crate::engine::document::engine::DocumentEngine;
use crate::engine::document::introspector::DEFAULT_SAMPLE_SIZE;
use crate::engine::document::operation::{CursorModifiers, UpdateSpec};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::{ClientHandle, Driver};
use crate::engine::types::{BackendKind, DialTarget};

const DEFAULT_DATABASE: &str = "admin";
const APP_NAME: &str = "polyquery";

/// MongoDB driver implementation
pub struct MongoDriver {
    sample_size: u32,
}

impl MongoDriver {
    pub fn new() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    /// Documents sampled by `get_single_data_model`.
    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    async fn client_options(target: &DialTarget) -> EngineResult<ClientOptions> {
        let mut options = if target.srv {
            ClientOptions::parse(format!("mongodb+srv://{}/", target.host))
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()))?
        } else {
            let mut options = ClientOptions::default();
            options.hosts = vec![ServerAddress::Tcp {
                host: target.host.clone(),
                port: Some(target.port),
            }];
            options
        };

        if !target.username.is_empty() {
            let mut credential = Credential::default();
            credential.username = Some(target.username.clone());
            credential.password = target.password.as_ref().map(|p| p.expose().to_string());
            credential.source = Some(DEFAULT_DATABASE.to_string());
            options.credential = Some(credential);
        }
        if target.ssl {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }
        options.app_name = Some(APP_NAME.to_string());
        options.server_selection_timeout = Some(Duration::from_secs(10));
        Ok(options)
    }
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MongoDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::MongoDb
    }

    fn driver_name(&self) -> &'static str {
        "MongoDB"
    }

    #[instrument(skip(self, target), fields(connection_id = %target.connection_id, host = %target.host, srv = target.srv))]
    async fn connect(&self, target: &DialTarget) -> EngineResult<ClientHandle> {
        let options = Self::client_options(target).await?;
        let client = Client::with_options(options)
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        // Ping to verify connection
        client
            .database(DEFAULT_DATABASE)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Authentication failed") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        let database = if target.database.is_empty() {
            DEFAULT_DATABASE
        } else {
            target.database.as_str()
        };
        let store = MongoStore::new(client, database);
        Ok(Arc::new(
            DocumentEngine::new(BackendKind::MongoDb, store).with_sample_size(self.sample_size),
        ))
    }
}

/// Native session bound to one database.
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub fn new(client: Client, database: &str) -> Self {
        Self {
            database: client.database(database),
            client,
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }
}

fn map_mongo_error(err: mongodb::error::Error) -> EngineError {
    EngineError::execution_error(err.to_string())
}

fn into_stream<T>(cursor: mongodb::Cursor<T>, convert: fn(T) -> EngineResult<Document>) -> DocumentStream
where
    T: serde::de::DeserializeOwned + Send + Sync + Unpin + 'static,
{
    cursor
        .map(move |item| item.map_err(map_mongo_error).and_then(convert))
        .boxed()
}

fn list_indexes_command(collection: &str) -> Document {
    doc! { "listIndexes": collection }
}

fn update_modifications(update: UpdateSpec) -> mongodb::options::UpdateModifications {
    match update {
        UpdateSpec::Document(document) => document.into(),
        UpdateSpec::Pipeline(pipeline) => pipeline.into(),
    }
}

fn update_outcome(result: mongodb::results::UpdateResult) -> UpdateOutcome {
    UpdateOutcome {
        matched: result.matched_count,
        modified: result.modified_count,
        upserted: u64::from(result.upserted_id.is_some()),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn find_one(&self, collection: &str, filter: Document) -> EngineResult<Option<Document>> {
        self.collection(collection)
            .find_one(filter)
            .await
            .map_err(map_mongo_error)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        modifiers: CursorModifiers,
    ) -> EngineResult<DocumentStream> {
        let mut options = FindOptions::default();
        options.limit = modifiers.limit;
        options.skip = modifiers.skip;
        options.sort = modifiers.sort;

        let cursor = self
            .collection(collection)
            .find(filter)
            .with_options(options)
            .await
            .map_err(map_mongo_error)?;
        Ok(into_stream(cursor, Ok))
    }

    async fn insert_one(&self, collection: &str, document: Document) -> EngineResult<Bson> {
        let result = self
            .collection(collection)
            .insert_one(document)
            .await
            .map_err(map_mongo_error)?;
        Ok(result.inserted_id)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> EngineResult<Vec<Bson>> {
        let result = self
            .collection(collection)
            .insert_many(documents)
            .await
            .map_err(map_mongo_error)?;
        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> EngineResult<u64> {
        let result = self
            .collection(collection)
            .delete_one(filter)
            .await
            .map_err(map_mongo_error)?;
        Ok(result.deleted_count)
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> EngineResult<u64> {
        let result = self
            .collection(collection)
            .delete_many(filter)
            .await
            .map_err(map_mongo_error)?;
        Ok(result.deleted_count)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        self.collection(collection)
            .update_one(filter, update_modifications(update))
            .await
            .map(update_outcome)
            .map_err(map_mongo_error)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        self.collection(collection)
            .update_many(filter, update_modifications(update))
            .await
            .map(update_outcome)
            .map_err(map_mongo_error)
    }

    async fn run_command(&self, command: Document) -> EngineResult<Document> {
        self.database
            .run_command(command)
            .await
            .map_err(map_mongo_error)
    }

    async fn list_indexes(&self, collection: &str) -> EngineResult<DocumentStream> {
        // Raw command cursor keeps every server field in server order.
        let cursor = self
            .database
            .run_cursor_command(list_indexes_command(collection))
            .await
            .map_err(map_mongo_error)?;
        Ok(into_stream(cursor, Ok))
    }

    async fn list_collection_names(&self, filter: Document) -> EngineResult<Vec<String>> {
        let mut names = self
            .database
            .list_collection_names()
            .filter(filter)
            .await
            .map_err(map_mongo_error)?;
        names.sort();
        Ok(names)
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> EngineResult<u64> {
        self.collection(collection)
            .count_documents(filter)
            .await
            .map_err(map_mongo_error)
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Document>) -> EngineResult<DocumentStream> {
        let cursor = self
            .collection(collection)
            .aggregate(pipeline)
            .await
            .map_err(map_mongo_error)?;
        Ok(into_stream(cursor, Ok))
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ConnectionId;
    use crate::vault::Secret;

    fn target(srv: bool, ssl: bool) -> DialTarget {
        DialTarget {
            connection_id: ConnectionId::new("c1"),
            backend: BackendKind::MongoDb,
            host: "db.internal".into(),
            port: 27018,
            database: String::new(),
            srv,
            username: "reader".into(),
            password: Some(Secret::new("pw")),
            ssl,
        }
    }

    #[tokio::test]
    async fn direct_options_carry_host_credential_and_tls() {
        let options = MongoDriver::client_options(&target(false, true)).await.unwrap();

        assert_eq!(
            options.hosts,
            vec![ServerAddress::Tcp {
                host: "db.internal".into(),
                port: Some(27018)
            }]
        );
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("reader"));
        assert_eq!(credential.password.as_deref(), Some("pw"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
        assert!(matches!(options.tls, Some(Tls::Enabled(_))));
        assert_eq!(options.app_name.as_deref(), Some("polyquery"));
    }

    #[tokio::test]
    async fn anonymous_targets_have_no_credential() {
        let mut target = target(false, false);
        target.username.clear();
        target.password = None;

        let options = MongoDriver::client_options(&target).await.unwrap();
        assert!(options.credential.is_none());
        assert!(options.tls.is_none());
    }

    #[test]
    fn index_listing_uses_the_raw_command() {
        let command = list_indexes_command("users");
        assert_eq!(command.keys().collect::<Vec<_>>(), vec!["listIndexes"]);
        assert_eq!(command.get_str("listIndexes").unwrap(), "users");
    }

    #[test]
    fn pipelines_stay_pipelines() {
        let spec = UpdateSpec::Pipeline(vec![doc! { "$set": { "a": 1 } }]);
        assert!(matches!(
            update_modifications(spec),
            mongodb::options::UpdateModifications::Pipeline(_)
        ));
    }
}
