//! Engine trait definitions
//!
//! `Driver` is the per-backend factory that dials a database; `DataEngine` is
//! the capability interface of the live handle it returns. The capability is
//! selected once, at resolution time, and every semantic request goes through
//! it afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{
    BackendKind, DataModel, DataModelField, DataRequest, DialTarget, QueryConfig, TabularResult,
};

/// Live, backend-specific client handle.
///
/// Owned by the connection manager; callers only ever hold clones of the `Arc`.
pub type ClientHandle = Arc<dyn DataEngine>;

/// Factory that turns a dial target into a live handle.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend this driver serves; used as the registry key.
    fn backend(&self) -> BackendKind;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    /// Dials the target and verifies the connection is usable.
    async fn connect(&self, target: &DialTarget) -> EngineResult<ClientHandle>;
}

/// Capability interface of a live connection.
///
/// Every method receives the per-call [`QueryConfig`]: implementations must
/// honour its read-only flag before any I/O, run native calls under
/// [`QueryConfig::guard`] and only report to the audit hook on success.
#[async_trait]
pub trait DataEngine: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Cheap round trip proving the session is alive.
    async fn test_connection(&self, config: &QueryConfig) -> EngineResult<()>;

    /// Executes a raw query in the backend's native syntax.
    ///
    /// For SQL engines: one or more SQL statements.
    /// For document engines: a shell expression such as `db.users.find({})`.
    async fn run_query(&self, query: &str, config: &QueryConfig) -> EngineResult<TabularResult>;

    /// Lists tables/collections. Only `name` and `schema_name` are filled.
    async fn get_data_models(&self, config: &QueryConfig) -> EngineResult<Vec<DataModel>>;

    /// Describes one table/collection: fields and indexes.
    async fn get_single_data_model(
        &self,
        schema: &str,
        name: &str,
        config: &QueryConfig,
    ) -> EngineResult<DataModel>;

    /// Pages through a table/collection.
    async fn get_data(
        &self,
        request: &DataRequest,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult>;

    async fn add_row(
        &self,
        schema: &str,
        name: &str,
        row: &JsonMap<String, JsonValue>,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult>;

    /// Deletes rows by their backend row identifier (`_id`, `ctid`).
    async fn delete_rows(
        &self,
        schema: &str,
        name: &str,
        ids: &[String],
        config: &QueryConfig,
    ) -> EngineResult<TabularResult>;

    async fn update_single_cell(
        &self,
        schema: &str,
        name: &str,
        id: &str,
        column: &str,
        value: &str,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult>;

    /// Adds a column/field. Schema-less engines keep the default.
    async fn add_field(
        &self,
        schema: &str,
        name: &str,
        field: &DataModelField,
        config: &QueryConfig,
    ) -> EngineResult<()> {
        let _ = (schema, name, field, config);
        Err(EngineError::not_supported(format!(
            "Adding fields is not supported by {}",
            self.backend()
        )))
    }

    /// Removes a column/field. Schema-less engines keep the default.
    async fn delete_field(
        &self,
        schema: &str,
        name: &str,
        field_name: &str,
        config: &QueryConfig,
    ) -> EngineResult<()> {
        let _ = (schema, name, field_name, config);
        Err(EngineError::not_supported(format!(
            "Deleting fields is not supported by {}",
            self.backend()
        )))
    }

    /// Releases the native session. Called once, by the connection manager.
    async fn close(&self);
}
