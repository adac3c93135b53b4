//! Mutation commands
//!
//! Row-level insert, delete and single-cell update. Each backend decides how
//! a row identifier is spelled (`_id` for documents, `ctid` for PostgreSQL).

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::instrument;

use crate::commands::{run_on_handle, CommandResponse, RequestOptions};
use crate::engine::types::{ConnectionDescriptor, TabularResult};
use crate::AppState;

#[instrument(skip(state, descriptor, row, options), fields(connection_id = %descriptor.id, columns = row.len()))]
pub async fn add_row(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    schema: String,
    name: String,
    row: JsonMap<String, JsonValue>,
    options: RequestOptions,
) -> CommandResponse<TabularResult> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.add_row(&schema, &name, &row, &config).await
    })
    .await
}

#[instrument(skip(state, descriptor, ids, options), fields(connection_id = %descriptor.id, ids = ids.len()))]
pub async fn delete_rows(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    schema: String,
    name: String,
    ids: Vec<String>,
    options: RequestOptions,
) -> CommandResponse<TabularResult> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.delete_rows(&schema, &name, &ids, &config).await
    })
    .await
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip(state, descriptor, value, options), fields(connection_id = %descriptor.id))]
pub async fn update_single_cell(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    schema: String,
    name: String,
    id: String,
    column: String,
    value: String,
    options: RequestOptions,
) -> CommandResponse<TabularResult> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle
            .update_single_cell(&schema, &name, &id, &column, &value, &config)
            .await
    })
    .await
}
