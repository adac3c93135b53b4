//! Schema commands
//!
//! Listing and describing tables/collections, plus column DDL where the
//! backend has a schema.

use tracing::instrument;

use crate::commands::{run_on_handle, CommandResponse, RequestOptions};
use crate::engine::types::{ConnectionDescriptor, DataModel, DataModelField};
use crate::AppState;

#[instrument(skip(state, descriptor, options), fields(connection_id = %descriptor.id))]
pub async fn get_data_models(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    options: RequestOptions,
) -> CommandResponse<Vec<DataModel>> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.get_data_models(&config).await
    })
    .await
}

/// Fields and indexes of one table/collection.
#[instrument(skip(state, descriptor, options), fields(connection_id = %descriptor.id))]
pub async fn get_single_data_model(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    schema: String,
    name: String,
    options: RequestOptions,
) -> CommandResponse<DataModel> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.get_single_data_model(&schema, &name, &config).await
    })
    .await
}

#[instrument(skip(state, descriptor, field, options), fields(connection_id = %descriptor.id, field = %field.name))]
pub async fn add_field(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    schema: String,
    name: String,
    field: DataModelField,
    options: RequestOptions,
) -> CommandResponse<()> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.add_field(&schema, &name, &field, &config).await
    })
    .await
}

#[instrument(skip(state, descriptor, options), fields(connection_id = %descriptor.id))]
pub async fn delete_field(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    schema: String,
    name: String,
    field_name: String,
    options: RequestOptions,
) -> CommandResponse<()> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.delete_field(&schema, &name, &field_name, &config).await
    })
    .await
}
