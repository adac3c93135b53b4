//! Query commands
//!
//! Raw queries in the backend's native syntax, paged reads and cancellation.

use tracing::instrument;

use crate::commands::{parse_query_id, run_on_handle, CommandResponse, RequestOptions};
use crate::engine::types::{ConnectionDescriptor, DataRequest, TabularResult};
use crate::AppState;

/// Executes SQL or a shell expression. The only audited entry point.
#[instrument(
    skip(state, descriptor, query, options),
    fields(
        connection_id = %descriptor.id,
        backend = %descriptor.backend,
        query_len = query.len(),
        read_only = options.read_only
    )
)]
pub async fn run_query(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    query: String,
    options: RequestOptions,
) -> CommandResponse<TabularResult> {
    run_on_handle(state, descriptor, &options, true, |handle, config| async move {
        handle.run_query(&query, &config).await
    })
    .await
}

#[instrument(
    skip(state, descriptor, request, options),
    fields(connection_id = %descriptor.id, model = %request.name, limit = request.limit)
)]
pub async fn get_data(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    request: DataRequest,
    options: RequestOptions,
) -> CommandResponse<TabularResult> {
    run_on_handle(state, descriptor, &options, false, |handle, config| async move {
        handle.get_data(&request, &config).await
    })
    .await
}

/// Signals the cancellation token of a running call.
#[instrument(skip(state), fields(query_id = %query_id))]
pub async fn cancel_query(state: &AppState, query_id: String) -> CommandResponse<()> {
    let result = match parse_query_id(&query_id) {
        Ok(id) => state.queries.cancel(id).await,
        Err(err) => Err(err),
    };
    CommandResponse::from_result(result)
}
