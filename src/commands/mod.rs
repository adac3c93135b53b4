//! Semantic façade
//!
//! Backend-agnostic entry points for embedders. Every command resolves the
//! connection's live handle, registers a cancellable query id, applies the
//! effective policy and folds the outcome into a [`CommandResponse`].

pub mod connection;
pub mod mutation;
pub mod query;
pub mod schema;

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::error::{EngineError, EngineResult, ErrorKind};
use crate::engine::traits::ClientHandle;
use crate::engine::types::{ConnectionDescriptor, ConnectionId, QueryConfig, QueryId};
use crate::AppState;

/// Uniform reply of every façade command.
#[derive(Debug, Serialize)]
pub struct CommandResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub query_id: Option<String>,
}

impl<T> CommandResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            query_id: None,
        }
    }

    pub fn failure(err: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            query_id: None,
        }
    }

    pub fn from_result(result: EngineResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failure(&err),
        }
    }

    fn with_query_id(mut self, query_id: QueryId) -> Self {
        self.query_id = Some(query_id.0.to_string());
        self
    }
}

/// Per-request knobs a caller may set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub read_only: bool,
    pub timeout_ms: Option<u64>,
    /// Caller-chosen id, so `cancel_query` can target the call while it runs.
    pub query_id: Option<String>,
}

impl RequestOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

pub(crate) fn parse_query_id(id: &str) -> EngineResult<QueryId> {
    Uuid::from_str(id.trim())
        .map(QueryId)
        .map_err(|e| EngineError::internal(format!("Invalid query ID: {}", e)))
}

fn effective_config(
    state: &AppState,
    connection_id: &ConnectionId,
    options: &RequestOptions,
    audited: bool,
    token: CancellationToken,
) -> QueryConfig {
    let mutating: Arc<[String]> = Arc::from(state.config.mutating_commands.clone());
    let mut config = QueryConfig::default()
        .with_cancel(token)
        .with_mutating_commands(mutating);
    config.read_only = options.read_only || state.config.force_read_only;

    let limit = options
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .or_else(|| state.config.query_timeout());
    if let Some(limit) = limit {
        config = config.with_timeout(limit);
    }
    if audited {
        config = config.with_audit(state.audit.hook(connection_id.clone()));
    }
    config
}

/// Runs `work` against the descriptor's live handle under the effective
/// policy. The query id stays registered for exactly the duration of the call.
pub(crate) async fn run_on_handle<T, F, Fut>(
    state: &AppState,
    descriptor: ConnectionDescriptor,
    options: &RequestOptions,
    audited: bool,
    work: F,
) -> CommandResponse<T>
where
    F: FnOnce(ClientHandle, QueryConfig) -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let descriptor = match connection::normalize_descriptor(descriptor) {
        Ok(descriptor) => descriptor,
        Err(err) => return CommandResponse::failure(&err),
    };

    let registered = match options.query_id.as_deref() {
        Some(raw) => match parse_query_id(raw) {
            Ok(id) => state.queries.register_with_id(descriptor.id.clone(), id).await,
            Err(err) => Err(err),
        },
        None => Ok(state.queries.register(descriptor.id.clone()).await),
    };
    let (query_id, token) = match registered {
        Ok(registered) => registered,
        Err(err) => return CommandResponse::failure(&err),
    };

    let config = effective_config(state, &descriptor.id, options, audited, token.clone());
    let result = async {
        let lease = tokio::select! {
            acquired = state.connections.acquire(&descriptor) => acquired?,
            _ = token.cancelled() => return Err(EngineError::Cancelled),
        };
        work(lease.handle().clone(), config).await
    }
    .await;

    state.queries.finish(query_id).await;

    if let Err(err) = &result {
        tracing::debug!(connection_id = %descriptor.id, kind = ?err.kind(), error = %err, "Command failed");
    }
    CommandResponse::from_result(result).with_query_id(query_id)
}
