//! Query Manager
//!
//! Tracks in-flight queries per connection and hands out the cancellation
//! token each one runs under.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ConnectionId, QueryId};

struct ActiveQuery {
    connection_id: ConnectionId,
    token: CancellationToken,
}

pub struct QueryManager {
    active: RwLock<HashMap<QueryId, ActiveQuery>>,
    by_connection: RwLock<HashMap<ConnectionId, HashSet<QueryId>>>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            by_connection: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, connection_id: ConnectionId) -> (QueryId, CancellationToken) {
        loop {
            if let Ok(registered) = self
                .register_with_id(connection_id.clone(), QueryId::new())
                .await
            {
                return registered;
            }
        }
    }

    /// Registers a caller-chosen id, so the caller can cancel before the
    /// call returns.
    pub async fn register_with_id(
        &self,
        connection_id: ConnectionId,
        query_id: QueryId,
    ) -> EngineResult<(QueryId, CancellationToken)> {
        let token = CancellationToken::new();
        {
            let mut active = self.active.write().await;
            if active.contains_key(&query_id) {
                return Err(EngineError::internal("Query ID already registered"));
            }
            active.insert(
                query_id,
                ActiveQuery {
                    connection_id: connection_id.clone(),
                    token: token.clone(),
                },
            );
        }

        self.by_connection
            .write()
            .await
            .entry(connection_id)
            .or_default()
            .insert(query_id);

        Ok((query_id, token))
    }

    pub async fn finish(&self, query_id: QueryId) {
        let removed = self.active.write().await.remove(&query_id);

        if let Some(query) = removed {
            let mut by_connection = self.by_connection.write().await;
            if let Some(set) = by_connection.get_mut(&query.connection_id) {
                set.remove(&query_id);
                if set.is_empty() {
                    by_connection.remove(&query.connection_id);
                }
            }
        }
    }

    /// Cancels one in-flight query. The query stays registered until its
    /// caller finishes it.
    pub async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        let active = self.active.read().await;
        let query = active
            .get(&query_id)
            .ok_or_else(|| EngineError::internal(format!("No active query {}", query_id.0)))?;
        query.token.cancel();
        Ok(())
    }

    /// Cancels every in-flight query of a connection; returns how many.
    pub async fn cancel_connection(&self, connection_id: &ConnectionId) -> usize {
        let ids: Vec<QueryId> = self
            .by_connection
            .read()
            .await
            .get(connection_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let active = self.active.read().await;
        ids.iter()
            .filter_map(|id| active.get(id))
            .inspect(|query| query.token.cancel())
            .count()
    }

    pub async fn contains(&self, query_id: QueryId) -> bool {
        self.active.read().await.contains_key(&query_id)
    }

    pub async fn connection_for(&self, query_id: QueryId) -> Option<ConnectionId> {
        self.active
            .read()
            .await
            .get(&query_id)
            .map(|query| query.connection_id.clone())
    }
}

impl Default for QueryManager {
    fn default() -> Self {
        Self::new()
    }
}
