//! Query audit log
//!
//! Successful queries are handed to an [`AuditSink`] through a bounded channel
//! drained by a single background task, so a slow or failing sink never
//! blocks query execution.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::engine::error::EngineResult;
use crate::engine::types::ConnectionId;

/// One audited query.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub connection_id: ConnectionId,
    pub query: String,
    pub recorded_at: DateTime<Utc>,
}

/// Destination of audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> EngineResult<()>;
}

/// Writes entries as structured tracing events.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> EngineResult<()> {
        tracing::info!(
            target: "polyquery::audit",
            connection_id = %entry.connection_id,
            recorded_at = %entry.recorded_at.to_rfc3339(),
            query = %entry.query,
            "query executed"
        );
        Ok(())
    }
}

/// Owner of the audit queue and its drain task.
pub struct AuditLog {
    // The only strong sender; hooks hold weak ones so closing the log ends the drain.
    sender: StdMutex<Option<mpsc::Sender<AuditEntry>>>,
    weak_sender: mpsc::WeakSender<AuditEntry>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Starts the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(capacity.max(1));

        let drain = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let connection_id = entry.connection_id.clone();
                if let Err(e) = sink.record(entry).await {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "Audit sink failed; entry dropped"
                    );
                }
            }
        });

        Self {
            weak_sender: tx.downgrade(),
            sender: StdMutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Hook bound to one connection, attached to a [`QueryConfig`](crate::engine::types::QueryConfig).
    pub fn hook(&self, connection_id: ConnectionId) -> AuditHook {
        AuditHook {
            connection_id,
            sender: self.weak_sender.clone(),
        }
    }

    /// Stops accepting entries and waits until the queue is flushed.
    ///
    /// Hooks still held by callers become no-ops once the log is closed.
    pub async fn close(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        if let Some(drain) = self.drain.lock().await.take() {
            if let Err(e) = drain.await {
                tracing::warn!(error = %e, "Audit drain task ended abnormally");
            }
        }
    }
}

/// Cloneable, non-blocking handle that enqueues audit entries.
#[derive(Clone)]
pub struct AuditHook {
    connection_id: ConnectionId,
    sender: mpsc::WeakSender<AuditEntry>,
}

impl AuditHook {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Enqueues `query`. A full queue drops the entry with a warning.
    pub fn record(&self, query: &str) {
        let Some(sender) = self.sender.upgrade() else {
            tracing::debug!(connection_id = %self.connection_id, "Audit log closed; entry dropped");
            return;
        };

        let entry = AuditEntry {
            connection_id: self.connection_id.clone(),
            query: query.to_string(),
            recorded_at: Utc::now(),
        };

        match sender.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.connection_id, "Audit queue full; entry dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.connection_id, "Audit log closed; entry dropped");
            }
        }
    }
}

impl fmt::Debug for AuditHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditHook")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
