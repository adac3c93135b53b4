// polyquery - uniform query engine over relational and document databases
// Core library

pub mod commands;
pub mod config;
pub mod engine;
pub mod observability;
pub mod vault;

use std::sync::{Arc, Mutex as StdMutex};

use tokio::task::JoinHandle;

use config::EngineConfig;
use engine::audit::{AuditLog, AuditSink, TracingAuditSink};
use engine::drivers::mongodb::MongoDriver;
use engine::drivers::postgres::PostgresDriver;
use engine::ssh_tunnel::{OpenSshTunnelProvider, TunnelProvider};
use engine::{ConnectionManager, Dialer, DriverRegistry, QueryManager};
use vault::{CredentialStore, KeyringCredentialStore};

pub type SharedState = Arc<AppState>;

/// External services the engine depends on.
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialStore>,
    pub tunnels: Arc<dyn TunnelProvider>,
    pub audit_sink: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// OS keychain, system OpenSSH and `tracing`-backed audit.
    pub fn system(project_id: &str) -> Self {
        Self {
            credentials: Arc::new(KeyringCredentialStore::new(project_id)),
            tunnels: Arc::new(OpenSshTunnelProvider::new()),
            audit_sink: Arc::new(TracingAuditSink),
        }
    }
}

/// Composition root: every long-lived engine component.
pub struct AppState {
    pub config: EngineConfig,
    pub registry: Arc<DriverRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub queries: Arc<QueryManager>,
    pub audit: AuditLog,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Registers the PostgreSQL and MongoDB drivers.
    ///
    /// Spawns the audit drain and idle reaper, so it must run inside a
    /// Tokio runtime.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let mut registry = DriverRegistry::new();

        registry.register(Arc::new(PostgresDriver::new()));
        registry.register(Arc::new(MongoDriver::new().with_sample_size(config.sample_size)));

        Self::with_registry(config, registry, collaborators)
    }

    pub fn with_registry(
        config: EngineConfig,
        registry: DriverRegistry,
        collaborators: Collaborators,
    ) -> Self {
        let registry = Arc::new(registry);
        let dialer = Dialer::new(
            Arc::clone(&registry),
            collaborators.credentials,
            collaborators.tunnels,
            config.connect_timeout(),
        );
        let connections = Arc::new(ConnectionManager::new(dialer));
        let audit = AuditLog::spawn(collaborators.audit_sink, config.audit_queue);

        let reaper = config.idle_timeout().map(|max_idle| {
            let interval = (max_idle / 4).max(std::time::Duration::from_secs(1));
            connections.spawn_idle_reaper(interval, max_idle)
        });

        tracing::info!(
            drivers = registry.len(),
            force_read_only = config.force_read_only,
            idle_timeout_secs = config.idle_timeout_secs,
            "Engine started"
        );

        Self {
            config,
            registry,
            connections,
            queries: Arc::new(QueryManager::new()),
            audit,
            reaper: StdMutex::new(reaper),
        }
    }

    /// Stops the reaper, closes every connection and flushes the audit queue.
    pub async fn shutdown(&self) {
        let reaper = match self.reaper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        self.connections.shutdown().await;
        self.audit.close().await;
        tracing::info!("Engine stopped");
    }
}

/// Loads the user config, installs logging and builds the shared state.
pub fn run(project_id: &str) -> SharedState {
    observability::init_tracing();
    let config = EngineConfig::load();
    Arc::new(AppState::new(config, Collaborators::system(project_id)))
}
