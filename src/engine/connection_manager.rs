//! Connection Manager
//!
//! Registry of live client handles keyed by connection identity. This is the
//! single source of truth for connection state: handles are created on first
//! use, reused afterwards, and concurrent first uses of one identity share a
//! single dial.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::DriverRegistry;
use crate::engine::ssh_tunnel::{TunnelCredential, TunnelProvider, TunnelRequest};
use crate::engine::traits::ClientHandle;
use crate::engine::types::{
    BackendKind, ConnectionDescriptor, ConnectionId, DialTarget, SshAuth, SshTunnelConfig,
};
use crate::vault::CredentialStore;

/// A live handle plus what is needed to tear it down.
pub struct ManagedClient {
    pub connection_id: ConnectionId,
    pub backend: BackendKind,
    pub display_name: String,
    pub handle: ClientHandle,
    tunneled: bool,
    leases: AtomicUsize,
}

impl ManagedClient {
    fn lease(self: &Arc<Self>) -> ClientLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        ClientLease {
            client: Arc::clone(self),
        }
    }

    /// Whether some caller is still running work on this handle.
    pub fn is_leased(&self) -> bool {
        self.leases.load(Ordering::SeqCst) > 0
    }
}

/// A handle pinned for the duration of one call; idle eviction skips it.
pub struct ClientLease {
    client: Arc<ManagedClient>,
}

impl ClientLease {
    pub fn handle(&self) -> &ClientHandle {
        &self.client.handle
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.client.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

type PendingClient = Shared<BoxFuture<'static, EngineResult<Arc<ManagedClient>>>>;

enum Slot {
    Ready {
        client: Arc<ManagedClient>,
        last_used: Instant,
    },
    /// A dial is in flight; every resolver awaits the same future.
    Connecting { generation: u64, pending: PendingClient },
}

type Slots = Arc<Mutex<HashMap<ConnectionId, Slot>>>;

/// Turns a descriptor into a live client: reveals secrets, opens the
/// tunnel, rewrites the endpoint and dials.
pub struct Dialer {
    registry: Arc<DriverRegistry>,
    credentials: Arc<dyn CredentialStore>,
    tunnels: Arc<dyn TunnelProvider>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(
        registry: Arc<DriverRegistry>,
        credentials: Arc<dyn CredentialStore>,
        tunnels: Arc<dyn TunnelProvider>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            credentials,
            tunnels,
            connect_timeout,
        }
    }

    #[instrument(
        skip(self, descriptor),
        fields(
            connection_id = %descriptor.id,
            backend = %descriptor.backend,
            host = %descriptor.host,
            port = descriptor.port,
            tunnel = ?descriptor.tunnel_mode()
        )
    )]
    async fn dial(&self, descriptor: &ConnectionDescriptor) -> EngineResult<Arc<ManagedClient>> {
        let driver = self.registry.require(descriptor.backend)?;

        let work = async {
            let password = match &descriptor.password {
                Some(sealed) => Some(self.credentials.reveal(&descriptor.id, sealed).await?),
                None => None,
            };

            let mut target = DialTarget {
                connection_id: descriptor.id.clone(),
                backend: descriptor.backend,
                host: descriptor.host.clone(),
                port: descriptor.port,
                database: descriptor.database.clone(),
                srv: descriptor.srv,
                username: descriptor.username.clone(),
                password,
                ssl: descriptor.ssl,
            };

            let tunneled = match &descriptor.ssh_tunnel {
                Some(ssh) => {
                    let request = self.tunnel_request(descriptor, ssh).await?;
                    let endpoint = self.tunnels.open_tunnel(&request).await?;
                    target.host = endpoint.host;
                    target.port = endpoint.port;
                    // Seed-list lookups cannot go through a port forward.
                    target.srv = false;
                    true
                }
                None => false,
            };

            match driver.connect(&target).await {
                Ok(handle) => Ok(ManagedClient {
                    connection_id: descriptor.id.clone(),
                    backend: descriptor.backend,
                    display_name: descriptor.display_name(),
                    handle,
                    tunneled,
                    leases: AtomicUsize::new(0),
                }),
                Err(e) => {
                    if tunneled {
                        self.tunnels.close_tunnel(&descriptor.id).await;
                    }
                    Err(e)
                }
            }
        };

        let client = match timeout(self.connect_timeout, work).await {
            Ok(result) => result?,
            Err(_) => {
                if descriptor.ssh_tunnel.is_some() {
                    self.tunnels.close_tunnel(&descriptor.id).await;
                }
                return Err(EngineError::connection_failed(format!(
                    "Timed out after {}ms",
                    self.connect_timeout.as_millis()
                )));
            }
        };

        tracing::info!(driver = driver.driver_name(), "Connection established");
        Ok(Arc::new(client))
    }

    async fn tunnel_request(
        &self,
        descriptor: &ConnectionDescriptor,
        ssh: &SshTunnelConfig,
    ) -> EngineResult<TunnelRequest> {
        let credential = match &ssh.auth {
            SshAuth::Password { password } => TunnelCredential::Password(
                self.credentials.reveal(&descriptor.id, password).await?,
            ),
            SshAuth::Key {
                private_key,
                passphrase,
            } => TunnelCredential::Key {
                private_key: self.credentials.reveal(&descriptor.id, private_key).await?,
                passphrase: match passphrase {
                    Some(sealed) => Some(self.credentials.reveal(&descriptor.id, sealed).await?),
                    None => None,
                },
            },
        };

        let remote_host = match descriptor.host.trim() {
            "" => "localhost".to_string(),
            host => host.to_string(),
        };

        Ok(TunnelRequest {
            connection_id: descriptor.id.clone(),
            ssh_host: ssh.host.clone(),
            ssh_port: ssh.port,
            username: ssh.username.clone(),
            remote_host,
            remote_port: descriptor.port,
            credential,
            host_key_policy: ssh.host_key_policy,
            known_hosts_path: ssh.known_hosts_path.clone(),
            connect_timeout_secs: ssh.connect_timeout_secs,
            keepalive_interval_secs: ssh.keepalive_interval_secs,
            keepalive_count_max: ssh.keepalive_count_max,
        })
    }

    async fn release(&self, client: &ManagedClient) {
        client.handle.close().await;
        if client.tunneled {
            self.tunnels.close_tunnel(&client.connection_id).await;
        }
        tracing::info!(connection_id = %client.connection_id, "Connection closed");
    }
}

/// Owns every live client handle.
pub struct ConnectionManager {
    dialer: Arc<Dialer>,
    slots: Slots,
    next_generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(dialer: Dialer) -> Self {
        Self {
            dialer: Arc::new(dialer),
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the live handle for `descriptor.id`, dialing it if needed.
    ///
    /// A failed dial is reported to every caller that waited on it and
    /// leaves no trace, so the next call dials again.
    pub async fn resolve(&self, descriptor: &ConnectionDescriptor) -> EngineResult<ClientHandle> {
        let lease = self.acquire(descriptor).await?;
        Ok(lease.handle().clone())
    }

    /// Like [`resolve`](Self::resolve), but pins the handle against idle
    /// eviction until the lease is dropped.
    #[instrument(skip(self, descriptor), fields(connection_id = %descriptor.id))]
    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> EngineResult<ClientLease> {
        let pending = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&descriptor.id) {
                Some(Slot::Ready { client, last_used }) => {
                    *last_used = Instant::now();
                    return Ok(client.lease());
                }
                Some(Slot::Connecting { pending, .. }) => {
                    tracing::debug!("Awaiting in-flight dial");
                    pending.clone()
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let pending = self.start_dial(descriptor.clone(), generation);
                    slots.insert(
                        descriptor.id.clone(),
                        Slot::Connecting {
                            generation,
                            pending: pending.clone(),
                        },
                    );
                    pending
                }
            }
        };

        pending.await.map(|client| client.lease())
    }

    /// Spawns the dial so it completes (and settles its slot) even when
    /// every resolver gives up waiting.
    fn start_dial(&self, descriptor: ConnectionDescriptor, generation: u64) -> PendingClient {
        let dialer = Arc::clone(&self.dialer);
        let slots = Arc::clone(&self.slots);

        let task = tokio::spawn(async move {
            let result = dialer.dial(&descriptor).await;

            let mut slots = slots.lock().await;
            let current = matches!(
                slots.get(&descriptor.id),
                Some(Slot::Connecting { generation: g, .. }) if *g == generation
            );

            match result {
                Ok(client) if current => {
                    slots.insert(
                        descriptor.id.clone(),
                        Slot::Ready {
                            client: Arc::clone(&client),
                            last_used: Instant::now(),
                        },
                    );
                    Ok(client)
                }
                Ok(client) => {
                    drop(slots);
                    dialer.release(&client).await;
                    Err(EngineError::connection_failed(
                        "Connection was invalidated while connecting",
                    ))
                }
                Err(e) => {
                    if current {
                        slots.remove(&descriptor.id);
                    }
                    tracing::warn!(connection_id = %descriptor.id, error = %e, "Dial failed");
                    Err(e)
                }
            }
        });

        async move {
            task.await
                .map_err(|e| EngineError::internal(format!("Dial task failed: {}", e)))?
        }
        .boxed()
        .shared()
    }

    /// Closes the handle (and tunnel) of one connection. Returns whether
    /// anything was registered.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn invalidate(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.slots.lock().await.remove(connection_id);
        match removed {
            Some(Slot::Ready { client, .. }) => {
                self.dialer.release(&client).await;
                true
            }
            // The dial task notices the missing slot and releases its client.
            Some(Slot::Connecting { .. }) => true,
            None => false,
        }
    }

    /// Closes every handle unused for longer than `max_idle`. Leased
    /// handles are skipped.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<Arc<ManagedClient>> = {
            let mut slots = self.slots.lock().await;
            let ids: Vec<ConnectionId> = slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Ready { client, last_used } if last_used.elapsed() > max_idle => {
                        (!client.is_leased()).then(|| id.clone())
                    }
                    _ => None,
                })
                .collect();

            ids.iter()
                .filter_map(|id| match slots.remove(id) {
                    Some(Slot::Ready { client, .. }) => Some(client),
                    _ => None,
                })
                .collect()
        };

        for client in &expired {
            tracing::info!(connection_id = %client.connection_id, "Evicting idle connection");
            self.dialer.release(client).await;
        }
        expired.len()
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `interval` until the
    /// manager is dropped.
    pub fn spawn_idle_reaper(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.evict_idle(max_idle).await;
            }
        })
    }

    /// Closes every handle and tunnel.
    pub async fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            if let Slot::Ready { client, .. } = slot {
                self.dialer.release(&client).await;
            }
        }
    }

    /// Live connections with their display names.
    pub async fn list_connections(&self) -> Vec<(ConnectionId, String)> {
        let slots = self.slots.lock().await;
        let mut listed: Vec<(ConnectionId, String)> = slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Ready { client, .. } => Some((id.clone(), client.display_name.clone())),
                Slot::Connecting { .. } => None,
            })
            .collect();
        listed.sort();
        listed
    }

    pub async fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        matches!(
            self.slots.lock().await.get(connection_id),
            Some(Slot::Ready { .. })
        )
    }
}
