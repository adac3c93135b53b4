//! SSH Tunnel
//!
//! Provides SSH tunneling for connecting to databases behind firewalls.
//! Uses the native OpenSSH client for maximum compatibility; password
//! authentication goes through `sshpass`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ConnectionId, SshHostKeyPolicy, TunnelMode};
use crate::vault::Secret;

const READINESS_POLL_MS: u64 = 100;
const READINESS_GRACE_SECS: u64 = 5;

/// Address the database driver should dial instead of the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub host: String,
    pub port: u16,
}

/// Revealed SSH credential, alive only while the tunnel is being opened.
#[derive(Debug)]
pub enum TunnelCredential {
    Password(Secret),
    /// Either a key file path or the key material itself.
    Key {
        private_key: Secret,
        passphrase: Option<Secret>,
    },
}

/// Everything a provider needs to open one tunnel.
#[derive(Debug)]
pub struct TunnelRequest {
    pub connection_id: ConnectionId,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub credential: TunnelCredential,
    pub host_key_policy: SshHostKeyPolicy,
    pub known_hosts_path: Option<String>,
    pub connect_timeout_secs: u32,
    pub keepalive_interval_secs: u32,
    pub keepalive_count_max: u32,
}

impl TunnelRequest {
    pub fn mode(&self) -> TunnelMode {
        match self.credential {
            TunnelCredential::Password(_) => TunnelMode::PasswordAuth,
            TunnelCredential::Key { .. } => TunnelMode::KeyAuth,
        }
    }
}

/// Opens and closes tunnels on behalf of the connection manager.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Idempotent per connection id: a live tunnel is reused.
    async fn open_tunnel(&self, request: &TunnelRequest) -> EngineResult<LocalEndpoint>;

    async fn close_tunnel(&self, connection_id: &ConnectionId);
}

/// Represents an active SSH tunnel using native OpenSSH
pub struct SshTunnel {
    local_port: u16,
    process: Option<Child>,
    key_file: Option<PathBuf>,
}

impl SshTunnel {
    /// Opens an SSH tunnel to the remote database.
    ///
    /// This spawns an `ssh -N -L` process and waits until the forwarded
    /// port accepts connections or ssh exits.
    pub async fn open(request: &TunnelRequest) -> EngineResult<Self> {
        // Find an available local port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| EngineError::ssh(format!("Failed to bind local port: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| EngineError::ssh(format!("Failed to get local address: {}", e)))?
            .port();
        // Drop the listener so ssh can bind to this port
        drop(listener);

        let known_hosts = known_hosts_file(request).await?;

        let mut tunnel = Self {
            local_port,
            process: None,
            key_file: None,
        };

        let mut cmd = match &request.credential {
            TunnelCredential::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password.expose());
                cmd
            }
            TunnelCredential::Key {
                passphrase: Some(_),
                ..
            } => {
                return Err(EngineError::ssh(
                    "Passphrase-protected keys are not supported. Load the key into ssh-agent instead.",
                ));
            }
            TunnelCredential::Key { private_key, .. } => {
                if looks_like_key_material(private_key.expose()) {
                    tunnel.key_file = Some(write_key_file(private_key).await?);
                }
                Command::new("ssh")
            }
        };

        let identity = match (&request.credential, &tunnel.key_file) {
            (_, Some(path)) => Some(path.to_string_lossy().into_owned()),
            (TunnelCredential::Key { private_key, .. }, None) => {
                Some(private_key.expose().to_string())
            }
            _ => None,
        };

        cmd.args(build_ssh_args(
            request,
            local_port,
            identity.as_deref(),
            known_hosts.as_deref(),
        ));

        // Spawn the SSH process
        let process = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let program = match request.mode() {
                    TunnelMode::PasswordAuth => "sshpass",
                    _ => "ssh",
                };
                EngineError::ssh(format!(
                    "Failed to spawn {}: {}. Is OpenSSH installed?",
                    program, e
                ))
            })?;
        tunnel.process = Some(process);

        let deadline = Duration::from_secs(
            u64::from(request.connect_timeout_secs) + READINESS_GRACE_SECS,
        );
        tunnel.wait_ready(deadline).await?;

        Ok(tunnel)
    }

    async fn wait_ready(&mut self, limit: Duration) -> EngineResult<()> {
        let started = Instant::now();
        loop {
            let Some(process) = self.process.as_mut() else {
                return Err(EngineError::ssh("SSH process is gone"));
            };

            if let Some(status) = process
                .try_wait()
                .map_err(|e| EngineError::ssh(format!("Failed to poll SSH process: {}", e)))?
            {
                let mut stderr = String::new();
                if let Some(mut pipe) = process.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(EngineError::ssh(format!(
                    "SSH exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }

            if tokio::net::TcpStream::connect(("127.0.0.1", self.local_port))
                .await
                .is_ok()
            {
                return Ok(());
            }

            if started.elapsed() >= limit {
                return Err(EngineError::ssh(format!(
                    "Tunnel not ready after {}s",
                    limit.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(READINESS_POLL_MS)).await;
        }
    }

    /// Returns the local port to connect to
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn endpoint(&self) -> LocalEndpoint {
        LocalEndpoint {
            host: "127.0.0.1".to_string(),
            port: self.local_port,
        }
    }

    /// False once the ssh process has exited.
    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Closes the tunnel
    pub async fn close(&mut self) -> EngineResult<()> {
        self.remove_key_file();
        if let Some(mut process) = self.process.take() {
            process
                .kill()
                .await
                .map_err(|e| EngineError::ssh(format!("Failed to kill SSH process: {}", e)))?;
        }
        Ok(())
    }

    fn remove_key_file(&mut self) {
        if let Some(path) = self.key_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.remove_key_file();
        if let Some(mut process) = self.process.take() {
            // Best effort kill on drop
            let _ = process.start_kill();
        }
    }
}

/// Builds the ssh argument list (without the program name).
pub fn build_ssh_args(
    request: &TunnelRequest,
    local_port: u16,
    identity_file: Option<&str>,
    known_hosts_file: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-N".into()];
    let mut option = |value: String| {
        args.push("-o".into());
        args.push(value);
    };

    option("ExitOnForwardFailure=yes".into());
    option(format!("ConnectTimeout={}", request.connect_timeout_secs));
    option(format!(
        "ServerAliveInterval={}",
        request.keepalive_interval_secs
    ));
    option(format!("ServerAliveCountMax={}", request.keepalive_count_max));

    match request.host_key_policy {
        SshHostKeyPolicy::AcceptNew => option("StrictHostKeyChecking=accept-new".into()),
        SshHostKeyPolicy::Strict => option("StrictHostKeyChecking=yes".into()),
        SshHostKeyPolicy::InsecureNoCheck => option("StrictHostKeyChecking=no".into()),
    }
    match (request.host_key_policy, known_hosts_file) {
        (SshHostKeyPolicy::InsecureNoCheck, _) => option("UserKnownHostsFile=/dev/null".into()),
        (_, Some(path)) => option(format!("UserKnownHostsFile={}", path)),
        (_, None) => {}
    }

    match request.credential {
        TunnelCredential::Password(_) => {
            option("PreferredAuthentications=password,keyboard-interactive".into());
            option("PubkeyAuthentication=no".into());
        }
        TunnelCredential::Key { .. } => {
            option("BatchMode=yes".into());
            option("IdentitiesOnly=yes".into());
        }
    }

    if let Some(identity) = identity_file {
        args.push("-i".into());
        args.push(identity.to_string());
    }

    args.push("-L".into());
    args.push(format!(
        "127.0.0.1:{}:{}:{}",
        local_port, request.remote_host, request.remote_port
    ));
    args.push("-p".into());
    args.push(request.ssh_port.to_string());
    args.push(format!("{}@{}", request.username, request.ssh_host));
    args
}

fn looks_like_key_material(value: &str) -> bool {
    value.trim_start().starts_with("-----BEGIN")
}

async fn write_key_file(key: &Secret) -> EngineResult<PathBuf> {
    use tokio::io::AsyncWriteExt;

    let path = std::env::temp_dir().join(format!("polyquery-{}.key", Uuid::new_v4()));
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&path)
        .await
        .map_err(|e| EngineError::ssh(format!("Failed to write private key: {}", e)))?;
    let mut material = key.expose().trim().to_string();
    material.push('\n');
    file.write_all(material.as_bytes())
        .await
        .map_err(|e| EngineError::ssh(format!("Failed to write private key: {}", e)))?;
    Ok(path)
}

async fn known_hosts_file(request: &TunnelRequest) -> EngineResult<Option<String>> {
    if request.host_key_policy == SshHostKeyPolicy::InsecureNoCheck {
        return Ok(None);
    }
    let path = match &request.known_hosts_path {
        Some(path) => PathBuf::from(path),
        None => match default_known_hosts() {
            Some(path) => path,
            None => return Ok(None),
        },
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::ssh(format!("Failed to prepare known_hosts: {}", e)))?;
    }
    Ok(Some(path.to_string_lossy().into_owned()))
}

fn default_known_hosts() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    Some(Path::new(&home).join(".polyquery").join("known_hosts"))
}

/// [`TunnelProvider`] spawning one OpenSSH process per connection.
#[derive(Default)]
pub struct OpenSshTunnelProvider {
    tunnels: Mutex<HashMap<ConnectionId, SshTunnel>>,
}

impl OpenSshTunnelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn active_tunnels(&self) -> usize {
        self.tunnels.lock().await.len()
    }
}

#[async_trait]
impl TunnelProvider for OpenSshTunnelProvider {
    #[instrument(
        skip(self, request),
        fields(
            connection_id = %request.connection_id,
            ssh_host = %request.ssh_host,
            mode = ?request.mode()
        )
    )]
    async fn open_tunnel(&self, request: &TunnelRequest) -> EngineResult<LocalEndpoint> {
        {
            let mut tunnels = self.tunnels.lock().await;
            if let Some(tunnel) = tunnels.get_mut(&request.connection_id) {
                if tunnel.is_alive() {
                    return Ok(tunnel.endpoint());
                }
                tracing::info!("SSH tunnel exited; reopening");
                tunnels.remove(&request.connection_id);
            }
        }

        let mut opened = SshTunnel::open(request).await?;

        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.get_mut(&request.connection_id) {
            if existing.is_alive() {
                let endpoint = existing.endpoint();
                drop(tunnels);
                let _ = opened.close().await;
                return Ok(endpoint);
            }
        }
        let endpoint = opened.endpoint();
        tracing::info!(local_port = endpoint.port, "SSH tunnel ready");
        tunnels.insert(request.connection_id.clone(), opened);
        Ok(endpoint)
    }

    async fn close_tunnel(&self, connection_id: &ConnectionId) {
        let removed = self.tunnels.lock().await.remove(connection_id);
        if let Some(mut tunnel) = removed {
            if let Err(e) = tunnel.close().await {
                tracing::warn!(connection_id = %connection_id, error = %e, "Failed to close SSH tunnel");
            }
        }
    }
}
