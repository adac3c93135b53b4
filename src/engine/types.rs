//! Universal data types for the polyquery engine
//!
//! These types provide a normalized representation of connections, results
//! and data models across relational and document engines.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::audit::AuditHook;
use crate::engine::error::{EngineError, EngineResult};
use crate::vault::{SealedSecret, Secret};

/// Opaque identity of a saved connection.
///
/// At most one live client handle exists per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a running query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Concrete backend a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    #[serde(rename = "mongodb")]
    MongoDb,
}

/// Data-model family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    RelationalSql,
    Document,
}

impl BackendKind {
    /// Stable identifier, also used as the registry key in logs.
    pub fn driver_id(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MongoDb => "mongodb",
        }
    }

    pub fn family(&self) -> BackendFamily {
        match self {
            Self::Postgres => BackendFamily::RelationalSql,
            Self::MongoDb => BackendFamily::Document,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver_id())
    }
}

/// Everything needed to reach a target database, possibly through a tunnel.
///
/// Secrets are sealed; they are only revealed by the connection manager for
/// the duration of a dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: ConnectionId,
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: String,
    /// Resolve hosts through DNS seed lists (`mongodb+srv`).
    #[serde(default)]
    pub srv: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<SealedSecret>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssh_tunnel: Option<SshTunnelConfig>,
}

impl ConnectionDescriptor {
    pub fn tunnel_mode(&self) -> TunnelMode {
        match &self.ssh_tunnel {
            None => TunnelMode::None,
            Some(ssh) => match ssh.auth {
                SshAuth::Password { .. } => TunnelMode::PasswordAuth,
                SshAuth::Key { .. } => TunnelMode::KeyAuth,
            },
        }
    }

    pub fn display_name(&self) -> String {
        format!(
            "{}@{}:{}/{}{}",
            self.username,
            self.host,
            self.port,
            if self.database.is_empty() {
                "default"
            } else {
                &self.database
            },
            if self.ssh_tunnel.is_some() { " (SSH)" } else { "" }
        )
    }
}

/// How the connection reaches the database host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelMode {
    None,
    PasswordAuth,
    KeyAuth,
}

/// SSH tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,

    /// Host key verification policy (security-critical).
    #[serde(default)]
    pub host_key_policy: SshHostKeyPolicy,

    /// Optional path to an app-owned known_hosts file.
    /// If not provided, a per-user default is used.
    #[serde(default)]
    pub known_hosts_path: Option<String>,

    /// Connection timeout in seconds for the SSH TCP handshake.
    #[serde(default = "default_ssh_connect_timeout")]
    pub connect_timeout_secs: u32,

    /// SSH keepalive interval in seconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u32,

    /// Max number of keepalive failures before disconnect.
    #[serde(default = "default_keepalive_count")]
    pub keepalive_count_max: u32,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_connect_timeout() -> u32 {
    10
}

fn default_keepalive_interval() -> u32 {
    30
}

fn default_keepalive_count() -> u32 {
    3
}

/// Host key verification policy for SSH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshHostKeyPolicy {
    /// Trust on first use: auto-add new hosts to an app-owned known_hosts file.
    #[default]
    AcceptNew,
    /// Strict: require the host key to already be present in known_hosts.
    Strict,
    /// Insecure: disable host key checking (dev-only).
    InsecureNoCheck,
}

/// SSH authentication method. Secrets stay sealed until the tunnel is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SshAuth {
    Password {
        password: SealedSecret,
    },
    /// `private_key` holds either a key file path or the key material itself.
    Key {
        private_key: SealedSecret,
        passphrase: Option<SealedSecret>,
    },
}

/// Copy of a descriptor with host/port rewritten for dialing and the
/// password revealed. Lives only as long as the dial.
#[derive(Debug)]
pub struct DialTarget {
    pub connection_id: ConnectionId,
    pub backend: BackendKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub srv: bool,
    pub username: String,
    pub password: Option<Secret>,
    pub ssl: bool,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A single result row, keyed by column/field name.
///
/// A key listed in [`TabularResult::keys`] but missing here is a null/absent
/// field.
pub type Row = HashMap<String, Value>;

/// Uniform row/column shape every backend result is normalized into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabularResult {
    /// Unique keys, in first-seen order across rows.
    pub keys: Vec<String>,
    pub rows: Vec<Row>,
    /// Total matching rows, when the caller asked for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

impl TabularResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// One row holding a fixed, ordered set of scalar fields.
    pub fn scalars<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        let mut keys = Vec::new();
        let mut row = Row::new();
        for (key, value) in fields {
            let key = key.into();
            keys.push(key.clone());
            row.insert(key, value);
        }
        Self {
            keys,
            rows: vec![row],
            count: None,
            execution_time_ms: 0.0,
        }
    }

    /// Value of `key` in the first row, if any.
    pub fn first_value(&self, key: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Generic schema description of a table or collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataModel {
    pub name: String,
    /// Empty for schema-less backends.
    pub schema_name: String,
    pub fields: Vec<DataModelField>,
    pub indexes: Vec<DataModelIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataModelField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub is_primary: bool,
    pub is_nullable: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataModelIndex {
    pub name: String,
    #[serde(rename = "indexDef")]
    pub definition: String,
}

/// Paged read of a table/collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    #[serde(default)]
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub fetch_count: bool,
    /// Document backends: a single `{...}` filter document.
    /// Relational backends: `[column, operator, value?]`.
    #[serde(default)]
    pub filter: Vec<String>,
    /// Document backends: a single sort document.
    /// Relational backends: `[column, ASC|DESC]`.
    #[serde(default)]
    pub sort: Vec<String>,
}

/// Per-call execution policy.
#[derive(Clone, Default)]
pub struct QueryConfig {
    /// Reject every write before any I/O.
    pub read_only: bool,
    /// Receives the original query text after a successful audited call.
    pub audit: Option<AuditHook>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Command names treated as writes when issued through `runCommand`.
    pub mutating_commands: Arc<[String]>,
}

impl QueryConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_audit(mut self, hook: AuditHook) -> Self {
        self.audit = Some(hook);
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_mutating_commands(mut self, commands: Arc<[String]>) -> Self {
        self.mutating_commands = commands;
        self
    }

    /// Same policy without the audit hook, for internally synthesized calls.
    pub fn unaudited(&self) -> Self {
        Self {
            audit: None,
            ..self.clone()
        }
    }

    pub fn is_mutating_command(&self, name: &str) -> bool {
        self.mutating_commands
            .iter()
            .any(|command| command.eq_ignore_ascii_case(name))
    }

    /// Forwards `query` to the audit hook, if one is configured.
    pub fn audit(&self, query: &str) {
        if let Some(hook) = &self.audit {
            hook.record(query);
        }
    }

    /// Runs a native call under this config's deadline and cancellation token.
    pub async fn guard<T, F>(&self, work: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let bounded = async {
            match self.timeout {
                Some(limit) => match timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => work.await,
            }
        };

        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    result = bounded => result,
                    _ = token.cancelled() => Err(EngineError::Cancelled),
                }
            }
            None => bounded.await,
        }
    }
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("read_only", &self.read_only)
            .field("audited", &self.audit.is_some())
            .field("timeout", &self.timeout)
            .field("cancellable", &self.cancel.is_some())
            .field("mutating_commands", &self.mutating_commands)
            .finish()
    }
}
