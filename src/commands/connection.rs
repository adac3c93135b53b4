//! Connection commands
//!
//! Descriptor validation, connectivity checks and handle lifecycle.

use serde::Serialize;
use tracing::instrument;

use crate::commands::{run_on_handle, CommandResponse, RequestOptions};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ConnectionDescriptor, ConnectionId, SshAuth};
use crate::vault::SealedSecret;
use crate::AppState;

/// Live connection, as listed to callers.
#[derive(Debug, Serialize)]
pub struct ConnectionListItem {
    pub id: String,
    pub display_name: String,
}

fn require_secret(secret: &SealedSecret, what: &str) -> EngineResult<()> {
    if secret.as_str().trim().is_empty() {
        return Err(EngineError::connection_failed(format!("{} is required", what)));
    }
    Ok(())
}

/// Trims and validates a descriptor before it reaches the connection manager.
pub fn normalize_descriptor(mut descriptor: ConnectionDescriptor) -> EngineResult<ConnectionDescriptor> {
    if descriptor.id.as_str().trim().is_empty() {
        return Err(EngineError::connection_failed("Connection ID is required"));
    }

    let host = descriptor.host.trim();
    if host.is_empty() {
        return Err(EngineError::connection_failed("Host is required"));
    }
    descriptor.host = host.to_string();

    descriptor.username = descriptor.username.trim().to_string();
    descriptor.database = descriptor.database.trim().to_string();

    // SRV seed lists carry their own ports.
    if descriptor.port == 0 && !descriptor.srv {
        return Err(EngineError::connection_failed("Port must be greater than 0"));
    }

    if let Some(password) = &descriptor.password {
        require_secret(password, "Password reference")?;
    }

    if let Some(ref mut ssh) = descriptor.ssh_tunnel {
        let host = ssh.host.trim();
        if host.is_empty() {
            return Err(EngineError::connection_failed("SSH host is required"));
        }
        ssh.host = host.to_string();

        let username = ssh.username.trim();
        if username.is_empty() {
            return Err(EngineError::connection_failed("SSH username is required"));
        }
        ssh.username = username.to_string();

        if ssh.port == 0 {
            return Err(EngineError::connection_failed("SSH port must be greater than 0"));
        }

        match &ssh.auth {
            SshAuth::Password { password } => require_secret(password, "SSH password")?,
            SshAuth::Key { private_key, .. } => require_secret(private_key, "SSH key")?,
        }
    }

    Ok(descriptor)
}

/// Resolves the connection and performs a round trip on it.
///
/// A handle that fails its round trip is dropped so the next call redials.
#[instrument(
    skip(state, descriptor),
    fields(
        connection_id = %descriptor.id,
        backend = %descriptor.backend,
        ssh = descriptor.ssh_tunnel.is_some()
    )
)]
pub async fn test_connection(
    state: &AppState,
    descriptor: ConnectionDescriptor,
) -> CommandResponse<()> {
    let connection_id = descriptor.id.clone();
    let response = run_on_handle(
        state,
        descriptor,
        &RequestOptions::read_only(),
        false,
        |handle, config| async move { handle.test_connection(&config).await },
    )
    .await;

    if !response.success {
        state.connections.invalidate(&connection_id).await;
    }
    response
}

/// Cancels the connection's in-flight queries and closes its handle.
///
/// Reports whether a handle was open.
#[instrument(skip(state), fields(connection_id = %connection_id))]
pub async fn disconnect(state: &AppState, connection_id: String) -> CommandResponse<bool> {
    let connection_id = ConnectionId::new(connection_id.trim());
    let cancelled = state.queries.cancel_connection(&connection_id).await;
    let closed = state.connections.invalidate(&connection_id).await;

    tracing::info!(cancelled, closed, "Disconnected");
    CommandResponse::ok(closed)
}

pub async fn list_connections(state: &AppState) -> CommandResponse<Vec<ConnectionListItem>> {
    let items = state
        .connections
        .list_connections()
        .await
        .into_iter()
        .map(|(id, display_name)| ConnectionListItem {
            id: id.to_string(),
            display_name,
        })
        .collect();
    CommandResponse::ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{descriptor, harness};
    use crate::config::EngineConfig;
    use crate::engine::testing::StubDriver;
    use crate::engine::types::{BackendKind, SshHostKeyPolicy, SshTunnelConfig};
    use crate::engine::ErrorKind;

    fn ssh(host: &str, auth: SshAuth) -> SshTunnelConfig {
        SshTunnelConfig {
            host: host.into(),
            port: 22,
            username: " deploy ".into(),
            auth,
            host_key_policy: SshHostKeyPolicy::Strict,
            known_hosts_path: None,
            connect_timeout_secs: 10,
            keepalive_interval_secs: 30,
            keepalive_count_max: 3,
        }
    }

    #[test]
    fn normalize_trims_fields() {
        let mut input = descriptor("c1");
        input.username = "  app ".into();
        input.database = " sales ".into();
        input.ssh_tunnel = Some(ssh(
            " bastion ",
            SshAuth::Password {
                password: SealedSecret::new("c1/ssh_password"),
            },
        ));

        let normalized = normalize_descriptor(input).unwrap();
        assert_eq!(normalized.host, "db.internal");
        assert_eq!(normalized.username, "app");
        assert_eq!(normalized.database, "sales");
        let tunnel = normalized.ssh_tunnel.unwrap();
        assert_eq!(tunnel.host, "bastion");
        assert_eq!(tunnel.username, "deploy");
    }

    #[test]
    fn normalize_rejects_missing_pieces() {
        let mut no_host = descriptor("c1");
        no_host.host = "   ".into();
        assert!(normalize_descriptor(no_host).is_err());

        let mut no_port = descriptor("c1");
        no_port.port = 0;
        assert!(normalize_descriptor(no_port).is_err());

        let mut empty_key = descriptor("c1");
        empty_key.ssh_tunnel = Some(ssh(
            "bastion",
            SshAuth::Key {
                private_key: SealedSecret::new(" "),
                passphrase: None,
            },
        ));
        let err = normalize_descriptor(empty_key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().contains("SSH key"));
    }

    #[test]
    fn srv_descriptors_may_omit_the_port() {
        let mut input = descriptor("c1");
        input.backend = BackendKind::MongoDb;
        input.srv = true;
        input.port = 0;
        assert!(normalize_descriptor(input).is_ok());
    }

    #[tokio::test]
    async fn test_connection_keeps_a_healthy_handle() {
        let h = harness(EngineConfig::default(), StubDriver::new(BackendKind::Postgres));

        let response = test_connection(&h.state, descriptor("c1")).await;
        assert!(response.success);
        assert!(h.state.connections.is_connected(&ConnectionId::new("c1")).await);

        let listed = list_connections(&h.state).await.data.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "c1");
        assert!(listed[0].display_name.contains("db.internal"));
    }

    #[tokio::test]
    async fn failed_test_leaves_nothing_behind() {
        let h = harness(EngineConfig::default(), StubDriver::new(BackendKind::Postgres));
        h.driver.fail_next(EngineError::connection_failed("refused"));

        let response = test_connection(&h.state, descriptor("c1")).await;
        assert!(!response.success);
        assert_eq!(response.error_kind, Some(ErrorKind::Connection));
        assert!(!h.state.connections.is_connected(&ConnectionId::new("c1")).await);

        assert!(test_connection(&h.state, descriptor("c1")).await.success);
        assert_eq!(h.driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn disconnect_closes_the_handle_once() {
        let h = harness(EngineConfig::default(), StubDriver::new(BackendKind::Postgres));
        assert!(test_connection(&h.state, descriptor("c1")).await.success);

        assert_eq!(disconnect(&h.state, "c1".into()).await.data, Some(true));
        assert_eq!(disconnect(&h.state, "c1".into()).await.data, Some(false));
        assert_eq!(h.driver.last_handle().unwrap().close_count(), 1);
        assert!(list_connections(&h.state).await.data.unwrap().is_empty());
    }
}
