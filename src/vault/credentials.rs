//! Connection secrets
//!
//! Descriptors never carry plaintext: every password or key is a
//! [`SealedSecret`] reference that a [`CredentialStore`] turns into a
//! [`Secret`] right before a dial.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ConnectionId;

/// Plaintext secret. Never printed, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// At-rest reference to a secret held by a [`CredentialStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Which secret of a connection is being sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSlot {
    DatabasePassword,
    SshPassword,
    SshPrivateKey,
    SshPassphrase,
}

impl SecretSlot {
    fn suffix(&self) -> &'static str {
        match self {
            Self::DatabasePassword => "db_password",
            Self::SshPassword => "ssh_password",
            Self::SshPrivateKey => "ssh_key",
            Self::SshPassphrase => "ssh_passphrase",
        }
    }

    /// Reference under which a connection's secret is stored.
    pub fn reference(&self, connection_id: &ConnectionId) -> String {
        format!("{}/{}", connection_id, self.suffix())
    }
}

/// Decrypts at-rest secrets immediately before use.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn reveal(
        &self,
        connection_id: &ConnectionId,
        sealed: &SealedSecret,
    ) -> EngineResult<Secret>;

    async fn seal(
        &self,
        connection_id: &ConnectionId,
        slot: SecretSlot,
        plaintext: Secret,
    ) -> EngineResult<SealedSecret>;

    async fn forget(&self, connection_id: &ConnectionId, sealed: &SealedSecret) -> EngineResult<()>;
}

/// Process-local store, for embedders without an OS keychain and for tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn reveal(
        &self,
        connection_id: &ConnectionId,
        sealed: &SealedSecret,
    ) -> EngineResult<Secret> {
        self.secrets
            .read()
            .await
            .get(sealed.as_str())
            .cloned()
            .ok_or_else(|| {
                EngineError::credential(format!(
                    "No secret {} for connection {}",
                    sealed.as_str(),
                    connection_id
                ))
            })
    }

    async fn seal(
        &self,
        connection_id: &ConnectionId,
        slot: SecretSlot,
        plaintext: Secret,
    ) -> EngineResult<SealedSecret> {
        let reference = slot.reference(connection_id);
        self.secrets
            .write()
            .await
            .insert(reference.clone(), plaintext);
        Ok(SealedSecret(reference))
    }

    async fn forget(&self, _connection_id: &ConnectionId, sealed: &SealedSecret) -> EngineResult<()> {
        self.secrets.write().await.remove(sealed.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[tokio::test]
    async fn memory_store_round_trips_and_forgets() {
        let store = MemoryCredentialStore::new();
        let id = ConnectionId::new("c1");

        let sealed = store
            .seal(&id, SecretSlot::DatabasePassword, Secret::new("pw"))
            .await
            .unwrap();
        assert_eq!(sealed.as_str(), "c1/db_password");
        assert_eq!(store.reveal(&id, &sealed).await.unwrap().expose(), "pw");

        store.forget(&id, &sealed).await.unwrap();
        let err = store.reveal(&id, &sealed).await.unwrap_err();
        assert!(matches!(err, EngineError::CredentialError { .. }));
    }
}
