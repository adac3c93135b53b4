//! Keyring credential store
//!
//! Secrets live in the OS keychain; a sealed secret is the entry name.

use async_trait::async_trait;
use keyring::Entry;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ConnectionId;
use crate::vault::credentials::{CredentialStore, SealedSecret, Secret, SecretSlot};

const SERVICE_PREFIX: &str = "polyquery";

/// OS keychain backed [`CredentialStore`] with per-project isolation.
pub struct KeyringCredentialStore {
    project_id: String,
}

impl KeyringCredentialStore {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
        }
    }

    /// Gets the keyring service name for this project
    fn service_name(&self) -> String {
        service_name(&self.project_id)
    }

    /// Runs a blocking keychain call off the async executor.
    async fn with_entry<T, F>(&self, entry_name: String, op: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> EngineResult<T> + Send + 'static,
    {
        let service = self.service_name();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &entry_name)
                .map_err(|e| EngineError::credential(format!("Keyring error: {}", e)))?;
            op(entry)
        })
        .await
        .map_err(|e| EngineError::internal(format!("Keyring task failed: {}", e)))?
    }
}

fn service_name(project_id: &str) -> String {
    format!("{}_{}", SERVICE_PREFIX, project_id)
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn reveal(
        &self,
        connection_id: &ConnectionId,
        sealed: &SealedSecret,
    ) -> EngineResult<Secret> {
        let connection_id = connection_id.clone();
        self.with_entry(sealed.as_str().to_string(), move |entry| {
            match entry.get_password() {
                Ok(value) => Ok(Secret::new(value)),
                Err(keyring::Error::NoEntry) => Err(EngineError::credential(format!(
                    "Credentials not found for connection {}",
                    connection_id
                ))),
                Err(e) => Err(EngineError::credential(format!(
                    "Failed to read credentials: {}",
                    e
                ))),
            }
        })
        .await
    }

    async fn seal(
        &self,
        connection_id: &ConnectionId,
        slot: SecretSlot,
        plaintext: Secret,
    ) -> EngineResult<SealedSecret> {
        let reference = slot.reference(connection_id);
        self.with_entry(reference.clone(), move |entry| {
            entry
                .set_password(plaintext.expose())
                .map_err(|e| EngineError::credential(format!("Failed to save credentials: {}", e)))
        })
        .await?;
        Ok(SealedSecret::new(reference))
    }

    async fn forget(&self, _connection_id: &ConnectionId, sealed: &SealedSecret) -> EngineResult<()> {
        self.with_entry(sealed.as_str().to_string(), |entry| {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(EngineError::credential(format!(
                    "Failed to delete credentials: {}",
                    e
                ))),
            }
        })
        .await
    }
}
