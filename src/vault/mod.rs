//! Vault Module
//!
//! Secret handling for connection descriptors, backed by the OS keychain.

pub mod credentials;
pub mod storage;

pub use credentials::{CredentialStore, MemoryCredentialStore, SealedSecret, Secret, SecretSlot};
pub use storage::KeyringCredentialStore;
