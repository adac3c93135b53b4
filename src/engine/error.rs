//! Engine errors
//!
//! Every failure the engine surfaces maps onto a small, stable set of
//! [`ErrorKind`]s that callers can branch on, while the `Display` text stays
//! human-readable.

use serde::Serialize;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Dial, authentication, tunnel or credential failure.
    Connection,
    /// Malformed query text.
    Translation,
    /// Write attempted under a read-only policy.
    Permission,
    /// Native driver failure while executing or decoding.
    Driver,
    /// Operation meaningless for this backend.
    NotSupported,
    Timeout,
    Cancelled,
    Internal,
}

/// Errors produced by the data engine.
///
/// `Clone` so that a single failed dial can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("SSH tunnel error: {message}")]
    SshError { message: String },

    #[error("Credential error: {message}")]
    CredentialError { message: String },

    #[error("Syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Operation blocked: read-only mode ({operation})")]
    ReadOnlyViolation { operation: String },

    #[error("Execution error: {message}")]
    ExecutionError { message: String },

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    #[error("Driver not found: {driver}")]
    DriverNotFound { driver: String },

    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn ssh(message: impl Into<String>) -> Self {
        Self::SshError {
            message: message.into(),
        }
    }

    pub fn credential(message: impl Into<String>) -> Self {
        Self::CredentialError {
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: message.into(),
        }
    }

    pub fn read_only_violation(operation: impl Into<String>) -> Self {
        Self::ReadOnlyViolation {
            operation: operation.into(),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    pub fn connection_not_found(connection_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. }
            | Self::AuthFailed { .. }
            | Self::SshError { .. }
            | Self::CredentialError { .. }
            | Self::DriverNotFound { .. }
            | Self::ConnectionNotFound { .. } => ErrorKind::Connection,
            Self::SyntaxError { .. } => ErrorKind::Translation,
            Self::ReadOnlyViolation { .. } => ErrorKind::Permission,
            Self::ExecutionError { .. } => ErrorKind::Driver,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}
