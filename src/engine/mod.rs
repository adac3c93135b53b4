// Data Engine Module
// Universal abstraction layer for all database engines

pub mod audit;
pub mod connection_manager;
pub mod document;
pub mod drivers;
pub mod error;
pub mod query_manager;
pub mod registry;
pub mod sql_safety;
pub mod ssh_tunnel;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use audit::{AuditHook, AuditLog, AuditSink, TracingAuditSink};
pub use connection_manager::{ClientLease, ConnectionManager, Dialer};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use query_manager::QueryManager;
pub use registry::DriverRegistry;
pub use traits::{ClientHandle, DataEngine, Driver};
pub use types::*;
