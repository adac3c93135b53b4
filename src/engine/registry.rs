//! Driver Registry
//!
//! Central registry for all available database drivers, keyed by backend.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::Driver;
use crate::engine::types::BackendKind;

/// Registry that holds all available database drivers
pub struct DriverRegistry {
    drivers: HashMap<BackendKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registers a driver, replacing any previous one for the same backend.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.backend(), driver);
    }

    /// Gets the driver for a backend
    pub fn get(&self, backend: BackendKind) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&backend).cloned()
    }

    /// Like [`get`](Self::get), but a missing driver is an error.
    pub fn require(&self, backend: BackendKind) -> EngineResult<Arc<dyn Driver>> {
        self.get(backend)
            .ok_or_else(|| EngineError::driver_not_found(backend.driver_id()))
    }

    /// Lists all registered backends
    pub fn list(&self) -> Vec<BackendKind> {
        self.drivers.keys().copied().collect()
    }

    /// Returns the number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true if no drivers are registered
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
