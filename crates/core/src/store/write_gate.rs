use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{DatabaseError, Result};

/// Single logical writer per device.
///
/// Held around each local mutation (store write + queue enqueue) by the library
/// service and around the engine's local apply steps. Never held across an
/// `.await`.
#[derive(Debug, Clone, Default)]
pub struct WriteGate(Arc<Mutex<()>>);

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.0
            .lock()
            .map_err(|_| DatabaseError::Internal("Write gate is poisoned".to_string()).into())
    }
}
