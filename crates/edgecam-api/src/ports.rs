// ── Process-wide port ownership ──
//
// Several sessions may run in one process, each wanting a broker port and
// a webserver port. A `PortRegistry` records who holds which port so a
// second claimant fails fast with a clear owner instead of an opaque bind
// error. Leases release on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Error;

/// Shared table of claimed ports. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    inner: Arc<Mutex<HashMap<u16, String>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port` for `owner`. Fails with [`Error::PortInUse`] naming the
    /// current holder if the port is already leased.
    pub fn acquire(&self, port: u16, owner: impl Into<String>) -> Result<PortLease, Error> {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = table.get(&port) {
            return Err(Error::PortInUse {
                port,
                owner: holder.clone(),
            });
        }
        let owner = owner.into();
        tracing::debug!(port, owner = %owner, "port leased");
        table.insert(port, owner);
        Ok(PortLease {
            port,
            registry: self.clone(),
        })
    }

    /// Current holder of `port`, if any.
    pub fn owner_of(&self, port: u16) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .cloned()
    }

    fn release(&self, port: u16) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
        tracing::debug!(port, "port released");
    }
}

/// RAII guard for a claimed port.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    registry: PortRegistry,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.registry.release(self.port);
    }
}
