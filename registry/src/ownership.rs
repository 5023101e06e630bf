use parking_lot::Mutex;
use std::collections::HashMap;

use sqlgate_common::{Result, SqlGateError};

/// Global mapping from server name to the monitor that owns it.
///
/// A server may be monitored by at most one monitor. All mutation happens
/// from the admin context; the lock expresses that convention instead of
/// relying on ambient single-threadedness.
#[derive(Default)]
pub struct OwnershipTable {
    owners: Mutex<HashMap<String, String>>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        OwnershipTable::default()
    }

    /// Mark `monitor` as the owner of `server`. Fails with the existing
    /// owner's name if the server is already claimed.
    pub fn claim(&self, server: &str, monitor: &str) -> Result<()> {
        let mut owners = self.owners.lock();
        if let Some(owner) = owners.get(server) {
            return Err(SqlGateError::ServerClaimed {
                server: server.to_string(),
                owner: owner.clone(),
            });
        }
        owners.insert(server.to_string(), monitor.to_string());
        Ok(())
    }

    /// Mark a server as unmonitored. The owning monitor must be stopped.
    pub fn release(&self, server: &str) {
        let removed = self.owners.lock().remove(server);
        debug_assert!(removed.is_some(), "releasing unclaimed server {}", server);
    }

    /// The owning monitor's name, if any.
    pub fn claimed_by(&self, server: &str) -> Option<String> {
        self.owners.lock().get(server).cloned()
    }
}
