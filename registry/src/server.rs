use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use sqlgate_common::event::MonitorEvent;
use sqlgate_common::status::{
    status_string, SERVER_DRAINING, SERVER_MAINT, SERVER_ROLE_BITS, SERVER_RUNNING,
};

use crate::secret::Secret;

/// Disk-space thresholds: mount path to maximum used percentage. The key
/// `"*"` applies to every mount not listed explicitly.
pub type DiskSpaceLimits = HashMap<String, i32>;

fn default_protocol() -> String {
    "mariadb".to_string()
}

/// Operator-supplied definition of a backend server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Monitor user override; empty means the monitor's cluster credentials.
    #[serde(default)]
    pub monitor_user: String,
    /// Stored form of the override password.
    #[serde(default, skip_serializing)]
    pub monitor_password: String,
    #[serde(default)]
    pub disk_space_limits: DiskSpaceLimits,
}

/// Read-only snapshot of a server for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub status: String,
    pub last_event: Option<MonitorEvent>,
}

/// A backend database server.
///
/// Lives for the process lifetime unless explicitly destroyed. The status
/// bitmap is shared between the owning monitor task (all bits) and the
/// admin context (admin bits, routed through the monitor's status-request
/// rendezvous while the monitor runs).
pub struct BackendServer {
    name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    status: AtomicU64,
    monitor_user: String,
    monitor_password: Secret,
    disk_space_limits: RwLock<DiskSpaceLimits>,
    // Replication topology as reported by the backend; -1 when unknown.
    node_id: AtomicI64,
    master_id: AtomicI64,
    last_event: RwLock<Option<(MonitorEvent, SystemTime)>>,
}

impl BackendServer {
    /// A new server is assumed to be running until a monitor proves
    /// otherwise.
    pub fn new(config: ServerConfig) -> Self {
        BackendServer {
            name: config.name,
            address: config.address,
            port: config.port,
            protocol: config.protocol,
            status: AtomicU64::new(SERVER_RUNNING),
            monitor_user: config.monitor_user,
            monitor_password: Secret::new(config.monitor_password),
            disk_space_limits: RwLock::new(config.disk_space_limits),
            node_id: AtomicI64::new(-1),
            master_id: AtomicI64::new(-1),
            last_event: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `[address]:port` form used in logs and script arguments.
    pub fn address_string(&self) -> String {
        format!("[{}]:{}", self.address, self.port)
    }

    pub fn status(&self) -> u64 {
        self.status.load(Ordering::Acquire)
    }

    /// Atomically set bits in the status bitmap.
    pub fn set_status(&self, bits: u64) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    /// Atomically clear bits in the status bitmap. Clearing `RUNNING` also
    /// clears the role bits.
    pub fn clear_status(&self, bits: u64) {
        let mut bits = bits;
        if bits & SERVER_RUNNING != 0 {
            bits |= SERVER_ROLE_BITS;
        }
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Replace the whole bitmap. Used by the monitor's flush and journal
    /// load, which are the single writer by construction.
    pub fn assign_status(&self, status: u64) {
        self.status.store(status, Ordering::Release);
    }

    pub fn status_string(&self) -> String {
        status_string(self.status())
    }

    pub fn is_running(&self) -> bool {
        self.status() & SERVER_RUNNING != 0
    }

    pub fn is_down(&self) -> bool {
        !self.is_running()
    }

    pub fn in_maint(&self) -> bool {
        self.status() & SERVER_MAINT != 0
    }

    pub fn is_draining(&self) -> bool {
        self.status() & SERVER_DRAINING != 0
    }

    /// Running and not in maintenance.
    pub fn is_usable(&self) -> bool {
        let status = self.status();
        status & SERVER_RUNNING != 0 && status & SERVER_MAINT == 0
    }

    /// Has any cluster role.
    pub fn is_in_cluster(&self) -> bool {
        self.status() & SERVER_ROLE_BITS != 0
    }

    pub fn monitor_user(&self) -> &str {
        &self.monitor_user
    }

    pub fn monitor_password(&self) -> &Secret {
        &self.monitor_password
    }

    pub fn disk_space_limits(&self) -> DiskSpaceLimits {
        self.disk_space_limits.read().clone()
    }

    pub fn set_disk_space_limits(&self, limits: DiskSpaceLimits) {
        *self.disk_space_limits.write() = limits;
    }

    pub fn node_id(&self) -> i64 {
        self.node_id.load(Ordering::Acquire)
    }

    pub fn set_node_id(&self, id: i64) {
        self.node_id.store(id, Ordering::Release);
    }

    pub fn master_id(&self) -> i64 {
        self.master_id.load(Ordering::Acquire)
    }

    pub fn set_master_id(&self, id: i64) {
        self.master_id.store(id, Ordering::Release);
    }

    pub fn last_event(&self) -> Option<MonitorEvent> {
        self.last_event.read().map(|(event, _)| event)
    }

    pub fn triggered_at(&self) -> Option<SystemTime> {
        self.last_event.read().map(|(_, at)| at)
    }

    pub fn record_event(&self, event: MonitorEvent, at: SystemTime) {
        *self.last_event.write() = Some((event, at));
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            protocol: self.protocol.clone(),
            status: self.status_string(),
            last_event: self.last_event(),
        }
    }
}

impl std::fmt::Debug for BackendServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendServer")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("status", &self.status_string())
            .finish()
    }
}
