//! The registry of configured monitors and its admin operations.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use sqlgate_common::{Result, SqlGateError};
use sqlgate_registry::OwnershipTable;

use crate::backend::{Connector, TcpConnector};
use crate::frontend::{FrontendNotifier, NoopNotifier};
use crate::worker::Monitor;

/// Registry of configured monitors, keyed by name. All mutation happens
/// from the admin context.
pub struct MonitorRegistry {
    monitors: DashMap<String, Arc<Monitor>>,
    ownership: Arc<OwnershipTable>,
    data_dir: PathBuf,
    connector: Arc<dyn Connector>,
    frontend: Arc<dyn FrontendNotifier>,
}

impl MonitorRegistry {
    pub fn new(data_dir: impl Into<PathBuf>, ownership: Arc<OwnershipTable>) -> Self {
        MonitorRegistry {
            monitors: DashMap::new(),
            ownership,
            data_dir: data_dir.into(),
            connector: Arc::new(TcpConnector),
            frontend: Arc::new(NoopNotifier),
        }
    }

    /// Use a different backend connector, e.g. a protocol module's.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Attach the proxy front end for dead-connection hangups.
    pub fn with_frontend(mut self, frontend: Arc<dyn FrontendNotifier>) -> Self {
        self.frontend = frontend;
        self
    }

    pub fn ownership(&self) -> &Arc<OwnershipTable> {
        &self.ownership
    }

    /// Create a new stopped monitor. Fails on duplicate names and unknown
    /// modules.
    pub fn create(&self, name: &str, module: &str) -> Result<Arc<Monitor>> {
        match self.monitors.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SqlGateError::MonitorExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let monitor = Monitor::new(
                    name,
                    module,
                    &self.data_dir,
                    self.ownership.clone(),
                    self.connector.clone(),
                    self.frontend.clone(),
                )?;
                entry.insert(monitor.clone());
                info!("Created monitor '{}' with module '{}'", name, module);
                Ok(monitor)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Monitor>> {
        self.monitors.get(name).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.monitors.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Destroy a stopped monitor, releasing all of its servers.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let monitor = self
            .get(name)
            .ok_or_else(|| SqlGateError::MonitorNotFound(name.to_string()))?;
        monitor.remove_all_servers()?;
        self.monitors.remove(name);
        info!("Destroyed monitor '{}'", name);
        Ok(())
    }

    /// Stop every running monitor; used at proxy shutdown.
    pub async fn stop_all(&self) {
        let monitors: Vec<Arc<Monitor>> =
            self.monitors.iter().map(|entry| entry.clone()).collect();
        for monitor in monitors {
            if monitor.state() == crate::worker::MonitorState::Running {
                let _ = monitor.stop().await;
            }
        }
    }

    pub fn diagnostics(&self) -> serde_json::Value {
        let monitors: Vec<_> = self
            .monitors
            .iter()
            .map(|entry| entry.diagnostics())
            .collect();
        serde_json::json!({ "monitors": monitors })
    }
}
