//! Module-specific monitor logic.
//!
//! The generic worker drives the tick loop; what a "master" or "synced"
//! server means is decided by the module. The worker calls each hook once
//! per tick through a trait object.

use async_trait::async_trait;
use tracing::warn;

use sqlgate_common::status::{SERVER_JOINED, SERVER_MASTER, SERVER_ROLE_BITS, SERVER_SLAVE,
    SERVER_WAS_MASTER};
use sqlgate_common::{Result, SqlGateError};

use crate::backend::{QueryError, ReportedRole};
use crate::server::MonitorServer;

#[async_trait]
pub trait MonitorModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Statement run against every server during the one-time permissions
    /// check.
    fn permission_probe(&self) -> &'static str;

    /// Called at the start of every tick, before any server is probed.
    async fn pre_tick(&mut self, _servers: &mut [MonitorServer]) {}

    /// Derive role bits for one server after a successful probe. The
    /// worker has already set `RUNNING` on the pending status.
    async fn update_server_status(&mut self, server: &mut MonitorServer);

    /// Cluster-wide pass after every server was probed. Returns the index
    /// of the server to record as master in the journal.
    async fn post_tick(&mut self, servers: &mut [MonitorServer]) -> Option<usize>;

    /// When true, the worker ticks without waiting for the interval.
    fn immediate_tick_required(&self) -> bool {
        false
    }
}

/// Look up a module implementation by its configured name.
pub fn create_module(name: &str) -> Result<Box<dyn MonitorModule>> {
    match name {
        "replication" => Ok(Box::new(ReplicationModule)),
        other => Err(SqlGateError::UnknownModule(other.to_string())),
    }
}

/// The stock module: roles follow what each backend reports about its own
/// replication state.
pub struct ReplicationModule;

#[async_trait]
impl MonitorModule for ReplicationModule {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn permission_probe(&self) -> &'static str {
        "SHOW SLAVE STATUS"
    }

    async fn update_server_status(&mut self, server: &mut MonitorServer) {
        let Some(conn) = server.conn.as_mut() else {
            return;
        };

        match conn.query_facts().await {
            Ok(facts) => {
                server.backend.set_node_id(facts.node_id);
                server.backend.set_master_id(facts.master_id);

                server.clear_pending(SERVER_ROLE_BITS);
                match facts.role {
                    // A master keeps its was-master marker for as long as
                    // the monitor runs.
                    ReportedRole::Master => {
                        server.set_pending(SERVER_MASTER | SERVER_WAS_MASTER)
                    }
                    ReportedRole::Slave => server.set_pending(SERVER_SLAVE),
                    ReportedRole::Synced => server.set_pending(SERVER_JOINED),
                    ReportedRole::Unknown => {}
                }
            }
            Err(QueryError::Unsupported(_)) => {
                // Liveness-only backends carry no role information; leave
                // the bits as they were.
            }
            Err(err) => {
                warn!(
                    "Failed to query replication state of '{}' ({}): {}",
                    server.backend.name(),
                    server.backend.address_string(),
                    err
                );
            }
        }
    }

    async fn post_tick(&mut self, servers: &mut [MonitorServer]) -> Option<usize> {
        servers
            .iter()
            .position(|ms| ms.pending_status & SERVER_MASTER != 0)
    }
}
