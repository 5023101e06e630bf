//! Shared test harness: a scriptable in-memory backend protocol and
//! registry plumbing.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

use sqlgate_monitor::backend::{
    BackendConnection, ConnectError, Connector, MountInfo, QueryError, ReportedRole, ServerFacts,
};
use sqlgate_monitor::settings::{ConnectionSettings, MonitorSettings};
use sqlgate_monitor::worker::Monitor;
use sqlgate_monitor::MonitorRegistry;
use sqlgate_registry::{
    BackendServer, OwnershipTable, Plaintext, ServerConfig, ServerRegistry,
};

#[derive(Clone, Copy)]
pub enum ProbeBehavior {
    Ok,
    ObjectDenied,
    Fail,
}

/// Scripted behavior for one mock backend.
#[derive(Clone)]
pub struct MockState {
    pub reachable: bool,
    pub auth_fail: bool,
    pub connect_delay: Duration,
    /// Whether an existing handle's ping succeeds.
    pub ping_ok: bool,
    pub facts: ServerFacts,
    pub disk_supported: bool,
    pub mounts: Vec<MountInfo>,
    pub probe_behavior: ProbeBehavior,
    pub connects: u64,
    pub disk_queries: u64,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            reachable: true,
            auth_fail: false,
            connect_delay: Duration::ZERO,
            ping_ok: true,
            facts: ServerFacts::default(),
            disk_supported: false,
            mounts: Vec::new(),
            probe_behavior: ProbeBehavior::Ok,
            connects: 0,
            disk_queries: 0,
        }
    }
}

/// In-memory stand-in for the backend wire protocol.
#[derive(Clone, Default)]
pub struct MockConnector {
    servers: Arc<DashMap<String, MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        MockConnector::default()
    }

    pub fn update(&self, name: &str, apply: impl FnOnce(&mut MockState)) {
        let mut entry = self.servers.entry(name.to_string()).or_default();
        apply(entry.value_mut());
    }

    pub fn get(&self, name: &str) -> MockState {
        self.servers
            .get(name)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Script the server as a reachable master with the given node id.
    pub fn make_master(&self, name: &str, node_id: i64) {
        self.update(name, |state| {
            state.reachable = true;
            state.facts = ServerFacts {
                node_id,
                master_id: -1,
                role: ReportedRole::Master,
            };
        });
    }

    /// Script the server as a reachable slave of `master_id`.
    pub fn make_slave(&self, name: &str, node_id: i64, master_id: i64) {
        self.update(name, |state| {
            state.reachable = true;
            state.facts = ServerFacts {
                node_id,
                master_id,
                role: ReportedRole::Slave,
            };
        });
    }

    pub fn make_unreachable(&self, name: &str) {
        self.update(name, |state| state.reachable = false);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        server: &BackendServer,
        _settings: &ConnectionSettings,
        _user: &str,
        _password: &Plaintext,
    ) -> Result<Box<dyn BackendConnection>, ConnectError> {
        let state = self.get(server.name());
        if !state.connect_delay.is_zero() {
            sleep(state.connect_delay).await;
        }
        self.update(server.name(), |s| s.connects += 1);
        if state.auth_fail {
            return Err(ConnectError::AccessDenied(format!(
                "access denied for monitor user on '{}'",
                server.name()
            )));
        }
        if !state.reachable {
            return Err(ConnectError::Refused("connection refused".to_string()));
        }
        Ok(Box::new(MockConnection {
            name: server.name().to_string(),
            servers: self.servers.clone(),
        }))
    }
}

struct MockConnection {
    name: String,
    servers: Arc<DashMap<String, MockState>>,
}

impl MockConnection {
    fn state(&self) -> MockState {
        self.servers
            .get(&self.name)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn ping(&mut self) -> Result<(), ConnectError> {
        let state = self.state();
        if state.reachable && state.ping_ok {
            Ok(())
        } else {
            Err(ConnectError::Refused("ping failed".to_string()))
        }
    }

    async fn query_facts(&mut self) -> Result<ServerFacts, QueryError> {
        Ok(self.state().facts)
    }

    async fn query_disk_space(&mut self) -> Result<Vec<MountInfo>, QueryError> {
        let state = self.state();
        if !state.disk_supported {
            return Err(QueryError::Unsupported(
                "disk information table is missing".to_string(),
            ));
        }
        if let Some(mut entry) = self.servers.get_mut(&self.name) {
            entry.disk_queries += 1;
        }
        Ok(state.mounts)
    }

    async fn probe_query(&mut self, _statement: &str) -> Result<(), QueryError> {
        match self.state().probe_behavior {
            ProbeBehavior::Ok => Ok(()),
            ProbeBehavior::ObjectDenied => Err(QueryError::ObjectAccessDenied(
                "SELECT denied on information table".to_string(),
            )),
            ProbeBehavior::Fail => Err(QueryError::Failed("query failed".to_string())),
        }
    }
}

/// One test's registries, wired to a mock connector.
pub struct Harness {
    pub servers: ServerRegistry,
    pub monitors: MonitorRegistry,
    pub mock: MockConnector,
}

impl Harness {
    pub fn new(data_dir: &Path) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mock = MockConnector::new();
        let ownership = Arc::new(OwnershipTable::new());
        let monitors = MonitorRegistry::new(data_dir, ownership)
            .with_connector(Arc::new(mock.clone()));
        Harness {
            servers: ServerRegistry::new(),
            monitors,
            mock,
        }
    }

    pub fn add_backend(&self, name: &str, port: u16) -> Arc<BackendServer> {
        self.servers
            .create(ServerConfig {
                name: name.to_string(),
                address: "10.1.0.1".to_string(),
                port,
                protocol: "mock".to_string(),
                monitor_user: String::new(),
                monitor_password: String::new(),
                disk_space_limits: Default::default(),
            })
            .expect("backend creation failed")
    }
}

pub fn tempdir() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Fast settings for tests: short interval, generous journal age.
pub fn test_settings(interval_ms: u64) -> MonitorSettings {
    let mut settings = MonitorSettings::default();
    settings.interval_ms = interval_ms;
    settings.journal_max_age_s = 3_600;
    settings.conn.connect_timeout_ms = 500;
    settings.conn.connect_attempts = 1;
    settings
}

/// Wait until the monitor has completed at least `target` ticks.
pub async fn wait_ticks(monitor: &Monitor, target: u64) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while monitor.ticks() < target {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for tick {} (at {})",
            target,
            monitor.ticks()
        );
        sleep(Duration::from_millis(10)).await;
    }
}
