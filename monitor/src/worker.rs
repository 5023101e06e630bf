//! The per-cluster monitor worker.
//!
//! Each monitor owns one cluster: a dedicated task drives the tick loop,
//! applies admin requests, probes every server, classifies transitions,
//! fires the operator script and persists the journal. The admin context
//! talks to a running worker only through atomics: the per-server
//! status-request cells, the worker-wide wake flag, and the tick counter.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use sqlgate_common::event::{classify, MonitorEvent};
use sqlgate_common::status::{
    status_string, SERVER_ADMIN_BITS, SERVER_AUTH_ERROR, SERVER_DRAINING, SERVER_MAINT,
    SERVER_RUNNING,
};
use sqlgate_common::{Result, SqlGateError};
use sqlgate_registry::{BackendServer, OwnershipTable};

use crate::backend::{Connector, QueryError};
use crate::disk;
use crate::frontend::FrontendNotifier;
use crate::journal::{Journal, Snapshot};
use crate::module::{create_module, MonitorModule};
use crate::probe::{self, ProbeOutcome, ProbeResult};
use crate::script;
use crate::server::{MonitorServer, ServerSlot, StatusRequest};
use crate::settings::MonitorSettings;

/// Minimum sleep between scheduling decisions; also the longest the worker
/// waits before noticing an early-wake condition.
const BASE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl MonitorState {
    fn from_u8(value: u8) -> MonitorState {
        match value {
            1 => MonitorState::Starting,
            2 => MonitorState::Running,
            3 => MonitorState::Stopping,
            _ => MonitorState::Stopped,
        }
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MonitorState::Stopped => "Stopped",
            MonitorState::Starting => "Starting",
            MonitorState::Running => "Running",
            MonitorState::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

/// State owned exclusively by the worker task while the monitor runs, and
/// parked in `Monitor::idle` while it is stopped.
pub(crate) struct WorkerState {
    pub(crate) servers: Vec<MonitorServer>,
    pub(crate) module: Box<dyn MonitorModule>,
    /// Index of the current master, as nominated by the module.
    pub(crate) master: Option<usize>,
    pub(crate) journal: Journal,
    pub(crate) disk_checked_at: Option<Instant>,
}

pub struct Monitor {
    name: String,
    module_name: String,
    ownership: Arc<OwnershipTable>,
    connector: Arc<dyn Connector>,
    frontend: Arc<dyn FrontendNotifier>,

    state: AtomicU8,
    ticks: AtomicU64,
    /// Set by the admin context to wake the worker before its next
    /// scheduled tick. Losing a wake-up is tolerable; the next tick still
    /// drains the request cells.
    status_change_pending: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
    /// Permissions check passed at least once.
    checked: AtomicBool,

    settings: RwLock<MonitorSettings>,
    /// Admin-visible view of the monitored servers, kept in sync with the
    /// worker's own list (which only changes while stopped).
    slots: RwLock<Vec<ServerSlot>>,
    /// `Some` exactly while the monitor is stopped.
    idle: Mutex<Option<WorkerState>>,
    handle: AsyncMutex<Option<JoinHandle<WorkerState>>>,
}

impl Monitor {
    pub fn new(
        name: impl Into<String>,
        module_name: &str,
        data_dir: &Path,
        ownership: Arc<OwnershipTable>,
        connector: Arc<dyn Connector>,
        frontend: Arc<dyn FrontendNotifier>,
    ) -> Result<Arc<Monitor>> {
        let name = name.into();
        let module = create_module(module_name)?;
        let journal = Journal::new(data_dir, &name);

        Ok(Arc::new(Monitor {
            name,
            module_name: module_name.to_string(),
            ownership,
            connector,
            frontend,
            state: AtomicU8::new(MonitorState::Stopped as u8),
            ticks: AtomicU64::new(0),
            status_change_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
            checked: AtomicBool::new(false),
            settings: RwLock::new(MonitorSettings::default()),
            slots: RwLock::new(Vec::new()),
            idle: Mutex::new(Some(WorkerState {
                servers: Vec::new(),
                module,
                master: None,
                journal,
                disk_checked_at: None,
            })),
            handle: AsyncMutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Completed ticks; strictly monotonic while running, the externally
    /// visible epoch.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings.read().clone()
    }

    pub fn servers(&self) -> Vec<Arc<BackendServer>> {
        self.slots
            .read()
            .iter()
            .map(|slot| slot.backend.clone())
            .collect()
    }

    fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: MonitorState, to: MonitorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.state() != MonitorState::Stopped {
            return Err(SqlGateError::MonitorRunning(self.name.clone()));
        }
        Ok(())
    }

    /// Replace the server list and settings atomically. Requires the
    /// monitor to be stopped; on a claim conflict every server added by
    /// this call is released again.
    pub fn configure(
        &self,
        settings: MonitorSettings,
        servers: Vec<Arc<BackendServer>>,
    ) -> Result<()> {
        self.ensure_stopped()?;
        self.remove_all_servers()?;
        *self.settings.write() = settings;
        for server in servers {
            if let Err(err) = self.add_server(server) {
                let _ = self.remove_all_servers();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Add a server, claiming it in the ownership table. Requires the
    /// monitor to be stopped.
    pub fn add_server(&self, server: Arc<BackendServer>) -> Result<()> {
        self.ensure_stopped()?;
        if let Err(err) = self.ownership.claim(server.name(), &self.name) {
            if let SqlGateError::ServerClaimed { server, owner } = &err {
                error!(
                    "Server '{}' is already monitored by '{}', cannot add it to monitor '{}'",
                    server, owner, self.name
                );
            }
            return Err(err);
        }

        let slot = ServerSlot::new(server);
        self.slots.write().push(slot.clone());
        if let Some(ws) = self.idle.lock().as_mut() {
            let limits = self.settings.read().disk_space_limits.clone();
            ws.servers.push(MonitorServer::new(slot, limits));
        }
        Ok(())
    }

    /// Drop every server and release its ownership. Requires the monitor
    /// to be stopped.
    pub fn remove_all_servers(&self) -> Result<()> {
        self.ensure_stopped()?;
        let slots: Vec<ServerSlot> = self.slots.write().drain(..).collect();
        for slot in &slots {
            debug_assert_eq!(
                self.ownership.claimed_by(slot.backend.name()).as_deref(),
                Some(self.name.as_str())
            );
            self.ownership.release(slot.backend.name());
        }
        if let Some(ws) = self.idle.lock().as_mut() {
            ws.servers.clear();
        }
        Ok(())
    }

    /// Replace the monitor-level disk-space thresholds. Requires the
    /// monitor to be stopped.
    pub fn set_disk_space_limits(
        &self,
        limits: sqlgate_registry::DiskSpaceLimits,
    ) -> Result<()> {
        self.ensure_stopped()?;
        self.settings.write().disk_space_limits = limits;
        Ok(())
    }

    fn find_slot(&self, server_name: &str) -> Result<ServerSlot> {
        self.slots
            .read()
            .iter()
            .find(|slot| slot.backend.name() == server_name)
            .cloned()
            .ok_or_else(|| {
                error!(
                    "Monitor '{}' requested to modify status of server '{}' that it does not monitor",
                    self.name, server_name
                );
                SqlGateError::ServerNotFound(server_name.to_string())
            })
    }

    /// Set status bits on a monitored server. While running, only the
    /// maintenance and drain bits may be set, and the change is posted to
    /// the worker through the request cell. While stopped, any bit can be
    /// written directly; such writes are best-effort hints that the next
    /// tick's flush overwrites.
    pub fn set_server_status(&self, server_name: &str, bits: u64) -> Result<()> {
        let slot = self.find_slot(server_name)?;
        if self.state() != MonitorState::Running {
            slot.backend.set_status(bits);
            return Ok(());
        }

        if bits & !SERVER_ADMIN_BITS != 0 || bits & SERVER_ADMIN_BITS == 0 {
            error!(
                "Server '{}' is monitored, so only the maintenance and drain status can be \
                 set manually. Status was not modified.",
                server_name
            );
            return Err(SqlGateError::StatusNotModifiable);
        }

        let request = if bits & SERVER_MAINT != 0 {
            StatusRequest::MaintOn
        } else {
            StatusRequest::DrainOn
        };
        self.post_status_request(&slot, request);
        Ok(())
    }

    /// Clear status bits on a monitored server; mirror of
    /// [`Monitor::set_server_status`].
    pub fn clear_server_status(&self, server_name: &str, bits: u64) -> Result<()> {
        let slot = self.find_slot(server_name)?;
        if self.state() != MonitorState::Running {
            slot.backend.clear_status(bits);
            return Ok(());
        }

        if bits & !SERVER_ADMIN_BITS != 0 || bits & SERVER_ADMIN_BITS == 0 {
            error!(
                "Server '{}' is monitored, so only the maintenance and drain status can be \
                 cleared manually. Status was not modified.",
                server_name
            );
            return Err(SqlGateError::StatusNotModifiable);
        }

        let request = if bits & SERVER_MAINT != 0 {
            StatusRequest::MaintOff
        } else {
            StatusRequest::DrainOff
        };
        self.post_status_request(&slot, request);
        Ok(())
    }

    fn post_status_request(&self, slot: &ServerSlot, request: StatusRequest) {
        if slot.request.post(request) != StatusRequest::None {
            warn!(
                "Previous status request for a server of monitor '{}' was not yet read \
                 by the monitor and was overwritten",
                self.name
            );
        }
        // Wake the worker so the request is applied before the next
        // scheduled tick.
        self.status_change_pending.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Start the monitor. Runs the one-time permissions check, spawns the
    /// worker task and waits for its readiness rendezvous.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.transition(MonitorState::Stopped, MonitorState::Starting) {
            return Err(SqlGateError::MonitorRunning(self.name.clone()));
        }
        match self.do_start().await {
            Ok(()) => {
                self.set_state(MonitorState::Running);
                info!("Started monitor '{}'", self.name);
                Ok(())
            }
            Err(err) => {
                error!("Failed to start monitor '{}': {}", self.name, err);
                self.set_state(MonitorState::Stopped);
                Err(err)
            }
        }
    }

    async fn do_start(self: &Arc<Self>) -> Result<()> {
        let settings = self.settings.read().clone();

        {
            let mut idle = self.idle.lock();
            let ws = idle
                .as_mut()
                .ok_or_else(|| SqlGateError::Internal("worker state missing".into()))?;
            if ws.journal.is_stale(settings.journal_max_age()) {
                warn!("Removing stale journal file for monitor '{}'", self.name);
                ws.journal.remove();
            }
        }

        if !self.checked.load(Ordering::Acquire) {
            self.check_permissions(&settings).await?;
            self.checked.store(true, Ordering::Release);
        }

        let mut ws = self
            .idle
            .lock()
            .take()
            .ok_or_else(|| SqlGateError::Internal("worker state missing".into()))?;
        // Monitor-level disk limits are refreshed per start so threshold
        // changes made while stopped take effect.
        for ms in &mut ws.servers {
            ms.monitor_limits = settings.disk_space_limits.clone();
        }

        self.shutdown.store(false, Ordering::Release);
        let (ready_tx, ready_rx) = oneshot::channel();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move { monitor.run(ws, ready_tx).await });
        *self.handle.lock().await = Some(handle);

        ready_rx.await.map_err(|_| {
            SqlGateError::Internal("monitor worker exited before signaling readiness".into())
        })
    }

    /// Stop the monitor: signal the worker, wait for the current tick to
    /// finish, close all backend handles.
    pub async fn stop(&self) -> Result<()> {
        if !self.transition(MonitorState::Running, MonitorState::Stopping) {
            return Err(SqlGateError::MonitorNotRunning(self.name.clone()));
        }

        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();

        let handle = self.handle.lock().await.take();
        let Some(handle) = handle else {
            self.set_state(MonitorState::Stopped);
            return Err(SqlGateError::Internal("worker handle missing".into()));
        };

        match handle.await {
            Ok(mut ws) => {
                for ms in &mut ws.servers {
                    ms.close_connection();
                }
                *self.idle.lock() = Some(ws);
                self.set_state(MonitorState::Stopped);
                info!("Stopped monitor '{}'", self.name);
                Ok(())
            }
            Err(err) => {
                self.set_state(MonitorState::Stopped);
                Err(SqlGateError::Internal(format!(
                    "monitor worker task failed: {}",
                    err
                )))
            }
        }
    }

    /// One-time permissions check: connect to every server and run the
    /// module's probe statement. Access denied on the monitor user's
    /// connection is fatal; denied access to specific objects is
    /// tolerated; anything else is a soft failure that still lets the
    /// monitor start.
    async fn check_permissions(&self, settings: &MonitorSettings) -> Result<()> {
        let probe_statement = {
            let idle = self.idle.lock();
            let ws = idle
                .as_ref()
                .ok_or_else(|| SqlGateError::Internal("worker state missing".into()))?;
            ws.module.permission_probe()
        };

        let slots: Vec<ServerSlot> = self.slots.read().clone();
        let mut fatal: Option<String> = None;

        for slot in &slots {
            let (conn, result) =
                probe::probe(self.connector.as_ref(), &slot.backend, &settings.conn, None).await;

            if !result.is_ok() {
                let detail = result
                    .error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_default();
                error!(
                    "[{}] Failed to connect to server '{}' ({}) when checking monitor user \
                     credentials and permissions: {}",
                    self.name,
                    slot.backend.name(),
                    slot.backend.address_string(),
                    detail
                );
                if matches!(&result.error, Some(err) if err.is_access_denied()) && fatal.is_none()
                {
                    fatal = Some(format!(
                        "monitor user was denied access to server '{}'",
                        slot.backend.name()
                    ));
                }
                continue;
            }

            let Some(mut conn) = conn else { continue };
            match conn.probe_query(probe_statement).await {
                Ok(()) => {}
                Err(QueryError::ObjectAccessDenied(_)) => {}
                Err(err) => {
                    error!(
                        "[{}] Failed to execute query '{}' on server '{}': {}",
                        self.name,
                        probe_statement,
                        slot.backend.name(),
                        err
                    );
                }
            }
        }

        match fatal {
            Some(message) => Err(SqlGateError::PermissionsCheck(message)),
            None => Ok(()),
        }
    }

    /// The worker task body. Loads the journal, signals readiness, then
    /// runs the tick loop until shutdown.
    async fn run(
        self: Arc<Self>,
        mut ws: WorkerState,
        ready: oneshot::Sender<()>,
    ) -> WorkerState {
        self.load_journal(&mut ws);
        let _ = ready.send(());

        let settings = self.settings.read().clone();
        let interval = settings.interval();
        let mut last_tick: Option<Instant> = None;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Enough time has passed, a status change request is waiting,
            // or a module-specific condition asks for an immediate tick.
            let due = last_tick.map_or(true, |at| at.elapsed() >= interval);
            if due
                || self.status_change_pending.load(Ordering::Acquire)
                || ws.module.immediate_tick_required()
            {
                let started = Instant::now();
                self.tick(&mut ws, &settings).await;
                self.ticks.fetch_add(1, Ordering::AcqRel);
                metrics::counter!("monitor.ticks").increment(1);
                last_tick = Some(started);
                continue;
            }

            let remaining =
                last_tick.map_or(Duration::ZERO, |at| interval.saturating_sub(at.elapsed()));
            let delay = if remaining.is_zero() || remaining >= BASE_INTERVAL {
                BASE_INTERVAL
            } else {
                remaining
            };
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }

        ws
    }

    async fn tick(&self, ws: &mut WorkerState, settings: &MonitorSettings) {
        self.check_maintenance_requests(&mut ws.servers);
        ws.module.pre_tick(&mut ws.servers).await;

        // The disk check runs for all servers in the same tick or for none.
        let check_disk = match settings.disk_space_check_interval() {
            Some(interval) => match ws.disk_checked_at {
                Some(at) if at.elapsed() <= interval => false,
                _ => {
                    ws.disk_checked_at = Some(Instant::now());
                    true
                }
            },
            None => false,
        };

        for ms in &mut ws.servers {
            if ms.backend.in_maint() {
                continue;
            }
            ms.stash_current_status();

            let existing = ms.conn.take();
            let (conn, result) =
                probe::probe(self.connector.as_ref(), &ms.backend, &settings.conn, existing)
                    .await;
            ms.conn = conn;

            if result.is_ok() {
                ms.clear_pending(SERVER_AUTH_ERROR);
                ms.set_pending(SERVER_RUNNING);

                if check_disk && ms.can_check_disk_space() {
                    disk::update_disk_space_status(ms).await;
                }
                ws.module.update_server_status(ms).await;
            } else {
                ms.clear_pending_except_was_master();
                if matches!(&result.error, Some(err) if err.is_access_denied()) {
                    ms.set_pending(SERVER_AUTH_ERROR);
                }
                if ms.pending_changed() && ms.should_log_fail_status() {
                    log_connect_error(ms, &result);
                }
            }

            if ms.pending_status & SERVER_RUNNING == 0 {
                ms.err_count += 1;
            } else {
                ms.err_count = 0;
            }
        }

        ws.master = ws.module.post_tick(&mut ws.servers).await;

        // Commit the tick's pending statuses into the live bitmaps.
        for ms in &ws.servers {
            if !ms.backend.in_maint() {
                ms.backend.assign_status(ms.pending_status);
            }
        }

        self.process_state_changes(ws, settings).await;
        self.hangup_failed_servers(&ws.servers);
        self.store_journal(ws);
    }

    /// Apply pending admin requests for the admin bits. Called at the top
    /// of every tick.
    fn check_maintenance_requests(&self, servers: &mut [MonitorServer]) {
        if !self.status_change_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        for ms in servers {
            match ms.request.take() {
                StatusRequest::MaintOn => ms.backend.set_status(SERVER_MAINT),
                StatusRequest::MaintOff => ms.backend.clear_status(SERVER_MAINT),
                StatusRequest::DrainOn => ms.backend.set_status(SERVER_DRAINING),
                StatusRequest::DrainOff => ms.backend.clear_status(SERVER_DRAINING),
                StatusRequest::None => {}
            }
        }
    }

    async fn process_state_changes(&self, ws: &WorkerState, settings: &MonitorSettings) {
        let mut master_down = false;
        let mut master_up = false;

        for index in 0..ws.servers.len() {
            let ms = &ws.servers[index];
            if !ms.status_changed() {
                continue;
            }
            let prev = ms.prev_status.unwrap_or(0);
            let live = ms.backend.status();
            let Some(event) = classify(prev, live) else {
                continue;
            };

            ms.backend.record_event(event, SystemTime::now());
            info!(
                "Server changed state: {} ({}): {}. [{}] -> [{}]",
                ms.backend.name(),
                ms.backend.address_string(),
                event,
                status_string(prev),
                status_string(live)
            );
            metrics::counter!("monitor.state_changes").increment(1);

            match event {
                MonitorEvent::MasterDown => master_down = true,
                MonitorEvent::MasterUp | MonitorEvent::NewMaster => master_up = true,
                _ => {}
            }

            if !settings.script.is_empty() && settings.events.contains(event) {
                script::launch(settings, &ws.servers, index, event).await;
            }
        }

        if master_down && master_up {
            info!("Master switch detected: lost a master and gained a new one");
        }
    }

    /// Ask the front end to close client connections tied to servers that
    /// changed state and are no longer usable or no longer in the cluster.
    fn hangup_failed_servers(&self, servers: &[MonitorServer]) {
        for ms in servers {
            if ms.status_changed() && (!ms.backend.is_usable() || !ms.backend.is_in_cluster()) {
                self.frontend.hangup(&ms.backend);
            }
        }
    }

    fn store_journal(&self, ws: &mut WorkerState) {
        let snapshot = Snapshot {
            servers: ws
                .servers
                .iter()
                .map(|ms| (ms.backend.name().to_string(), ms.backend.status()))
                .collect(),
            master: ws
                .master
                .and_then(|index| ws.servers.get(index))
                .map(|ms| ms.backend.name().to_string()),
        };
        if ws.journal.store(&snapshot) {
            metrics::counter!("monitor.journal_writes").increment(1);
        }
    }

    /// Pre-populate server state from the journal so routing is not blind
    /// before the first tick completes.
    fn load_journal(&self, ws: &mut WorkerState) {
        let Some(snapshot) = ws.journal.load() else {
            return;
        };
        for (name, status) in &snapshot.servers {
            if let Some(ms) = ws
                .servers
                .iter_mut()
                .find(|ms| ms.backend.name() == name)
            {
                ms.prev_status = Some(*status);
                ms.pending_status = *status;
                ms.backend.assign_status(*status);
            }
        }
        if let Some(master) = &snapshot.master {
            ws.master = ws
                .servers
                .iter()
                .position(|ms| ms.backend.name() == master);
        }
    }

    /// Runtime diagnostics as JSON. Safe to call from any thread; the
    /// fields are individually consistent but not a cross-field snapshot.
    pub fn diagnostics(&self) -> serde_json::Value {
        let servers: Vec<_> = self
            .slots
            .read()
            .iter()
            .map(|slot| slot.backend.info())
            .collect();
        json!({
            "name": self.name,
            "module": self.module_name,
            "state": self.state(),
            "ticks": self.ticks(),
            "servers": servers,
            "settings": self.settings.read().clone(),
        })
    }
}

fn log_connect_error(ms: &MonitorServer, result: &ProbeResult) {
    let detail = result
        .error
        .as_ref()
        .map(|err| err.to_string())
        .unwrap_or_default();
    if result.outcome == ProbeOutcome::Timeout {
        error!(
            "Monitor timed out when connecting to server {} ({}): {}",
            ms.backend.name(),
            ms.backend.address_string(),
            detail
        );
    } else {
        error!(
            "Monitor was unable to connect to server {} ({}): {}",
            ms.backend.name(),
            ms.backend.address_string(),
            detail
        );
    }
}
