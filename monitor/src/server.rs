//! Per-backend state owned by one monitor worker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use sqlgate_common::status::{
    SERVER_MAINT, SERVER_REPORTABLE_BITS, SERVER_RUNNING, SERVER_WAS_MASTER,
};
use sqlgate_registry::{BackendServer, DiskSpaceLimits};

use crate::backend::BackendConnection;

/// Pending admin request for a server's admin status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusRequest {
    None = 0,
    MaintOn = 1,
    MaintOff = 2,
    DrainOn = 3,
    DrainOff = 4,
}

impl StatusRequest {
    fn from_u8(value: u8) -> StatusRequest {
        match value {
            1 => StatusRequest::MaintOn,
            2 => StatusRequest::MaintOff,
            3 => StatusRequest::DrainOn,
            4 => StatusRequest::DrainOff,
            _ => StatusRequest::None,
        }
    }
}

/// Atomic rendezvous cell through which the admin context posts admin-bit
/// changes to the monitor worker.
#[derive(Default)]
pub struct StatusRequestCell(AtomicU8);

impl StatusRequestCell {
    pub fn new() -> Self {
        StatusRequestCell::default()
    }

    /// Post a request, returning the request it overwrote.
    pub fn post(&self, request: StatusRequest) -> StatusRequest {
        StatusRequest::from_u8(self.0.swap(request as u8, Ordering::AcqRel))
    }

    /// Consume the pending request, leaving `None`.
    pub fn take(&self) -> StatusRequest {
        StatusRequest::from_u8(self.0.swap(StatusRequest::None as u8, Ordering::AcqRel))
    }
}

/// The admin-visible handle for one monitored server: the shared backend
/// descriptor plus the status-request cell.
#[derive(Clone)]
pub struct ServerSlot {
    pub backend: Arc<BackendServer>,
    pub request: Arc<StatusRequestCell>,
}

impl ServerSlot {
    pub fn new(backend: Arc<BackendServer>) -> Self {
        ServerSlot {
            backend,
            request: Arc::new(StatusRequestCell::new()),
        }
    }
}

/// Monitor-side state for one backend. Owned exclusively by the worker;
/// the admin context only touches the shared request cell.
pub struct MonitorServer {
    pub backend: Arc<BackendServer>,
    pub(crate) request: Arc<StatusRequestCell>,
    pub(crate) conn: Option<Box<dyn BackendConnection>>,
    /// Status observed at the start of the current tick; `None` until the
    /// first stash or journal load.
    pub(crate) prev_status: Option<u64>,
    /// Status accumulated during the current tick, committed by the flush.
    pub(crate) pending_status: u64,
    /// Consecutive ticks the server has been down.
    pub(crate) err_count: u64,
    /// Monitor-level disk limits, used when the server has none of its own.
    pub(crate) monitor_limits: DiskSpaceLimits,
    /// Cleared permanently once the server is known to lack the disk
    /// information table.
    pub(crate) ok_to_check_disk_space: bool,
}

impl MonitorServer {
    pub fn new(slot: ServerSlot, monitor_limits: DiskSpaceLimits) -> Self {
        MonitorServer {
            backend: slot.backend,
            request: slot.request,
            conn: None,
            prev_status: None,
            pending_status: 0,
            err_count: 0,
            monitor_limits,
            ok_to_check_disk_space: true,
        }
    }

    /// Snapshot the live status into `prev_status` and `pending_status` at
    /// the start of a tick.
    pub fn stash_current_status(&mut self) {
        let status = self.backend.status();
        self.prev_status = Some(status);
        self.pending_status = status;
    }

    pub fn set_pending(&mut self, bits: u64) {
        self.pending_status |= bits;
    }

    pub fn clear_pending(&mut self, bits: u64) {
        self.pending_status &= !bits;
    }

    /// Whether the flushed status differs from the tick-start snapshot in a
    /// reportable way: masked bits differ, neither side is in maintenance,
    /// and at least one side is running.
    pub fn status_changed(&self) -> bool {
        let Some(prev) = self.prev_status else {
            return false;
        };
        let old = prev & SERVER_REPORTABLE_BITS;
        let new = self.backend.status() & SERVER_REPORTABLE_BITS;
        old != new && (old | new) & SERVER_MAINT == 0 && (old | new) & SERVER_RUNNING != 0
    }

    /// Same comparison against the not-yet-flushed pending status; used for
    /// the first-failure connect log inside the probe loop.
    pub(crate) fn pending_changed(&self) -> bool {
        let Some(prev) = self.prev_status else {
            return false;
        };
        let old = prev & SERVER_REPORTABLE_BITS;
        let new = self.pending_status & SERVER_REPORTABLE_BITS;
        old != new && (old | new) & SERVER_MAINT == 0 && (old | new) & SERVER_RUNNING != 0
    }

    /// The connect failure is logged only on the first failing tick.
    pub(crate) fn should_log_fail_status(&self) -> bool {
        self.pending_status & SERVER_RUNNING == 0 && self.err_count == 0
    }

    pub(crate) fn can_check_disk_space(&self) -> bool {
        self.ok_to_check_disk_space
            && (!self.monitor_limits.is_empty() || !self.backend.disk_space_limits().is_empty())
    }

    /// Clear everything except the was-master marker; used when a probe
    /// fails.
    pub(crate) fn clear_pending_except_was_master(&mut self) {
        self.pending_status &= SERVER_WAS_MASTER;
    }

    pub fn close_connection(&mut self) {
        self.conn = None;
    }
}
