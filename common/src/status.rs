//! Server status bitmap.
//!
//! Every backend server carries a 64-bit status bitmap. The monitor owning
//! the server writes all bits except the admin bits; the admin context
//! writes the admin bits through the monitor's status-request rendezvous
//! while the monitor runs, or directly while it is stopped.

/// The server accepts connections (or is assumed to, until a monitor
/// proves otherwise).
pub const SERVER_RUNNING: u64 = 1 << 0;

/// The server is the replication master.
pub const SERVER_MASTER: u64 = 1 << 1;

/// The server is a replication slave.
pub const SERVER_SLAVE: u64 = 1 << 2;

/// The server is a synced member of a multi-master cluster.
pub const SERVER_JOINED: u64 = 1 << 3;

/// Admin bit: the server is in maintenance and must not be probed or routed to.
pub const SERVER_MAINT: u64 = 1 << 4;

/// Admin bit: the server is being drained of connections.
pub const SERVER_DRAINING: u64 = 1 << 5;

/// The monitor credentials were rejected by the server.
pub const SERVER_AUTH_ERROR: u64 = 1 << 6;

/// A watched mount on the server has crossed its disk-space threshold.
pub const SERVER_DISK_SPACE_EXHAUSTED: u64 = 1 << 7;

/// The server was the master at some point since the monitor started.
pub const SERVER_WAS_MASTER: u64 = 1 << 8;

/// Role bits, cleared whenever `SERVER_RUNNING` is cleared.
pub const SERVER_ROLE_BITS: u64 = SERVER_MASTER | SERVER_SLAVE | SERVER_JOINED;

/// Admin-owned bits; the monitor loop never sets or clears these.
pub const SERVER_ADMIN_BITS: u64 = SERVER_MAINT | SERVER_DRAINING;

/// Bits that participate in state-change reporting.
pub const SERVER_REPORTABLE_BITS: u64 =
    SERVER_RUNNING | SERVER_MAINT | SERVER_MASTER | SERVER_SLAVE | SERVER_JOINED;

/// Render a status bitmap the way it appears in logs and diagnostics,
/// e.g. `"Master, Running"` or `"Maintenance, Down"`.
pub fn status_string(status: u64) -> String {
    let mut parts: Vec<&str> = Vec::new();

    if status & SERVER_MAINT != 0 {
        parts.push("Maintenance");
    }
    if status & SERVER_DRAINING != 0 {
        parts.push("Draining");
    }
    if status & SERVER_MASTER != 0 {
        parts.push("Master");
    }
    if status & SERVER_SLAVE != 0 {
        parts.push("Slave");
    }
    if status & SERVER_JOINED != 0 {
        parts.push("Synced");
    }
    if status & SERVER_AUTH_ERROR != 0 {
        parts.push("Auth Error");
    }
    if status & SERVER_DISK_SPACE_EXHAUSTED != 0 {
        parts.push("Disk Space Exhausted");
    }
    if status & SERVER_RUNNING != 0 {
        parts.push("Running");
    } else {
        parts.push("Down");
    }

    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_master() {
        assert_eq!(
            status_string(SERVER_RUNNING | SERVER_MASTER),
            "Master, Running"
        );
    }

    #[test]
    fn test_status_string_down() {
        assert_eq!(status_string(0), "Down");
        assert_eq!(status_string(SERVER_MAINT), "Maintenance, Down");
    }

    #[test]
    fn test_status_string_slave_draining() {
        assert_eq!(
            status_string(SERVER_RUNNING | SERVER_SLAVE | SERVER_DRAINING),
            "Draining, Slave, Running"
        );
    }

    #[test]
    fn test_bit_sets_are_disjoint() {
        assert_eq!(SERVER_ROLE_BITS & SERVER_ADMIN_BITS, 0);
        assert_eq!(SERVER_ROLE_BITS & SERVER_RUNNING, 0);
    }
}
