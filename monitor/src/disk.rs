//! Disk-space checking against operator thresholds.

use std::collections::HashSet;
use tracing::{error, warn};

use sqlgate_common::status::SERVER_DISK_SPACE_EXHAUSTED;
use sqlgate_registry::{BackendServer, DiskSpaceLimits};

use crate::backend::{MountInfo, QueryError};
use crate::server::MonitorServer;

pub(crate) fn used_percentage(mount: &MountInfo) -> i32 {
    if mount.total == 0 {
        return 0;
    }
    (((mount.total - mount.available) as f64 / mount.total as f64) * 100.0) as i32
}

fn mount_exhausted(server: &BackendServer, mount: &MountInfo, max_percentage: i32) -> bool {
    let used = used_percentage(mount);
    if used >= max_percentage {
        error!(
            "Disk space on {} at {} is exhausted; {}% of the disk mounted on {} is used, \
             the limit is {}%",
            server.name(),
            server.address,
            used,
            mount.path,
            max_percentage
        );
        true
    } else {
        false
    }
}

/// Evaluate the merged limits against the reported mounts. Explicitly
/// listed paths are checked exactly once with their own threshold; the `*`
/// threshold covers every remaining mount.
pub(crate) fn evaluate(
    server: &BackendServer,
    limits: &DiskSpaceLimits,
    mounts: &[MountInfo],
) -> bool {
    let mut exhausted = false;
    let mut star_max_percentage: Option<i32> = None;
    let mut checked_paths: HashSet<&str> = HashSet::new();

    for (path, &max_percentage) in limits {
        if path == "*" {
            star_max_percentage = Some(max_percentage);
            continue;
        }
        match mounts.iter().find(|m| &m.path == path) {
            Some(mount) => {
                exhausted |= mount_exhausted(server, mount, max_percentage);
                checked_paths.insert(path.as_str());
            }
            None => {
                warn!(
                    "Disk space threshold specified for {} even though server {} at {} \
                     does not have that mount",
                    path,
                    server.name(),
                    server.address
                );
            }
        }
    }

    if let Some(max_percentage) = star_max_percentage {
        for mount in mounts {
            if !checked_paths.contains(mount.path.as_str()) {
                exhausted |= mount_exhausted(server, mount, max_percentage);
            }
        }
    }

    exhausted
}

/// Query one server's disk information and update its pending
/// disk-space-exhausted bit. An unsupported query disables the check for
/// the server for the rest of the process lifetime.
pub(crate) async fn update_disk_space_status(ms: &mut MonitorServer) {
    let Some(conn) = ms.conn.as_mut() else {
        return;
    };

    match conn.query_disk_space().await {
        Ok(mounts) => {
            // Server-specific limits take precedence over the monitor's.
            let mut limits = ms.backend.disk_space_limits();
            if limits.is_empty() {
                limits = ms.monitor_limits.clone();
            }

            if evaluate(&ms.backend, &limits, &mounts) {
                ms.set_pending(SERVER_DISK_SPACE_EXHAUSTED);
            } else {
                ms.clear_pending(SERVER_DISK_SPACE_EXHAUSTED);
            }
        }
        Err(QueryError::Unsupported(message)) => {
            ms.ok_to_check_disk_space = false;
            error!(
                "Disk space cannot be checked for {} at {}: {}. \
                 Disk space checking has been disabled for this server.",
                ms.backend.name(),
                ms.backend.address,
                message
            );
        }
        Err(err) => {
            error!(
                "Checking the disk space for {} at {} failed: {}",
                ms.backend.name(),
                ms.backend.address,
                err
            );
        }
    }
}
