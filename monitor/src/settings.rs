use serde::{Deserialize, Serialize};
use std::time::Duration;

use sqlgate_common::event::EventMask;
use sqlgate_common::{Result, SqlGateError};
use sqlgate_registry::DiskSpaceLimits;

/// Settings for the monitor's backend connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_attempts: u32,
    /// Cluster-level monitor user; servers may override it.
    pub username: String,
    /// Stored form of the cluster-level monitor password.
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout_ms: 3_000,
            read_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            connect_attempts: 1,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Per-monitor settings. Structural fields may only change while the
/// monitor is stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Tick interval.
    pub interval_ms: u64,
    /// Journals older than this are discarded at start.
    pub journal_max_age_s: u64,
    /// Operator script run on state changes; empty disables it.
    #[serde(default)]
    pub script: String,
    pub script_timeout_s: u64,
    /// Events that trigger the script.
    #[serde(default)]
    pub events: EventMask,
    /// Disk-space check cadence; 0 disables the check.
    #[serde(default)]
    pub disk_space_check_interval_ms: u64,
    /// Cluster-level disk thresholds; per-server limits take precedence.
    #[serde(default)]
    pub disk_space_limits: DiskSpaceLimits,
    #[serde(default)]
    pub conn: ConnectionSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            interval_ms: 2_000,
            journal_max_age_s: 28_800,
            script: String::new(),
            script_timeout_s: 90,
            events: EventMask::all(),
            disk_space_check_interval_ms: 0,
            disk_space_limits: DiskSpaceLimits::new(),
            conn: ConnectionSettings::default(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn journal_max_age(&self) -> Duration {
        Duration::from_secs(self.journal_max_age_s)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_s)
    }

    pub fn disk_space_check_interval(&self) -> Option<Duration> {
        if self.disk_space_check_interval_ms > 0 {
            Some(Duration::from_millis(self.disk_space_check_interval_ms))
        } else {
            None
        }
    }
}

/// Parse the operator form of disk-space thresholds, e.g.
/// `"/data:80,*:90"`. Percentages must be in `1..=100`.
pub fn parse_disk_space_limits(value: &str) -> Result<DiskSpaceLimits> {
    let mut limits = DiskSpaceLimits::new();
    let value = value.trim();
    if value.is_empty() {
        return Ok(limits);
    }

    for item in value.split(',') {
        let (path, percent) = item.rsplit_once(':').ok_or_else(|| {
            SqlGateError::Config(format!("invalid disk space threshold '{}'", item))
        })?;
        let path = path.trim();
        let percent: i32 = percent.trim().parse().map_err(|_| {
            SqlGateError::Config(format!("invalid disk space percentage in '{}'", item))
        })?;
        if path.is_empty() || !(1..=100).contains(&percent) {
            return Err(SqlGateError::Config(format!(
                "invalid disk space threshold '{}'",
                item
            )));
        }
        limits.insert(path.to_string(), percent);
    }

    Ok(limits)
}
