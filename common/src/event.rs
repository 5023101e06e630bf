//! Monitor events and the state-transition classifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::status::{
    SERVER_JOINED, SERVER_MASTER, SERVER_REPORTABLE_BITS, SERVER_ROLE_BITS, SERVER_RUNNING,
    SERVER_SLAVE,
};

/// A typed cluster event derived from the difference between a server's
/// previous and current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEvent {
    MasterDown,
    MasterUp,
    SlaveDown,
    SlaveUp,
    ServerDown,
    ServerUp,
    SyncedDown,
    SyncedUp,
    LostMaster,
    LostSlave,
    LostSynced,
    NewMaster,
    NewSlave,
    NewSynced,
}

impl MonitorEvent {
    pub const ALL: [MonitorEvent; 14] = [
        MonitorEvent::MasterDown,
        MonitorEvent::MasterUp,
        MonitorEvent::SlaveDown,
        MonitorEvent::SlaveUp,
        MonitorEvent::ServerDown,
        MonitorEvent::ServerUp,
        MonitorEvent::SyncedDown,
        MonitorEvent::SyncedUp,
        MonitorEvent::LostMaster,
        MonitorEvent::LostSlave,
        MonitorEvent::LostSynced,
        MonitorEvent::NewMaster,
        MonitorEvent::NewSlave,
        MonitorEvent::NewSynced,
    ];

    /// Lowercase wire/config name, also substituted for `$EVENT` in scripts.
    pub fn name(self) -> &'static str {
        match self {
            MonitorEvent::MasterDown => "master_down",
            MonitorEvent::MasterUp => "master_up",
            MonitorEvent::SlaveDown => "slave_down",
            MonitorEvent::SlaveUp => "slave_up",
            MonitorEvent::ServerDown => "server_down",
            MonitorEvent::ServerUp => "server_up",
            MonitorEvent::SyncedDown => "synced_down",
            MonitorEvent::SyncedUp => "synced_up",
            MonitorEvent::LostMaster => "lost_master",
            MonitorEvent::LostSlave => "lost_slave",
            MonitorEvent::LostSynced => "lost_synced",
            MonitorEvent::NewMaster => "new_master",
            MonitorEvent::NewSlave => "new_slave",
            MonitorEvent::NewSynced => "new_synced",
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MonitorEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MonitorEvent::ALL
            .iter()
            .copied()
            .find(|e| e.name() == s)
            .ok_or_else(|| format!("unknown monitor event '{}'", s))
    }
}

/// Operator-configured set of events that trigger the monitor script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMask(u32);

impl EventMask {
    pub const fn empty() -> Self {
        EventMask(0)
    }

    pub const fn all() -> Self {
        EventMask((1 << MonitorEvent::ALL.len()) - 1)
    }

    pub fn contains(self, event: MonitorEvent) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn insert(&mut self, event: MonitorEvent) {
        self.0 |= event.bit();
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::all()
    }
}

impl FromIterator<MonitorEvent> for EventMask {
    fn from_iter<I: IntoIterator<Item = MonitorEvent>>(iter: I) -> Self {
        let mut mask = EventMask::empty();
        for event in iter {
            mask.insert(event);
        }
        mask
    }
}

impl FromStr for EventMask {
    type Err = String;

    /// Parse a comma-separated event list, e.g. `"master_down,new_master"`.
    /// The literal `"all"` selects every event.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(EventMask::empty());
        }
        if s == "all" {
            return Ok(EventMask::all());
        }
        s.split(',')
            .map(|part| part.trim().parse::<MonitorEvent>())
            .collect::<Result<EventMask, _>>()
    }
}

fn up_event(curr: u64) -> MonitorEvent {
    if curr & SERVER_MASTER != 0 {
        MonitorEvent::MasterUp
    } else if curr & SERVER_SLAVE != 0 {
        MonitorEvent::SlaveUp
    } else if curr & SERVER_JOINED != 0 {
        MonitorEvent::SyncedUp
    } else {
        MonitorEvent::ServerUp
    }
}

fn down_event(prev: u64) -> MonitorEvent {
    if prev & SERVER_MASTER != 0 {
        MonitorEvent::MasterDown
    } else if prev & SERVER_SLAVE != 0 {
        MonitorEvent::SlaveDown
    } else if prev & SERVER_JOINED != 0 {
        MonitorEvent::SyncedDown
    } else {
        MonitorEvent::ServerDown
    }
}

/// Classify the transition between two status values, both masked to the
/// reportable bits.
///
/// Returns `None` for transitions that have no defined event: equal inputs
/// (calling with `prev == curr` is a programming error) and transitions
/// where neither side is running. Callers gate on a prior status-changed
/// check, so `None` is a defensive no-op in release builds.
pub fn classify(prev: u64, curr: u64) -> Option<MonitorEvent> {
    let prev = prev & SERVER_REPORTABLE_BITS;
    let curr = curr & SERVER_REPORTABLE_BITS;

    if prev == curr {
        debug_assert!(false, "classify called without a status change");
        return None;
    }

    if prev & SERVER_RUNNING == 0 {
        if curr & SERVER_RUNNING != 0 {
            return Some(up_event(curr));
        }
        // Was not running and still is not running.
        debug_assert!(false, "transition between two non-running states");
        return None;
    }

    if curr & SERVER_RUNNING == 0 {
        return Some(down_event(prev));
    }

    // Running on both sides: decide between losing a known role and
    // gaining a new one. Master/slave bits distinguish a genuine loss from
    // a plain role change.
    let prev_ms = prev & (SERVER_MASTER | SERVER_SLAVE);
    let curr_ms = curr & (SERVER_MASTER | SERVER_SLAVE);

    if (prev_ms == 0 || curr_ms == 0 || prev_ms == curr_ms) && prev & SERVER_ROLE_BITS != 0 {
        if prev & SERVER_MASTER != 0 {
            Some(MonitorEvent::LostMaster)
        } else if prev & SERVER_SLAVE != 0 {
            Some(MonitorEvent::LostSlave)
        } else {
            Some(MonitorEvent::LostSynced)
        }
    } else if curr & SERVER_MASTER != 0 {
        Some(MonitorEvent::NewMaster)
    } else if curr & SERVER_SLAVE != 0 {
        Some(MonitorEvent::NewSlave)
    } else if curr & SERVER_JOINED != 0 {
        Some(MonitorEvent::NewSynced)
    } else {
        None
    }
}
