//! The monitor journal: a binary snapshot of per-server status plus the
//! current master, written at the end of every tick and loaded once at
//! worker start so routing is not blind during the first tick.
//!
//! On-disk layout:
//!
//! ```text
//! length (u32 LE) | schema version (u8 = 2) | tagged entries | crc32 (u32 LE)
//! ```
//!
//! `length` covers everything after itself, CRC included. Each entry is a
//! tag byte followed by a NUL-terminated server name; a `SERVER` entry
//! appends the status as u64 LE, a `MASTER` entry appends nothing. The
//! CRC-32 spans the schema version through the last entry.

use sha1::{Digest, Sha1};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const JOURNAL_FILE: &str = "monitor.dat";

const SCHEMA_VERSION: u8 = 2;
const LEN_BYTES: usize = 4;
const LEN_SCHEMA_VERSION: usize = 1;
const LEN_CRC32: usize = 4;
const LEN_TAG: usize = 1;
const LEN_SERVER_STATUS: usize = 8;

const TAG_SERVER: u8 = 1;
const TAG_MASTER: u8 = 2;

/// The in-memory form of a journal: server statuses in monitor order plus
/// the nominated master.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub servers: Vec<(String, u64)>,
    pub master: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("journal file is too short")]
    TooShort,

    #[error("journal length mismatch: header says {expected} bytes, file has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unknown journal schema version: {0}")]
    BadVersion(u8),

    #[error("CRC32 mismatch in journal file")]
    CrcMismatch,

    #[error("no null terminator found in journal entry")]
    MissingTerminator,

    #[error("unknown stored value type: {0}")]
    UnknownTag(u8),

    #[error("journal entry overruns the payload")]
    Overrun,
}

/// Encode a snapshot into the full on-disk byte form.
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let mut size = LEN_SCHEMA_VERSION + LEN_CRC32;
    for (name, _) in &snapshot.servers {
        size += LEN_TAG + name.len() + 1 + LEN_SERVER_STATUS;
    }
    if let Some(master) = &snapshot.master {
        size += LEN_TAG + master.len() + 1;
    }

    let mut buf = Vec::with_capacity(LEN_BYTES + size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.push(SCHEMA_VERSION);

    for (name, status) in &snapshot.servers {
        buf.push(TAG_SERVER);
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&status.to_le_bytes());
    }
    if let Some(master) = &snapshot.master {
        buf.push(TAG_MASTER);
        buf.extend_from_slice(master.as_bytes());
        buf.push(0);
    }

    let crc = crc32fast::hash(&buf[LEN_BYTES..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    debug_assert_eq!(buf.len(), LEN_BYTES + size);
    buf
}

fn read_name(payload: &[u8], pos: &mut usize) -> Result<String, DecodeError> {
    let rest = &payload[*pos..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingTerminator)?;
    let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
    *pos += nul + 1;
    Ok(name)
}

/// Decode a full journal file, verifying length, schema version and CRC.
/// Entries are decoded strictly left to right; any anomaly fails the whole
/// decode.
pub fn decode(buf: &[u8]) -> Result<Snapshot, DecodeError> {
    if buf.len() < LEN_BYTES + LEN_SCHEMA_VERSION + LEN_CRC32 {
        return Err(DecodeError::TooShort);
    }

    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() != LEN_BYTES + size {
        return Err(DecodeError::LengthMismatch {
            expected: LEN_BYTES + size,
            actual: buf.len(),
        });
    }

    let data = &buf[LEN_BYTES..];
    if data[0] != SCHEMA_VERSION {
        return Err(DecodeError::BadVersion(data[0]));
    }

    let crc_offset = data.len() - LEN_CRC32;
    let stored_crc = u32::from_le_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);
    if crc32fast::hash(&data[..crc_offset]) != stored_crc {
        return Err(DecodeError::CrcMismatch);
    }

    let payload = &data[LEN_SCHEMA_VERSION..crc_offset];
    let mut snapshot = Snapshot::default();
    let mut pos = 0;

    while pos < payload.len() {
        let tag = payload[pos];
        pos += LEN_TAG;
        match tag {
            TAG_SERVER => {
                let name = read_name(payload, &mut pos)?;
                if payload.len() - pos < LEN_SERVER_STATUS {
                    return Err(DecodeError::Overrun);
                }
                let mut status_bytes = [0u8; LEN_SERVER_STATUS];
                status_bytes.copy_from_slice(&payload[pos..pos + LEN_SERVER_STATUS]);
                pos += LEN_SERVER_STATUS;
                snapshot.servers.push((name, u64::from_le_bytes(status_bytes)));
            }
            TAG_MASTER => {
                let name = read_name(payload, &mut pos)?;
                snapshot.master = Some(name);
            }
            other => return Err(DecodeError::UnknownTag(other)),
        }
    }

    Ok(snapshot)
}

/// One monitor's journal file plus the digest of the last written snapshot.
pub struct Journal {
    dir: PathBuf,
    /// SHA-1 of the last successfully written encoding; gates writes.
    hash: [u8; 20],
}

impl Journal {
    pub fn new(data_dir: &Path, monitor_name: &str) -> Self {
        Journal {
            dir: data_dir.join(monitor_name),
            hash: [0; 20],
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    /// Whether the on-disk journal is older than `max_age`. A missing file
    /// is not stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let metadata = match fs::metadata(self.path()) {
            Ok(metadata) => metadata,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!("Failed to inspect journal file: {}", err);
                }
                return false;
            }
        };
        match metadata.modified().ok().and_then(|m| m.elapsed().ok()) {
            Some(age) if age >= max_age => {
                warn!(
                    "Journal file was created {} seconds ago. Maximum journal age is {} seconds.",
                    age.as_secs(),
                    max_age.as_secs()
                );
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self) {
        if let Err(err) = fs::remove_file(self.path()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove journal file: {}", err);
            }
        }
    }

    /// Write the snapshot if it differs from the last written one. Returns
    /// whether a write happened. Failures are logged and leave the stored
    /// hash unchanged so the next tick retries.
    pub fn store(&mut self, snapshot: &Snapshot) -> bool {
        let buf = encode(snapshot);
        let digest: [u8; 20] = Sha1::digest(&buf).into();
        if digest == self.hash {
            return false;
        }

        if let Err(err) = self.write_file(&buf) {
            error!("Failed to write journal data to disk: {}", err);
            return false;
        }
        self.hash = digest;
        true
    }

    fn write_file(&self, buf: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        // Temp-then-rename so a crash mid-write cannot corrupt the live
        // file. The temp suffix keeps a leftover from matching the journal
        // name on the next start.
        let mut tmp = tempfile::Builder::new()
            .prefix(JOURNAL_FILE)
            .tempfile_in(&self.dir)?;
        tmp.write_all(buf)?;
        tmp.flush()?;
        tmp.persist(self.path()).map_err(|err| err.error)?;
        Ok(())
    }

    /// Load and decode the journal. Any anomaly is logged once and yields
    /// `None`; the caller continues with empty state.
    pub fn load(&self) -> Option<Snapshot> {
        let path = self.path();
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!("Failed to read journal file: {}", err);
                }
                return None;
            }
        };
        match decode(&buf) {
            Ok(snapshot) => {
                info!("Loaded server states from journal file: {}", path.display());
                Some(snapshot)
            }
            Err(err) => {
                error!("Possibly corrupted journal file, ignoring: {}", err);
                None
            }
        }
    }
}
