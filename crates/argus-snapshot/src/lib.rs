//! Durable sync state: last-sync timestamps and the evaluation-engine
//! snapshot, kept as three files in a configured directory.
//!
//! Writes go through a temp file and an atomic rename so a crash mid-dump
//! never leaves a torn file. Each file has its own reader-writer lock; a
//! missing file reads as [`SnapshotError::NoSyncBefore`], the recoverable
//! "cold start" sentinel.
use argus_policy::{InstanceKind, SnapshotRecord};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no sync before")]
    NoSyncBefore,
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot not decodable: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot data invalid: {0}")]
    Invalid(String),
    #[error("snapshot store lock poisoned")]
    Poisoned,
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

pub struct SnapshotStore {
    dir: PathBuf,
    kind: InstanceKind,
    full_lock: RwLock<()>,
    incr_lock: RwLock<()>,
    snap_lock: RwLock<()>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, kind: InstanceKind) -> Self {
        Self {
            dir: dir.into(),
            kind,
            full_lock: RwLock::new(()),
            incr_lock: RwLock::new(()),
            snap_lock: RwLock::new(()),
        }
    }

    pub fn full_sync_last_time(&self) -> SnapshotResult<i64> {
        let _guard = self.full_lock.read().map_err(|_| SnapshotError::Poisoned)?;
        read_timestamp(&self.dir.join(self.kind.full_sync_file_name()))
    }

    pub fn set_full_sync_last_time(&self, timestamp: i64) -> SnapshotResult<()> {
        let _guard = self.full_lock.write().map_err(|_| SnapshotError::Poisoned)?;
        write_atomic(
            &self.dir.join(self.kind.full_sync_file_name()),
            timestamp.to_string().as_bytes(),
        )
    }

    pub fn incr_sync_last_time(&self) -> SnapshotResult<i64> {
        let _guard = self.incr_lock.read().map_err(|_| SnapshotError::Poisoned)?;
        read_timestamp(&self.dir.join(self.kind.incr_sync_file_name()))
    }

    pub fn set_incr_sync_last_time(&self, timestamp: i64) -> SnapshotResult<()> {
        let _guard = self.incr_lock.write().map_err(|_| SnapshotError::Poisoned)?;
        write_atomic(
            &self.dir.join(self.kind.incr_sync_file_name()),
            timestamp.to_string().as_bytes(),
        )
    }

    pub fn snapshot_exists(&self) -> bool {
        self.dir.join(self.kind.snapshot_file_name()).is_file()
    }

    pub fn save_snapshot(&self, records: &[SnapshotRecord]) -> SnapshotResult<()> {
        let _guard = self.snap_lock.write().map_err(|_| SnapshotError::Poisoned)?;
        let bytes = serde_json::to_vec(records)?;
        write_atomic(&self.dir.join(self.kind.snapshot_file_name()), &bytes)
    }

    /// Loads and revalidates the snapshot; derived policy fields are
    /// recomputed because they are never persisted.
    pub fn load_snapshot(&self) -> SnapshotResult<Vec<SnapshotRecord>> {
        let _guard = self.snap_lock.read().map_err(|_| SnapshotError::Poisoned)?;
        let path = self.dir.join(self.kind.snapshot_file_name());
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NoSyncBefore);
            }
            Err(err) => return Err(err.into()),
        };
        let mut records: Vec<SnapshotRecord> = serde_json::from_slice(&bytes)?;
        for record in &mut records {
            record
                .fill_policies_derived()
                .map_err(|err| SnapshotError::Invalid(err.to_string()))?;
        }
        Ok(records)
    }
}

fn read_timestamp(path: &Path) -> SnapshotResult<i64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(SnapshotError::NoSyncBefore);
        }
        Err(err) => return Err(err.into()),
    };
    content
        .trim()
        .parse::<i64>()
        .map_err(|err| SnapshotError::Invalid(err.to_string()))
}

/// Appends `.tmp` to the full file name. Replacing the extension would
/// collapse `last_sync_time.full` and `last_sync_time.incr` onto one temp
/// file, and those writers run under separate locks.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> SnapshotResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
