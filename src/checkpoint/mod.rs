//! Versioned, append-only snapshots of workflow state.
//!
//! Each commit writes a new `<sequence>.json` snapshot (temp file, fsync,
//! rename) and then re-points the `LATEST` file at it the same way. Either
//! the whole new snapshot becomes authoritative or the previous one stays
//! authoritative. Rollback only re-points `LATEST`; history is never deleted.
//!
//! Commits are serialized by an in-process mutex and an exclusive `fs2` lock
//! on `.lock`, so at most one state mutation is in flight per project.
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::checkpoint::CheckpointStore;
//! use foreman::phase::Phase;
//! use foreman::workflow::WorkflowState;
//! use std::path::Path;
//!
//! let store = CheckpointStore::open(Path::new(".foreman/checkpoints")).unwrap();
//! let seq = store.commit(&WorkflowState::new("demo")).unwrap();
//! let latest = store.load_latest().unwrap().unwrap();
//! assert_eq!(latest.sequence, seq);
//! let planning = store.load_at_phase(Phase::Planning).unwrap();
//! # let _ = planning;
//! ```

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::errors::CheckpointError;
use crate::phase::Phase;
use crate::workflow::{WorkflowState, WorkflowStatus};

/// Snapshot format written by this version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Pointer file naming the authoritative snapshot.
pub const LATEST_POINTER: &str = "LATEST";

const LOCK_FILE: &str = ".lock";

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target, then fsync the directory so the rename
/// itself survives a crash.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => File::open(parent)?.sync_all(),
        None => File::open(".")?.sync_all(),
    }
}

// Directory handles cannot be opened for fsync on Windows.
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// One committed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub sequence: u64,
    /// Snapshot `LATEST` pointed at when this one was committed.
    pub parent: Option<u64>,
    pub phase: Phase,
    pub committed_at: DateTime<Utc>,
    pub state: WorkflowState,
}

/// Listing entry for `history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub sequence: u64,
    pub parent: Option<u64>,
    pub phase: Phase,
    pub status: WorkflowStatus,
    pub iteration: u32,
    pub committed_at: DateTime<Utc>,
    pub is_latest: bool,
}

#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    state_mirror: Option<PathBuf>,
    write_lock: Mutex<()>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Holds the cross-process lock until dropped.
struct DirLock(File);

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl CheckpointStore {
    pub fn open(dir: &Path) -> Result<Self, CheckpointError> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state_mirror: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Also mirror the latest state to `path` after every commit or rollback.
    pub fn with_state_mirror(mut self, path: &Path) -> Self {
        self.state_mirror = Some(path.to_path_buf());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{:08}.json", sequence))
    }

    fn lock_dir(&self) -> Result<DirLock, CheckpointError> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        FileExt::lock_exclusive(&file).map_err(io_error(&path))?;
        Ok(DirLock(file))
    }

    fn latest_sequence(&self) -> Result<Option<u64>, CheckpointError> {
        let path = self.dir.join(LATEST_POINTER);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        content
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                path,
                message: format!("invalid pointer '{}': {}", content.trim(), e),
            })
    }

    /// Every snapshot sequence on disk, ascending.
    fn sequences(&self) -> Result<Vec<u64>, CheckpointError> {
        let entries = fs::read_dir(&self.dir).map_err(io_error(&self.dir))?;
        let mut sequences = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.dir))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json")
                && let Ok(seq) = stem.parse::<u64>()
            {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn read_checkpoint(&self, sequence: u64) -> Result<Checkpoint, CheckpointError> {
        let path = self.snapshot_path(sequence);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(sequence));
            }
            Err(e) => return Err(io_error(&path)(e)),
        };
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
        let version = value.get("version").and_then(|v| v.as_u64());
        match version {
            Some(v) if v == CHECKPOINT_FORMAT_VERSION as u64 => {}
            Some(v) => {
                return Err(CheckpointError::UnsupportedVersion {
                    found: v as u32,
                    supported: CHECKPOINT_FORMAT_VERSION,
                });
            }
            None => {
                return Err(CheckpointError::Corrupt {
                    path,
                    message: "missing format version".to_string(),
                });
            }
        }
        serde_json::from_value(value).map_err(|e| CheckpointError::Corrupt {
            path,
            message: e.to_string(),
        })
    }

    fn write_pointer(&self, sequence: u64) -> Result<(), CheckpointError> {
        let path = self.dir.join(LATEST_POINTER);
        write_atomic(&path, format!("{}\n", sequence).as_bytes()).map_err(io_error(&path))
    }

    fn write_mirror(&self, state: &WorkflowState) -> Result<(), CheckpointError> {
        if let Some(path) = &self.state_mirror {
            let json = serde_json::to_vec_pretty(state).map_err(CheckpointError::Serialize)?;
            write_atomic(path, &json).map_err(io_error(path))?;
        }
        Ok(())
    }

    /// Durably record `state` as the new latest snapshot.
    ///
    /// Rejects a phase earlier than the current latest; going back is only
    /// possible through [`CheckpointStore::rollback_to_phase`].
    pub fn commit(&self, state: &WorkflowState) -> Result<u64, CheckpointError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CheckpointError::LockPoisoned)?;
        let _dir_lock = self.lock_dir()?;

        let parent = self.latest_sequence()?;
        if let Some(parent_seq) = parent {
            let previous = self.read_checkpoint(parent_seq)?;
            if state.current_phase < previous.phase {
                return Err(CheckpointError::PhaseRegression {
                    from: previous.phase.to_string(),
                    to: state.current_phase.to_string(),
                });
            }
        }

        let sequence = self.sequences()?.last().copied().unwrap_or(0) + 1;
        let checkpoint = Checkpoint {
            version: CHECKPOINT_FORMAT_VERSION,
            sequence,
            parent,
            phase: state.current_phase,
            committed_at: Utc::now(),
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&checkpoint).map_err(CheckpointError::Serialize)?;
        let path = self.snapshot_path(sequence);
        write_atomic(&path, &json).map_err(io_error(&path))?;
        self.write_pointer(sequence)?;
        self.write_mirror(state)?;

        debug!(sequence, phase = %state.current_phase, status = %state.status, "Checkpoint committed");
        Ok(sequence)
    }

    pub fn load_latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.latest_sequence()? {
            Some(seq) => self.read_checkpoint(seq).map(Some),
            None => Ok(None),
        }
    }

    pub fn load(&self, sequence: u64) -> Result<Checkpoint, CheckpointError> {
        self.read_checkpoint(sequence)
    }

    /// Snapshots reachable from `LATEST` through parent links, newest first.
    pub fn lineage(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut chain = Vec::new();
        let mut next = self.latest_sequence()?;
        while let Some(seq) = next {
            let checkpoint = self.read_checkpoint(seq)?;
            next = checkpoint.parent;
            chain.push(checkpoint);
        }
        Ok(chain)
    }

    /// The most recent snapshot at `phase` on the current lineage.
    pub fn load_at_phase(&self, phase: Phase) -> Result<Checkpoint, CheckpointError> {
        self.lineage()?
            .into_iter()
            .find(|c| c.phase == phase)
            .ok_or_else(|| CheckpointError::NoSnapshotAtPhase(phase.to_string()))
    }

    /// Re-point `LATEST` at the most recent snapshot taken at `phase`.
    pub fn rollback_to_phase(&self, phase: Phase) -> Result<Checkpoint, CheckpointError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CheckpointError::LockPoisoned)?;
        let _dir_lock = self.lock_dir()?;

        let target = self.load_at_phase(phase)?;
        self.write_pointer(target.sequence)?;
        self.write_mirror(&target.state)?;
        info!(sequence = target.sequence, %phase, "Rolled back");
        Ok(target)
    }

    /// Every snapshot on disk, ascending by sequence.
    pub fn history(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let latest = self.latest_sequence()?;
        self.sequences()?
            .into_iter()
            .map(|seq| {
                let c = self.read_checkpoint(seq)?;
                Ok(CheckpointSummary {
                    sequence: c.sequence,
                    parent: c.parent,
                    phase: c.phase,
                    status: c.state.status,
                    iteration: c.state.record(c.phase).iteration,
                    committed_at: c.committed_at,
                    is_latest: latest == Some(c.sequence),
                })
            })
            .collect()
    }
}
