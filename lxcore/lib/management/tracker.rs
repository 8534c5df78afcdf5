//! Per-container mutual exclusion for long-running jobs.
//!
//! The tracker maps a container name to the one job currently allowed to mutate it. Lifecycle
//! commands consult it before touching the container tool and refuse while a slot is held.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{LxcoreError, LxcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of long-running job holding a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// A backup archive is being written.
    Backup,

    /// A backup archive is being restored.
    Restore,

    /// A directory-backed rootfs is being moved onto a BTRFS subvolume.
    ConvertBtrfs,

    /// A snapshot is being restored or cloned.
    Snapshot,
}

/// A public view of a tracker entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// The kind of job.
    pub kind: OperationKind,

    /// When the job was accepted.
    pub started_at: DateTime<Utc>,
}

/// The in-memory registry of active operations.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct OperationTracker {
    inner: Arc<Mutex<TrackerState>>,
}

/// Proof of holding the tracker slot of a container.
///
/// Dropping the slot releases it, so a job that fails or panics can never leave its container
/// locked.
#[derive(Debug)]
pub struct OperationSlot {
    tracker: OperationTracker,
    name: String,
    kind: OperationKind,
    generation: u64,
    abort: CancellationToken,
}

#[derive(Debug, Default)]
struct TrackerState {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

#[derive(Debug)]
struct Entry {
    info: OperationInfo,
    generation: u64,
    abort: Option<CancellationToken>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OperationKind {
    /// Returns `true` for job kinds that watch an abort signal.
    pub fn is_abortable(&self) -> bool {
        matches!(self, OperationKind::Backup)
    }
}

impl OperationTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims the slot of `name`.
    ///
    /// Fails with the current entry if any job already holds the slot.
    pub fn try_acquire(
        &self,
        name: &str,
        kind: OperationKind,
    ) -> Result<OperationSlot, OperationInfo> {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get(name) {
            return Err(entry.info.clone());
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let abort = CancellationToken::new();

        state.entries.insert(
            name.to_string(),
            Entry {
                info: OperationInfo {
                    kind,
                    started_at: Utc::now(),
                },
                generation,
                abort: kind.is_abortable().then(|| abort.clone()),
            },
        );

        tracing::debug!(container = %name, %kind, generation, "tracker slot acquired");
        Ok(OperationSlot {
            tracker: self.clone(),
            name: name.to_string(),
            kind,
            generation,
            abort,
        })
    }

    /// Claims the slot of `name`, rejecting with a message built from `verb` on conflict.
    pub fn acquire(
        &self,
        name: &str,
        kind: OperationKind,
        verb: &str,
    ) -> LxcoreResult<OperationSlot> {
        self.try_acquire(name, kind)
            .map_err(|info| LxcoreError::OperationInProgress {
                verb: verb.to_string(),
                kind: info.kind,
            })
    }

    /// Removes the entry of `name` unconditionally.
    pub fn release(&self, name: &str) {
        if self.lock().entries.remove(name).is_some() {
            tracing::debug!(container = %name, "tracker slot released");
        }
    }

    /// Returns the entry of `name`, if any.
    pub fn peek(&self, name: &str) -> Option<OperationInfo> {
        self.lock().entries.get(name).map(|entry| entry.info.clone())
    }

    /// Signals the job holding `name` to stop.
    ///
    /// Returns `true` if an entry existed. Jobs without an abort signal are left running.
    pub fn abort(&self, name: &str) -> bool {
        let state = self.lock();
        let Some(entry) = state.entries.get(name) else {
            return false;
        };

        match &entry.abort {
            Some(token) => {
                tracing::info!(container = %name, kind = %entry.info.kind, "abort requested");
                token.cancel();
            }
            None => {
                tracing::warn!(container = %name, kind = %entry.info.kind, "operation cannot be aborted");
            }
        }

        true
    }

    /// Fails with [`LxcoreError::OperationInProgress`] if a job holds `name`.
    pub fn ensure_idle(&self, name: &str, verb: &str) -> LxcoreResult<()> {
        match self.peek(name) {
            Some(info) => Err(LxcoreError::OperationInProgress {
                verb: verb.to_string(),
                kind: info.kind,
            }),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release_generation(&self, name: &str, generation: u64) {
        let mut state = self.lock();
        if state
            .entries
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.entries.remove(name);
            tracing::debug!(container = %name, generation, "tracker slot released");
        }
    }
}

impl OperationSlot {
    /// Returns the container name the slot is held for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kind of job holding the slot.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns the token that fires when the job is asked to abort.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Releases the slot now.
    pub fn release(self) {
        drop(self)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for OperationSlot {
    fn drop(&mut self) {
        self.tracker.release_generation(&self.name, self.generation);
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => write!(f, "backup"),
            OperationKind::Restore => write!(f, "restore"),
            OperationKind::ConvertBtrfs => write!(f, "convert-btrfs"),
            OperationKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
