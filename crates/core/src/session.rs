//! Session lifecycle, roots and reporting

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::conflict::Resolution;
use crate::error::{Result, SyncError};
use crate::path::RelPath;
use crate::snapshot::{ScanError, Side};

/// Lifecycle of one sync session.
///
/// `Initializing → InitialSync → Watching ⇄ Reconciling → Stopped`, with
/// `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Initializing,
    InitialSync,
    Watching,
    Reconciling,
    Stopped,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::InitialSync => "initial-sync",
            Self::Watching => "watching",
            Self::Reconciling => "reconciling",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A local root paired with the remote root it mirrors to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRoot {
    local: PathBuf,
    remote: String,
}

impl SyncRoot {
    /// Pair `local` (made absolute against the working directory) with a
    /// description of the remote root
    pub fn new(local: impl AsRef<Path>, remote: impl Into<String>) -> Result<Self> {
        let local = local.as_ref();
        let absolute = std::path::absolute(local).map_err(|e| SyncError::InvalidRoot {
            path: local.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            local: absolute,
            remote: remote.into(),
        })
    }

    #[must_use]
    pub fn local(&self) -> &Path {
        &self.local
    }

    #[must_use]
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Ensure the local root exists and is a directory, creating it if needed
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| SyncError::InvalidRoot {
            path: self.local.clone(),
            reason,
        };
        std::fs::create_dir_all(&self.local).map_err(|e| invalid(e.to_string()))?;
        let metadata = std::fs::metadata(&self.local).map_err(|e| invalid(e.to_string()))?;
        if !metadata.is_dir() {
            return Err(invalid("not a directory".into()));
        }
        Ok(())
    }
}

impl fmt::Display for SyncRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local.display(), self.remote)
    }
}

/// Informational events; none of these are errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A path changed on both sides; the local state was kept
    ConflictResolved { path: RelPath, resolution: Resolution },
    /// A change observed on `side` was recognised as caused by the engine
    EchoSuppressed { path: RelPath, side: Side },
    /// A reconciliation pass finished
    Reconciled { operations: usize, conflicts: usize },
    ConnectionLost,
    ConnectionRestored,
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictResolved { path, resolution } => {
                write!(f, "conflict at {path} resolved: {resolution:?}")
            }
            Self::EchoSuppressed { path, side } => write!(f, "suppressed {side} echo of {path}"),
            Self::Reconciled {
                operations,
                conflicts,
            } => write!(
                f,
                "reconciled with {operations} operations and {conflicts} conflicts"
            ),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionRestored => f.write_str("connection restored"),
        }
    }
}

/// Running totals of applied work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    /// Files written and directories created on the remote
    pub pushed: u64,
    /// Files written and directories created locally
    pub pulled: u64,
    pub deleted_remote: u64,
    pub deleted_local: u64,
    pub bytes_pushed: u64,
    pub bytes_pulled: u64,
    pub echoes_suppressed: u64,
    pub conflicts_resolved: u64,
}

impl SyncCounters {
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.pushed + self.pulled + self.deleted_remote + self.deleted_local
    }
}

/// Point-in-time view of a running or finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub state: SessionState,
    /// Cause of the `Failed` state
    pub last_error: Option<Arc<SyncError>>,
    /// Paths whose last sync attempt failed, with the cause
    pub failing: BTreeMap<RelPath, String>,
    /// Entries the latest scan of each side could not read
    pub scan_errors: Vec<(Side, ScanError)>,
    /// Most recent informational events, oldest first
    pub events: Vec<SyncEvent>,
    pub counters: SyncCounters,
}

impl SessionReport {
    /// Alive but with some paths not syncing
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.failing.is_empty() || !self.scan_errors.is_empty()
    }

    #[must_use]
    pub fn conflicts(&self) -> impl Iterator<Item = &RelPath> {
        self.events.iter().filter_map(|event| match event {
            SyncEvent::ConflictResolved { path, .. } => Some(path),
            _ => None,
        })
    }
}

/// Result of a one-shot initial sync
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub local_entries: usize,
    pub remote_entries: usize,
    /// Operations the plan called for
    pub planned: usize,
    pub counters: SyncCounters,
    pub failing: BTreeMap<RelPath, String>,
    pub scan_errors: Vec<(Side, ScanError)>,
    pub elapsed: Duration,
}

impl SyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failing.is_empty() && self.scan_errors.is_empty()
    }
}

const EVENT_HISTORY: usize = 256;

/// Mutable reporting state kept under the session lock
#[derive(Debug, Default)]
pub(crate) struct SessionRecord {
    pub(crate) last_error: Option<Arc<SyncError>>,
    pub(crate) failing: BTreeMap<RelPath, String>,
    local_scan_errors: Vec<ScanError>,
    remote_scan_errors: Vec<ScanError>,
    events: VecDeque<SyncEvent>,
    pub(crate) counters: SyncCounters,
}

impl SessionRecord {
    pub(crate) fn push_event(&mut self, event: SyncEvent) {
        if self.events.len() == EVENT_HISTORY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub(crate) fn set_scan_errors(&mut self, side: Side, errors: &[ScanError]) {
        let slot = match side {
            Side::Local => &mut self.local_scan_errors,
            Side::Remote => &mut self.remote_scan_errors,
        };
        slot.clear();
        slot.extend_from_slice(errors);
    }

    pub(crate) fn scan_errors(&self) -> Vec<(Side, ScanError)> {
        self.local_scan_errors
            .iter()
            .map(|e| (Side::Local, e.clone()))
            .chain(
                self.remote_scan_errors
                    .iter()
                    .map(|e| (Side::Remote, e.clone())),
            )
            .collect()
    }

    pub(crate) fn report(&self, state: SessionState) -> SessionReport {
        SessionReport {
            state,
            last_error: self.last_error.clone(),
            failing: self.failing.clone(),
            scan_errors: self.scan_errors(),
            events: self.events.iter().cloned().collect(),
            counters: self.counters,
        }
    }
}
