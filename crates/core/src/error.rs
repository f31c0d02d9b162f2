//! Error taxonomy for the sync engine

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::converge::Unmet;
use crate::path::RelPath;
use crate::transport::TransportError;

/// Result alias used throughout the core crate
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors surfaced by the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// An exclusion pattern could not be compiled. Fatal at startup.
    #[error("invalid exclusion pattern {pattern:?}: {reason}")]
    InvalidExclusionPattern { pattern: String, reason: String },

    /// A relative path was absolute, escaped the root, or was not UTF-8
    #[error("invalid relative path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// The local root cannot be used for syncing
    #[error("invalid sync root {}: {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: String },

    /// Per-entry failure on the local filesystem
    #[error("local I/O error at {path}: {source}")]
    LocalIo {
        path: RelPath,
        #[source]
        source: std::io::Error,
    },

    /// Per-entry failure on the remote side
    #[error("remote I/O error at {path}: {source}")]
    RemoteIo {
        path: RelPath,
        #[source]
        source: TransportError,
    },

    /// A transient transport failure that reached the engine unretried
    #[error("transient transport failure: {0}")]
    TransportTransient(#[source] TransportError),

    /// The transport gave up after exhausting its retries
    #[error("remote target unavailable: {0}")]
    TransportUnavailable(#[source] TransportError),

    /// Raised only by the convergence waiter
    #[error("no convergence within {timeout:?}; unmet: {}", summarize(unmet))]
    ConvergenceTimeout { timeout: Duration, unmet: Vec<Unmet> },

    /// A scan was cancelled between directories
    #[error("scan cancelled")]
    Cancelled,

    /// The session ended in the Failed state
    #[error("sync session failed: {0}")]
    SessionFailed(#[source] Arc<SyncError>),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl SyncError {
    /// Classify a transport error raised while working on `path`
    #[must_use]
    pub fn from_transport(path: &RelPath, err: TransportError) -> Self {
        match err {
            TransportError::Unavailable { .. } => Self::TransportUnavailable(err),
            TransportError::Transient { .. } => Self::TransportTransient(err),
            other => Self::RemoteIo {
                path: path.clone(),
                source: other,
            },
        }
    }

    /// Whether this error must stop the session rather than just the entry
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::LocalIo { .. } | Self::RemoteIo { .. })
    }

    /// Path this error is attached to, for per-entry errors
    #[must_use]
    pub fn entry_path(&self) -> Option<&RelPath> {
        match self {
            Self::LocalIo { path, .. } | Self::RemoteIo { path, .. } => Some(path),
            _ => None,
        }
    }
}

fn summarize(unmet: &[Unmet]) -> String {
    unmet
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
