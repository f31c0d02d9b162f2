//! livesync-core: Core sync engine
//!
//! Provides exclusion matching, tree scanning, snapshot diffing, change
//! batching, the transport capability interface and the orchestrator that
//! keeps a local tree and a remote target converged.

pub mod batch;
pub mod config;
pub mod conflict;
pub mod converge;
pub mod diff;
pub mod echo;
pub mod error;
pub mod exclude;
pub mod hash;
pub mod local_fs;
pub mod orchestrator;
pub mod path;
pub mod scan;
pub mod session;
pub mod snapshot;
pub mod transport;

pub use batch::{BatcherConfig, ChangeBatcher, WatchEvent, WatchOp};
pub use config::LivesyncConfig;
pub use conflict::{InitialPolicy, SyncPlan, compare_sides, plan_reconcile};
pub use converge::{ConvergenceWaiter, PathExpectation, Presence};
pub use diff::{ChangeSet, Direction, diff};
pub use error::{Result, SyncError};
pub use exclude::{ExclusionMatcher, ExclusionRule};
pub use hash::ContentHash;
pub use orchestrator::{SyncHandle, SyncOptions, SyncOrchestrator};
pub use path::RelPath;
pub use scan::Scanner;
pub use session::{SessionReport, SessionState, SyncEvent, SyncReport, SyncRoot};
pub use snapshot::{EntryKind, EntryMeta, Side, Snapshot};
pub use transport::{
    ConnectionStatus, RetryPolicy, RetryingTransport, TransportAdapter, TransportError,
};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
