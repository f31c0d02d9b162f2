//! The boundary to the remote target
//!
//! [`TransportAdapter`] is the capability interface the orchestrator talks
//! to. Concrete adapters live in the `livesync-transport` crate; this module
//! owns the error classification and the retry wrapper shared by all of them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::lock;
use crate::path::RelPath;
use crate::snapshot::{EntryMeta, Snapshot};

/// Transport operation, for logging and error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Push,
    Pull,
    Delete,
    Mkdir,
    List,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Delete => "delete",
            Self::Mkdir => "mkdir",
            Self::List => "list",
        })
    }
}

/// Classified transport failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Timeouts, dropped connections and the like; retried
    #[error("{op} {path}: {message}")]
    Transient {
        op: Op,
        path: RelPath,
        message: String,
    },

    #[error("{path}: permission denied: {message}")]
    PermissionDenied { path: RelPath, message: String },

    #[error("{path}: quota exceeded: {message}")]
    QuotaExceeded { path: RelPath, message: String },

    #[error("{path}: not found")]
    NotFound { path: RelPath },

    /// Retries were exhausted
    #[error("{op} {path}: gave up after {attempts} attempts: {last}")]
    Unavailable {
        op: Op,
        path: RelPath,
        attempts: u32,
        last: Box<TransportError>,
    },

    #[error("{op} {path}: {message}")]
    Other {
        op: Op,
        path: RelPath,
        message: String,
    },
}

impl TransportError {
    /// Classify an I/O error raised while performing `op` on `path`
    #[must_use]
    pub fn from_io(op: Op, path: &RelPath, err: &io::Error) -> Self {
        let path = path.clone();
        let message = err.to_string();
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable => Self::Transient { op, path, message },
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied { path, message }
            }
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                Self::QuotaExceeded { path, message }
            }
            io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Other { op, path, message },
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    #[must_use]
    pub fn path(&self) -> &RelPath {
        match self {
            Self::Transient { path, .. }
            | Self::PermissionDenied { path, .. }
            | Self::QuotaExceeded { path, .. }
            | Self::NotFound { path }
            | Self::Unavailable { path, .. }
            | Self::Other { path, .. } => path,
        }
    }
}

/// Capability interface to one remote root.
///
/// All operations are idempotent: pushing identical content again is a
/// no-op, and deleting an absent path succeeds. Paths are relative to the
/// adapter's root.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Write `content` to the file at `path`, creating parents and replacing
    /// whatever is there
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError>;

    /// Read the file at `path`
    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError>;

    /// Remove `path`, recursively for directories
    async fn delete(&self, path: &RelPath) -> Result<(), TransportError>;

    /// Create the directory `path` and its parents, replacing a file in the way
    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError>;

    /// Snapshot everything below `root` (relative to the adapter's root).
    /// Entry paths are relative to the adapter's root.
    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError>;

    /// State of the single entry at `path`, `None` when absent. The default
    /// lists the parent; adapters with a cheaper lookup override it.
    async fn stat(&self, path: &RelPath) -> Result<Option<EntryMeta>, TransportError> {
        let parent = path.parent().unwrap_or_else(RelPath::root);
        Ok(self.list(&parent).await?.get(path).cloned())
    }

    /// Human-readable description of the target, for logs
    fn describe(&self) -> String;
}

#[async_trait]
impl<T: TransportAdapter + ?Sized> TransportAdapter for Arc<T> {
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
        (**self).push(path, content).await
    }

    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
        (**self).pull(path).await
    }

    async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
        (**self).delete(path).await
    }

    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
        (**self).mkdir(path).await
    }

    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError> {
        (**self).list(root).await
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<EntryMeta>, TransportError> {
        (**self).stat(path).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[async_trait]
impl<T: TransportAdapter + ?Sized> TransportAdapter for Box<T> {
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
        (**self).push(path, content).await
    }

    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
        (**self).pull(path).await
    }

    async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
        (**self).delete(path).await
    }

    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
        (**self).mkdir(path).await
    }

    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError> {
        (**self).list(root).await
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<EntryMeta>, TransportError> {
        (**self).stat(path).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Liveness of the remote connection, reported by the connection collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Lost,
}

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first transient error
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Sum of all delays a fully retried call can sleep through
    #[must_use]
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_attempts).map(|attempt| self.backoff(attempt)).sum()
    }
}

/// One transport call currently executing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRequest {
    pub id: u64,
    pub op: Op,
    pub path: RelPath,
    /// Current attempt, starting at 1
    pub attempt: u32,
}

#[derive(Debug)]
struct Registry {
    requests: std::sync::Mutex<HashMap<u64, InFlightRequest>>,
    next_id: AtomicU64,
    count: watch::Sender<usize>,
}

impl Registry {
    fn new() -> Self {
        Self {
            requests: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            count: watch::Sender::new(0),
        }
    }

    fn register(&self, op: Op, path: &RelPath) -> InFlightGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut requests = lock(&self.requests);
        requests.insert(
            id,
            InFlightRequest {
                id,
                op,
                path: path.clone(),
                attempt: 1,
            },
        );
        self.count.send_replace(requests.len());
        InFlightGuard { registry: self, id }
    }
}

/// Removes its request from the registry when the call ends or is dropped
struct InFlightGuard<'a> {
    registry: &'a Registry,
    id: u64,
}

impl InFlightGuard<'_> {
    fn set_attempt(&self, attempt: u32) {
        if let Some(request) = lock(&self.registry.requests).get_mut(&self.id) {
            request.attempt = attempt;
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut requests = lock(&self.registry.requests);
        requests.remove(&self.id);
        self.registry.count.send_replace(requests.len());
    }
}

/// Wraps an adapter with retries for transient failures and in-flight
/// bookkeeping. Permanent failures pass through unchanged.
#[derive(Debug)]
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
    registry: Registry,
}

impl<T: TransportAdapter> RetryingTransport<T> {
    #[must_use]
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            registry: Registry::new(),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls currently executing, oldest first
    #[must_use]
    pub fn in_flight(&self) -> Vec<InFlightRequest> {
        let mut requests: Vec<_> = lock(&self.registry.requests).values().cloned().collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    /// Resolve once no call is executing
    pub async fn wait_idle(&self) {
        let mut count = self.registry.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = count.wait_for(|n| *n == 0).await;
    }

    async fn run<R, F, Fut>(&self, op: Op, path: &RelPath, mut call: F) -> Result<R, TransportError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<R, TransportError>> + Send,
        R: Send,
    {
        let guard = self.registry.register(op, path);
        let mut attempt = 1;

        loop {
            guard.set_attempt(attempt);
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%op, %path, attempt, "transport call recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(%op, %path, attempt, ?delay, error = %err, "transient transport failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(TransportError::Unavailable {
                        op,
                        path: path.clone(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<T: TransportAdapter> TransportAdapter for RetryingTransport<T> {
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
        self.run(Op::Push, path, || self.inner.push(path, content.clone()))
            .await
    }

    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
        self.run(Op::Pull, path, || self.inner.pull(path)).await
    }

    async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
        self.run(Op::Delete, path, || self.inner.delete(path)).await
    }

    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
        self.run(Op::Mkdir, path, || self.inner.mkdir(path)).await
    }

    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError> {
        self.run(Op::List, root, || self.inner.list(root)).await
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<EntryMeta>, TransportError> {
        self.run(Op::List, path, || self.inner.stat(path)).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Side;
    use std::sync::atomic::AtomicU32;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    /// Fails `failures` times with the given error before succeeding
    struct Flaky {
        failures: u32,
        error: TransportError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: TransportError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn attempt(&self) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl TransportAdapter for Flaky {
        async fn push(&self, _path: &RelPath, _content: Bytes) -> Result<(), TransportError> {
            self.attempt()
        }

        async fn pull(&self, _path: &RelPath) -> Result<Bytes, TransportError> {
            self.attempt().map(|()| Bytes::from_static(b"ok"))
        }

        async fn delete(&self, _path: &RelPath) -> Result<(), TransportError> {
            self.attempt()
        }

        async fn mkdir(&self, _path: &RelPath) -> Result<(), TransportError> {
            self.attempt()
        }

        async fn list(&self, _root: &RelPath) -> Result<Snapshot, TransportError> {
            self.attempt().map(|()| Snapshot::empty(Side::Remote))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    fn transient(path: &str) -> TransportError {
        TransportError::Transient {
            op: Op::Push,
            path: rel(path),
            message: "connection reset by peer".into(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(5));
        assert_eq!(policy.worst_case_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn test_io_error_classification() {
        let path = rel("a");
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(TransportError::from_io(Op::Push, &path, &reset).is_transient());

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            TransportError::from_io(Op::Push, &path, &denied),
            TransportError::PermissionDenied { .. }
        ));

        let full = io::Error::from(io::ErrorKind::StorageFull);
        assert!(matches!(
            TransportError::from_io(Op::Push, &path, &full),
            TransportError::QuotaExceeded { .. }
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = RetryingTransport::new(Flaky::new(2, transient("a")), fast_policy(5));
        transport
            .push(&rel("a"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 3);
        assert!(transport.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_becomes_unavailable() {
        let transport = RetryingTransport::new(Flaky::new(10, transient("a")), fast_policy(3));
        let err = transport.delete(&rel("a")).await.unwrap_err();

        match err {
            TransportError::Unavailable { op, attempts, last, .. } => {
                assert_eq!(op, Op::Delete);
                assert_eq!(attempts, 3);
                assert!(last.is_transient());
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_surface_immediately() {
        let denied = TransportError::PermissionDenied {
            path: rel("a"),
            message: "read-only".into(),
        };
        let transport = RetryingTransport::new(Flaky::new(10, denied.clone()), fast_policy(5));

        let err = transport.mkdir(&rel("a")).await.unwrap_err();
        assert_eq!(err, denied);
        assert_eq!(transport.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_registry_tracks_calls() {
        struct Gate(tokio::sync::Notify);

        #[async_trait]
        impl TransportAdapter for Gate {
            async fn push(&self, _path: &RelPath, _content: Bytes) -> Result<(), TransportError> {
                self.0.notified().await;
                Ok(())
            }
            async fn pull(&self, _path: &RelPath) -> Result<Bytes, TransportError> {
                Ok(Bytes::new())
            }
            async fn delete(&self, _path: &RelPath) -> Result<(), TransportError> {
                Ok(())
            }
            async fn mkdir(&self, _path: &RelPath) -> Result<(), TransportError> {
                Ok(())
            }
            async fn list(&self, _root: &RelPath) -> Result<Snapshot, TransportError> {
                Ok(Snapshot::empty(Side::Remote))
            }
            fn describe(&self) -> String {
                "gate".to_string()
            }
        }

        let transport = Arc::new(RetryingTransport::new(
            Gate(tokio::sync::Notify::new()),
            RetryPolicy::default(),
        ));

        let pushing = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.push(&rel("slow.txt"), Bytes::new()).await })
        };

        // Wait until the call is registered
        while transport.in_flight().is_empty() {
            tokio::task::yield_now().await;
        }
        let in_flight = transport.in_flight();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].op, Op::Push);
        assert_eq!(in_flight[0].path, rel("slow.txt"));

        transport.inner().0.notify_one();
        transport.wait_idle().await;
        pushing.await.unwrap().unwrap();
        assert!(transport.in_flight().is_empty());
    }
}
