//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use livesync_core::converge::{LocalObserver, TransportObserver};
use livesync_core::transport::Op;
use livesync_core::{
    BatcherConfig, ConvergenceWaiter, ExclusionRule, RelPath, RetryPolicy, Snapshot, SyncOptions,
    SyncRoot, TransportAdapter, TransportError,
};
use livesync_transport::LocalTransport;

pub const CONTENT: &str = "TestContents";

pub fn rel(s: &str) -> RelPath {
    RelPath::new(s).unwrap()
}

pub fn write(root: &Path, path: &str, content: &str) {
    let native = root.join(path);
    std::fs::create_dir_all(native.parent().unwrap()).unwrap();
    std::fs::write(native, content).unwrap();
}

pub fn read(root: &Path, path: &str) -> String {
    std::fs::read_to_string(root.join(path)).unwrap()
}

pub fn sync_root(local: &Path, remote: &LocalTransport) -> SyncRoot {
    SyncRoot::new(local, remote.describe()).unwrap()
}

/// Fast polling and short backoffs so tests settle quickly
pub fn options() -> SyncOptions {
    let mut options = SyncOptions::default()
        .poll_interval(Duration::from_millis(50))
        .retry(RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        });
    options.batcher = BatcherConfig {
        window: Duration::from_millis(20),
        capacity: 1024,
    };
    options.reconnect_timeout = Duration::from_secs(10);
    options
}

pub fn reference_rules() -> Vec<ExclusionRule> {
    ["ignoredFile", "ignoredFolder", "testFolder/ignoredFile"]
        .into_iter()
        .map(ExclusionRule::new)
        .collect()
}

pub fn waiter(
    local: &Path,
    remote: &LocalTransport,
) -> ConvergenceWaiter<LocalObserver, TransportObserver<LocalTransport>> {
    ConvergenceWaiter::new(
        LocalObserver::new(local),
        TransportObserver::new(remote.clone()),
    )
    .with_interval(Duration::from_millis(25))
}

/// Wraps a [`LocalTransport`] and injects failures and latency into pushes
#[derive(Debug)]
pub struct FaultyTransport {
    inner: LocalTransport,
    denied: Option<RelPath>,
    transient_failures: AtomicU32,
    push_delay: Duration,
    push_calls: AtomicU32,
}

impl FaultyTransport {
    pub fn new(inner: LocalTransport) -> Self {
        Self {
            inner,
            denied: None,
            transient_failures: AtomicU32::new(0),
            push_delay: Duration::ZERO,
            push_calls: AtomicU32::new(0),
        }
    }

    /// Refuse every push to `path`
    pub fn deny(mut self, path: &str) -> Self {
        self.denied = Some(rel(path));
        self
    }

    /// Fail the next `count` pushes with a transient error
    pub fn flaky(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    pub fn push_calls(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportAdapter for FaultyTransport {
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if !self.push_delay.is_zero() {
            tokio::time::sleep(self.push_delay).await;
        }
        if self.denied.as_ref() == Some(path) {
            return Err(TransportError::PermissionDenied {
                path: path.clone(),
                message: "read-only file".into(),
            });
        }
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Transient {
                op: Op::Push,
                path: path.clone(),
                message: "connection reset by peer".into(),
            });
        }
        self.inner.push(path, content).await
    }

    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
        self.inner.pull(path).await
    }

    async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
        self.inner.delete(path).await
    }

    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
        self.inner.mkdir(path).await
    }

    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError> {
        self.inner.list(root).await
    }

    fn describe(&self) -> String {
        format!("faulty {}", self.inner.describe())
    }
}
