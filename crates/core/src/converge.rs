//! Convergence verification
//!
//! Sync completion is eventual: a push returning does not mean the other
//! side has settled. [`ConvergenceWaiter`] polls both sides until a set of
//! [`PathExpectation`]s holds at once, or reports which ones never did.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::path::RelPath;
use crate::snapshot::Side;
use crate::transport::{TransportAdapter, TransportError};

/// Expected state of a path on one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Absent,
    Dir,
    /// A file, with exact content when given
    File(Option<Bytes>),
    /// Not checked on this side
    Any,
}

impl Presence {
    #[must_use]
    pub fn is_satisfied_by(&self, observed: &Observed) -> bool {
        match (self, observed) {
            (Self::Any, _)
            | (Self::Absent, Observed::Missing)
            | (Self::Dir, Observed::Dir)
            | (Self::File(None), Observed::File(_)) => true,
            (Self::File(Some(expected)), Observed::File(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::Dir => f.write_str("directory"),
            Self::File(None) => f.write_str("file"),
            Self::File(Some(content)) => write!(f, "file {}", preview(content)),
            Self::Any => f.write_str("anything"),
        }
    }
}

/// State of a path as seen by an observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Missing,
    Dir,
    File(Bytes),
    /// The side could not be inspected
    Error(String),
}

impl fmt::Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("missing"),
            Self::Dir => f.write_str("directory"),
            Self::File(content) => write!(f, "file {}", preview(content)),
            Self::Error(message) => write!(f, "error ({message})"),
        }
    }
}

fn preview(content: &Bytes) -> String {
    const LIMIT: usize = 32;
    let text = String::from_utf8_lossy(content);
    if text.chars().count() > LIMIT {
        let head: String = text.chars().take(LIMIT).collect();
        format!("{head:?}... ({} bytes)", content.len())
    } else {
        format!("{text:?}")
    }
}

/// What one path should look like on each side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpectation {
    pub path: RelPath,
    pub local: Presence,
    pub remote: Presence,
}

impl PathExpectation {
    #[must_use]
    pub fn new(path: RelPath, local: Presence, remote: Presence) -> Self {
        Self {
            path,
            local,
            remote,
        }
    }

    /// Same file content on both sides
    #[must_use]
    pub fn mirrored_file(path: RelPath, content: impl Into<Bytes>) -> Self {
        let content = Some(content.into());
        Self::new(path, Presence::File(content.clone()), Presence::File(content))
    }

    /// A local file that must never reach the remote
    #[must_use]
    pub fn local_only_file(path: RelPath, content: impl Into<Bytes>) -> Self {
        Self::new(path, Presence::File(Some(content.into())), Presence::Absent)
    }

    #[must_use]
    pub fn mirrored_dir(path: RelPath) -> Self {
        Self::new(path, Presence::Dir, Presence::Dir)
    }

    #[must_use]
    pub fn local_only_dir(path: RelPath) -> Self {
        Self::new(path, Presence::Dir, Presence::Absent)
    }

    /// Gone from both sides
    #[must_use]
    pub fn absent(path: RelPath) -> Self {
        Self::new(path, Presence::Absent, Presence::Absent)
    }

    fn expected(&self, side: Side) -> &Presence {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

/// One expectation that does not hold on one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmet {
    pub path: RelPath,
    pub side: Side,
    pub expected: Presence,
    pub observed: Observed,
}

impl fmt::Display for Unmet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: expected {}, found {}",
            self.side, self.path, self.expected, self.observed
        )
    }
}

/// Observed state per path; paths without an entry are missing
pub type Observations = BTreeMap<RelPath, Observed>;

/// Reads the current state of a set of paths on one side
#[async_trait]
pub trait SideObserver: Send + Sync {
    fn side(&self) -> Side;

    async fn observe(&self, paths: &[RelPath]) -> Result<Observations>;
}

/// Observes a local directory tree
#[derive(Debug, Clone)]
pub struct LocalObserver {
    root: PathBuf,
    side: Side,
}

impl LocalObserver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            side: Side::Local,
        }
    }

    /// Report observations as belonging to `side`, for a remote that is a
    /// locally reachable directory
    #[must_use]
    pub fn as_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    fn observe_path(&self, path: &RelPath) -> Observed {
        let native = path.to_native(&self.root);
        match std::fs::metadata(&native) {
            Ok(metadata) if metadata.is_dir() => Observed::Dir,
            Ok(_) => match std::fs::read(&native) {
                Ok(content) => Observed::File(Bytes::from(content)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Observed::Missing,
                Err(e) => Observed::Error(e.to_string()),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Observed::Missing,
            Err(e) => Observed::Error(e.to_string()),
        }
    }
}

#[async_trait]
impl SideObserver for LocalObserver {
    fn side(&self) -> Side {
        self.side
    }

    async fn observe(&self, paths: &[RelPath]) -> Result<Observations> {
        let observer = self.clone();
        let paths = paths.to_vec();
        tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|path| {
                    let observed = observer.observe_path(&path);
                    (path, observed)
                })
                .collect()
        })
        .await
        .map_err(|e| SyncError::TaskFailed(e.to_string()))
    }
}

/// Observes the remote through any transport adapter
#[derive(Debug, Clone)]
pub struct TransportObserver<T> {
    transport: T,
}

impl<T: TransportAdapter> TransportObserver<T> {
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: TransportAdapter> SideObserver for TransportObserver<T> {
    fn side(&self) -> Side {
        Side::Remote
    }

    async fn observe(&self, paths: &[RelPath]) -> Result<Observations> {
        let root = RelPath::root();
        let listing = self
            .transport
            .list(&root)
            .await
            .map_err(|e| SyncError::from_transport(&root, e))?;

        let mut observations = Observations::new();
        for path in paths {
            let observed = match listing.get(path) {
                None => Observed::Missing,
                Some(meta) if meta.is_dir() => Observed::Dir,
                Some(_) => match self.transport.pull(path).await {
                    Ok(content) => Observed::File(content),
                    Err(TransportError::NotFound { .. }) => Observed::Missing,
                    Err(e) => Observed::Error(e.to_string()),
                },
            };
            observations.insert(path.clone(), observed);
        }
        Ok(observations)
    }
}

/// Compare expectations against one observation of each side
#[must_use]
pub fn check(
    expectations: &[PathExpectation],
    local: &Observations,
    remote: &Observations,
) -> Vec<Unmet> {
    let mut unmet = Vec::new();
    for expectation in expectations {
        for (side, observations) in [(Side::Local, local), (Side::Remote, remote)] {
            let expected = expectation.expected(side);
            let observed = observations
                .get(&expectation.path)
                .cloned()
                .unwrap_or(Observed::Missing);
            if !expected.is_satisfied_by(&observed) {
                unmet.push(Unmet {
                    path: expectation.path.clone(),
                    side,
                    expected: expected.clone(),
                    observed,
                });
            }
        }
    }
    unmet
}

/// Polls two observers until expectations hold or a timeout elapses
#[derive(Debug)]
pub struct ConvergenceWaiter<L, R> {
    local: L,
    remote: R,
    interval: Duration,
}

impl<L: SideObserver, R: SideObserver> ConvergenceWaiter<L, R> {
    #[must_use]
    pub fn new(local: L, remote: R) -> Self {
        Self {
            local,
            remote,
            interval: Duration::from_millis(100),
        }
    }

    /// Delay between polls (default 100 ms)
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Evaluate once, then keep polling until every expectation holds on
    /// both sides in the same round.
    ///
    /// # Errors
    /// Returns `ConvergenceTimeout` listing the expectations still unmet in
    /// the last round.
    pub async fn await_convergence(
        &self,
        expectations: &[PathExpectation],
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let paths: Vec<RelPath> = expectations.iter().map(|e| e.path.clone()).collect();
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            let (local, remote) = tokio::join!(
                observe_or_report(&self.local, &paths),
                observe_or_report(&self.remote, &paths)
            );

            let unmet = check(expectations, &local, &remote);
            if unmet.is_empty() {
                debug!(rounds, "converged");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SyncError::ConvergenceTimeout { timeout, unmet });
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

/// Observation errors count as unmet for every path instead of aborting
async fn observe_or_report<O: SideObserver>(observer: &O, paths: &[RelPath]) -> Observations {
    match observer.observe(paths).await {
        Ok(observations) => observations,
        Err(e) => {
            debug!(side = %observer.side(), error = %e, "observation failed");
            let message = e.to_string();
            paths
                .iter()
                .map(|path| (path.clone(), Observed::Error(message.clone())))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn observations(entries: Vec<(&str, Observed)>) -> Observations {
        entries.into_iter().map(|(p, o)| (rel(p), o)).collect()
    }

    #[test]
    fn test_check_reports_each_failing_side() {
        let expectations = vec![
            PathExpectation::mirrored_file(rel("testFile1"), "TestContents"),
            PathExpectation::local_only_file(rel("ignoredFile"), "TestContents"),
            PathExpectation::mirrored_dir(rel("testFolder2")),
        ];
        let local = observations(vec![
            ("testFile1", Observed::File(Bytes::from_static(b"TestContents"))),
            ("ignoredFile", Observed::File(Bytes::from_static(b"TestContents"))),
            ("testFolder2", Observed::Dir),
        ]);
        let remote = observations(vec![
            ("testFile1", Observed::File(Bytes::from_static(b"stale"))),
            ("ignoredFile", Observed::File(Bytes::from_static(b"TestContents"))),
        ]);

        let unmet = check(&expectations, &local, &remote);
        let summary: Vec<_> = unmet
            .iter()
            .map(|u| (u.path.as_str(), u.side, u.observed.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("testFile1", Side::Remote, Observed::File(Bytes::from_static(b"stale"))),
                (
                    "ignoredFile",
                    Side::Remote,
                    Observed::File(Bytes::from_static(b"TestContents"))
                ),
                ("testFolder2", Side::Remote, Observed::Missing),
            ]
        );
    }

    #[test]
    fn test_check_passes_when_all_hold() {
        let expectations = vec![
            PathExpectation::mirrored_file(rel("a"), "x"),
            PathExpectation::absent(rel("gone")),
            PathExpectation::new(rel("either"), Presence::Any, Presence::File(None)),
        ];
        let local = observations(vec![("a", Observed::File(Bytes::from_static(b"x")))]);
        let remote = observations(vec![
            ("a", Observed::File(Bytes::from_static(b"x"))),
            ("either", Observed::File(Bytes::from_static(b"whatever"))),
        ]);
        assert!(check(&expectations, &local, &remote).is_empty());
    }

    #[test]
    fn test_unmet_display() {
        let unmet = Unmet {
            path: rel("testFolder/testFile1"),
            side: Side::Remote,
            expected: Presence::File(Some(Bytes::from_static(b"TestContents"))),
            observed: Observed::Missing,
        };
        assert_eq!(
            unmet.to_string(),
            "remote testFolder/testFile1: expected file \"TestContents\", found missing"
        );
    }

    #[tokio::test]
    async fn test_waiter_succeeds_once_state_appears() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::write(local.path().join("a.txt"), "hello").unwrap();

        let remote_path = remote.path().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(remote_path.join("a.txt"), "hello").unwrap();
        });

        let waiter = ConvergenceWaiter::new(
            LocalObserver::new(local.path()),
            LocalObserver::new(remote.path()).as_side(Side::Remote),
        )
        .with_interval(Duration::from_millis(10));

        waiter
            .await_convergence(
                &[PathExpectation::mirrored_file(rel("a.txt"), "hello")],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_times_out_naming_unmet() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::write(local.path().join("a.txt"), "hello").unwrap();

        let waiter = ConvergenceWaiter::new(
            LocalObserver::new(local.path()),
            LocalObserver::new(remote.path()).as_side(Side::Remote),
        )
        .with_interval(Duration::from_millis(10));

        let err = waiter
            .await_convergence(
                &[PathExpectation::mirrored_file(rel("a.txt"), "hello")],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        match err {
            SyncError::ConvergenceTimeout { unmet, .. } => {
                assert_eq!(unmet.len(), 1);
                assert_eq!(unmet[0].path, rel("a.txt"));
                assert_eq!(unmet[0].side, Side::Remote);
                assert_eq!(unmet[0].observed, Observed::Missing);
            }
            other => panic!("expected ConvergenceTimeout, got {other:?}"),
        }
    }
}
