//! Transport to a directory on this machine
//!
//! Covers remotes that are reachable as a local path (a mounted share or a
//! bind-mounted container volume) and serves as the engine's test double.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use livesync_core::local_fs;
use livesync_core::transport::Op;
use livesync_core::{
    ContentHash, EntryMeta, ExclusionMatcher, RelPath, Scanner, Side, Snapshot, SyncError,
    TransportAdapter, TransportError,
};

/// A remote root that is a plain local directory
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
    scanner: Scanner,
}

impl LocalTransport {
    /// Create a transport rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    /// Returns an error if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let scanner = Scanner::new(&root).side(Side::Remote);
        Ok(Self { root, scanner })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<R, F>(&self, op: Op, path: &RelPath, f: F) -> Result<R, TransportError>
    where
        F: FnOnce(&Path) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(&root))
            .await
            .map_err(|e| TransportError::Other {
                op,
                path: path.clone(),
                message: e.to_string(),
            })?
            .map_err(|e| TransportError::from_io(op, path, &e))
    }
}

#[async_trait]
impl TransportAdapter for LocalTransport {
    async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
        let target = path.clone();
        let written = self
            .blocking(Op::Push, path, move |root| {
                let native = target.to_native(root);
                let unchanged = std::fs::metadata(&native).is_ok_and(|m| m.is_file())
                    && ContentHash::from_file(&native)
                        .is_ok_and(|hash| hash == ContentHash::from_bytes(&content));
                if unchanged {
                    return Ok(false);
                }
                local_fs::write_file(root, &target, &content)?;
                Ok(true)
            })
            .await?;

        if !written {
            debug!(%path, "identical content already present, skipping write");
        }
        Ok(())
    }

    async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
        let target = path.clone();
        self.blocking(Op::Pull, path, move |root| {
            local_fs::read_file(root, &target).map(Bytes::from)
        })
        .await
    }

    async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
        let target = path.clone();
        self.blocking(Op::Delete, path, move |root| local_fs::remove(root, &target))
            .await
    }

    async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
        let target = path.clone();
        self.blocking(Op::Mkdir, path, move |root| local_fs::create_dir(root, &target))
            .await
    }

    async fn list(&self, root: &RelPath) -> Result<Snapshot, TransportError> {
        let scanner = self.scanner.clone();
        let start = root.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            let matcher = ExclusionMatcher::empty();
            if start.is_root() {
                scanner.scan(&matcher)
            } else {
                scanner.scan_subtree(&start, &matcher)
            }
        })
        .await
        .map_err(|e| TransportError::Other {
            op: Op::List,
            path: root.clone(),
            message: e.to_string(),
        })?;

        scanned.map_err(|err| match err {
            SyncError::LocalIo { source, .. } => TransportError::from_io(Op::List, root, &source),
            other => TransportError::Other {
                op: Op::List,
                path: root.clone(),
                message: other.to_string(),
            },
        })
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<EntryMeta>, TransportError> {
        let scanner = self.scanner.clone();
        let target = path.clone();
        self.blocking(Op::List, path, move |_| scanner.entry(&target))
            .await
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}
