//! Filesystem watcher bridge
//!
//! Turns `notify` events into [`WatchEvent`]s for the orchestrator's change
//! batcher. Each reported path is stat'ed once (without hashing) so the
//! batcher knows its kind and whether it still exists. Paths inside the
//! state directory are dropped here, before anything logs about them, since
//! the debug log itself is written there.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use notify::event::EventKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use livesync_core::exclude::STATE_DIR;
use livesync_core::{RelPath, Scanner, WatchEvent, WatchOp};

/// Watch `root` recursively. Events flow until the returned watcher is
/// dropped.
pub fn spawn(root: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<WatchEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let bridge = Bridge::new(root);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                for change in bridge.translate(&event) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("Watch error: {e}"),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    debug!("Watching {}", root.display());
    Ok((watcher, rx))
}

struct Bridge {
    root: PathBuf,
    /// Watchers on some platforms report canonical paths
    canonical_root: Option<PathBuf>,
    scanner: Scanner,
}

impl Bridge {
    fn new(root: &Path) -> Self {
        let canonical_root = std::fs::canonicalize(root)
            .ok()
            .filter(|canonical| canonical != root);
        Self {
            root: root.to_path_buf(),
            canonical_root,
            scanner: Scanner::new(root).hash_contents(false),
        }
    }

    fn relative(&self, path: &Path) -> Option<RelPath> {
        RelPath::from_native(&self.root, path)
            .ok()
            .or_else(|| {
                let canonical = self.canonical_root.as_deref()?;
                RelPath::from_native(canonical, path).ok()
            })
            .filter(|rel| !rel.is_root())
    }

    fn is_state(path: &RelPath) -> bool {
        path.as_str().split('/').next() == Some(STATE_DIR)
    }

    fn translate(&self, event: &notify::Event) -> Vec<WatchEvent> {
        let op = match event.kind {
            EventKind::Access(_) => return Vec::new(),
            EventKind::Create(_) => WatchOp::Created,
            EventKind::Remove(_) => WatchOp::Removed,
            // Renames report both ends; each side is stat'ed below
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => WatchOp::Modified,
        };

        let mut changes = Vec::with_capacity(event.paths.len());
        for native in &event.paths {
            let Some(path) = self.relative(native) else {
                trace!("Ignoring event outside the root: {}", native.display());
                continue;
            };
            if Self::is_state(&path) {
                continue;
            }
            let change = match self.scanner.entry(&path) {
                Ok(Some(meta)) => {
                    // A path removed and recreated before we looked
                    let op = if op == WatchOp::Removed {
                        WatchOp::Modified
                    } else {
                        op
                    };
                    WatchEvent::new(path, op).with_meta(meta)
                }
                Ok(None) => WatchEvent::new(path, op),
                Err(e) => {
                    debug!("Cannot stat {path}: {e}");
                    WatchEvent::new(path, WatchOp::Modified)
                }
            };
            changes.push(change);
        }
        changes
    }
}
