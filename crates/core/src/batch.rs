//! Debounced batching of raw watcher events into change sets

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::diff::{Change, ChangeSet, Direction};
use crate::exclude::ExclusionMatcher;
use crate::path::RelPath;
use crate::snapshot::{EntryKind, EntryMeta};

/// What the watcher saw happen to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Created,
    Modified,
    Removed,
}

/// A raw change notification from the watcher collaborator.
///
/// `meta` is the state observed right after the event, if the path still
/// existed. A create or modify without metadata means the path vanished
/// before it could be inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: RelPath,
    pub op: WatchOp,
    pub meta: Option<EntryMeta>,
}

impl WatchEvent {
    #[must_use]
    pub fn new(path: RelPath, op: WatchOp) -> Self {
        Self {
            path,
            op,
            meta: None,
        }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: EntryMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Debounce window, measured from the first event of a batch
    pub window: Duration,
    /// Distinct pending paths that force an early emit
    pub capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(300),
            capacity: 4096,
        }
    }
}

#[derive(Debug)]
struct Pending {
    first: WatchOp,
    first_kind: Option<EntryKind>,
    last: WatchOp,
    meta: Option<EntryMeta>,
}

/// Collects watcher events keyed by path and collapses each path's events
/// to its final observed state
#[derive(Debug)]
pub struct ChangeBatcher {
    config: BatcherConfig,
    matcher: ExclusionMatcher,
    pending: HashMap<RelPath, Pending>,
    opened_at: Option<Instant>,
}

impl ChangeBatcher {
    #[must_use]
    pub fn new(config: BatcherConfig, matcher: ExclusionMatcher) -> Self {
        Self {
            config,
            matcher,
            pending: HashMap::new(),
            opened_at: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Distinct paths waiting for the window to close
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// When the current window closes, if one is open
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.config.window)
    }

    /// Add one event. Returns true once the pending set is saturated and
    /// should be emitted without waiting for the window.
    pub fn record(&mut self, event: WatchEvent) -> bool {
        let kind = event.meta.as_ref().map(|meta| meta.kind);
        let excluded = match kind {
            Some(kind) => self.matcher.is_excluded(&event.path, kind),
            None => {
                self.matcher.is_excluded(&event.path, EntryKind::File)
                    || self.matcher.is_excluded(&event.path, EntryKind::Dir)
            }
        };
        if excluded || event.path.is_root() {
            return self.saturated();
        }

        match self.pending.get_mut(&event.path) {
            Some(pending) => {
                pending.last = event.op;
                if event.meta.is_some() {
                    pending.meta = event.meta;
                }
            }
            None => {
                self.pending.insert(
                    event.path,
                    Pending {
                        first: event.op,
                        first_kind: kind,
                        last: event.op,
                        meta: event.meta,
                    },
                );
            }
        }

        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.saturated()
    }

    fn saturated(&self) -> bool {
        self.pending.len() >= self.config.capacity
    }

    /// Close the window and collapse the pending events. Returns `None` when
    /// nothing survives the collapse.
    pub fn take(&mut self) -> Option<ChangeSet> {
        self.opened_at = None;
        if self.pending.is_empty() {
            return None;
        }

        let mut changes = ChangeSet::new(Direction::LocalToRemote);
        for (path, pending) in self.pending.drain() {
            let removed_meta = |pending: &Pending| {
                pending.meta.clone().unwrap_or_else(|| match pending.first_kind {
                    Some(EntryKind::Dir) => EntryMeta::dir(),
                    _ => EntryMeta::file(0, None, None),
                })
            };

            match (pending.first, pending.last) {
                (WatchOp::Created, WatchOp::Removed) => {}
                (_, WatchOp::Removed) => {
                    let meta = removed_meta(&pending);
                    changes.removed.push(Change::new(path, meta));
                }
                (first, _) => match pending.meta {
                    // Vanished before it could be inspected
                    None if first == WatchOp::Created => {}
                    None => {
                        let meta = removed_meta(&pending);
                        changes.removed.push(Change::new(path, meta));
                    }
                    Some(meta) => {
                        let kind_changed = pending.first_kind.is_some_and(|k| k != meta.kind);
                        if first == WatchOp::Created || (first == WatchOp::Removed && kind_changed)
                        {
                            changes.added.push(Change::new(path, meta));
                        } else {
                            changes.modified.push(Change::new(path, meta));
                        }
                    }
                },
            }
        }

        changes.normalize();
        (!changes.is_empty()).then_some(changes)
    }
}

/// Drive a batcher: read events without ever blocking the producer and emit
/// one change set per closed window, or early when the batcher saturates.
/// Pending events are flushed when the input closes. Returns when the input
/// closes or the output receiver is dropped.
pub async fn run_batcher(
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    output: mpsc::Sender<ChangeSet>,
    mut batcher: ChangeBatcher,
) {
    loop {
        let deadline = batcher.deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if batcher.record(event) {
                        debug!(pending = batcher.len(), "batcher saturated, emitting early");
                        if !emit(&mut batcher, &output).await {
                            return;
                        }
                    }
                }
                None => {
                    emit(&mut batcher, &output).await;
                    return;
                }
            },
            () = sleep_until(deadline) => {
                if !emit(&mut batcher, &output).await {
                    return;
                }
            }
        }
    }
}

/// Returns false once the output side is gone
async fn emit(batcher: &mut ChangeBatcher, output: &mpsc::Sender<ChangeSet>) -> bool {
    match batcher.take() {
        Some(changes) => {
            debug!(changes = changes.len(), "emitting batch");
            output.send(changes).await.is_ok()
        }
        None => !output.is_closed(),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclude::ExclusionRule;
    use pretty_assertions::assert_eq;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn file_event(path: &str, op: WatchOp, content: &[u8]) -> WatchEvent {
        WatchEvent::new(rel(path), op).with_meta(EntryMeta::for_content(content))
    }

    fn batcher() -> ChangeBatcher {
        ChangeBatcher::new(BatcherConfig::default(), ExclusionMatcher::empty())
    }

    fn paths(changes: &[Change]) -> Vec<&str> {
        changes.iter().map(|c| c.path.as_str()).collect()
    }

    #[test]
    fn test_repeated_modifications_collapse_to_final_state() {
        let mut b = batcher();
        b.record(file_event("a.txt", WatchOp::Modified, b"one"));
        b.record(file_event("a.txt", WatchOp::Modified, b"two"));
        b.record(file_event("a.txt", WatchOp::Modified, b"three"));

        let changes = b.take().unwrap();
        assert_eq!(paths(&changes.modified), vec!["a.txt"]);
        assert_eq!(changes.modified[0].meta, EntryMeta::for_content(b"three"));
        assert!(b.is_empty());
        assert_eq!(b.deadline(), None);
    }

    #[test]
    fn test_create_then_delete_is_a_no_op() {
        let mut b = batcher();
        b.record(file_event("tmp.swp", WatchOp::Created, b"x"));
        b.record(WatchEvent::new(rel("tmp.swp"), WatchOp::Removed));
        assert_eq!(b.take(), None);
    }

    #[test]
    fn test_delete_then_create() {
        let mut b = batcher();
        // Same kind: an editor's save-by-replace
        b.record(WatchEvent::new(rel("main.rs"), WatchOp::Removed));
        b.record(file_event("main.rs", WatchOp::Created, b"fn main() {}"));
        // Kind change: directory replaced by a file
        b.record(WatchEvent::new(rel("out"), WatchOp::Removed).with_meta(EntryMeta::dir()));
        b.record(file_event("out", WatchOp::Created, b"log"));

        let changes = b.take().unwrap();
        assert_eq!(paths(&changes.modified), vec!["main.rs"]);
        assert_eq!(paths(&changes.added), vec!["out"]);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_modify_then_delete_is_removed() {
        let mut b = batcher();
        b.record(file_event("a.txt", WatchOp::Modified, b"x"));
        b.record(WatchEvent::new(rel("a.txt"), WatchOp::Removed));
        b.record(WatchEvent::new(rel("d"), WatchOp::Removed));
        b.record(WatchEvent::new(rel("d"), WatchOp::Removed));

        let changes = b.take().unwrap();
        assert_eq!(paths(&changes.removed), vec!["d", "a.txt"]);
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_vanished_entries() {
        let mut b = batcher();
        b.record(WatchEvent::new(rel("flash"), WatchOp::Created));
        b.record(WatchEvent::new(rel("gone"), WatchOp::Modified));

        let changes = b.take().unwrap();
        assert!(changes.added.is_empty());
        assert_eq!(paths(&changes.removed), vec!["gone"]);
    }

    #[test]
    fn test_excluded_events_are_dropped() {
        let matcher = ExclusionMatcher::new([ExclusionRule::new("ignoredFolder")]).unwrap();
        let mut b = ChangeBatcher::new(BatcherConfig::default(), matcher);
        b.record(file_event("ignoredFolder/testFile1", WatchOp::Created, b"x"));
        b.record(file_event(".livesync/tmp/abc", WatchOp::Created, b"x"));
        assert!(b.is_empty());
        assert_eq!(b.deadline(), None);
    }

    #[test]
    fn test_saturation_is_reported() {
        let config = BatcherConfig {
            window: Duration::from_secs(1),
            capacity: 2,
        };
        let mut b = ChangeBatcher::new(config, ExclusionMatcher::empty());
        assert!(!b.record(file_event("a", WatchOp::Created, b"a")));
        assert!(!b.record(file_event("a", WatchOp::Modified, b"aa")));
        assert!(b.record(file_event("b", WatchOp::Created, b"b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batcher_emits_after_window() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_batcher(events_rx, out_tx, batcher()));

        let started = Instant::now();
        for content in [b"1", b"2", b"3"] {
            events_tx
                .send(file_event("a.txt", WatchOp::Modified, content))
                .unwrap();
        }
        events_tx
            .send(file_event("b.txt", WatchOp::Created, b"b"))
            .unwrap();

        let changes = out_rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(paths(&changes.added), vec!["b.txt"]);
        assert_eq!(paths(&changes.modified), vec!["a.txt"]);

        drop(events_tx);
        task.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batcher_emits_early_when_saturated() {
        let config = BatcherConfig {
            window: Duration::from_secs(60),
            capacity: 3,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(4);
        tokio::spawn(run_batcher(
            events_rx,
            out_tx,
            ChangeBatcher::new(config, ExclusionMatcher::empty()),
        ));

        let started = Instant::now();
        for name in ["a", "b", "c"] {
            events_tx
                .send(file_event(name, WatchOp::Created, b"x"))
                .unwrap();
        }

        let changes = out_rx.recv().await.unwrap();
        assert_eq!(changes.added.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batcher_flushes_on_close() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let config = BatcherConfig {
            window: Duration::from_secs(3600),
            capacity: 4096,
        };
        let task = tokio::spawn(run_batcher(
            events_rx,
            out_tx,
            ChangeBatcher::new(config, ExclusionMatcher::empty()),
        ));

        events_tx
            .send(file_event("late.txt", WatchOp::Created, b"x"))
            .unwrap();
        drop(events_tx);

        let changes = out_rx.recv().await.unwrap();
        assert_eq!(paths(&changes.added), vec!["late.txt"]);
        task.await.unwrap();
    }
}
