//! Echo suppression
//!
//! Before the engine writes to one side it records what that side will look
//! like afterwards. When the side's own change detection later reports
//! exactly that state, the observation is consumed as self-caused instead of
//! being propagated back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::ContentHash;
use crate::path::RelPath;
use crate::snapshot::{EntryKind, EntryMeta, Side};

/// The part of an entry's state that identifies a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    Absent,
    Dir,
    File {
        size: u64,
        hash: Option<ContentHash>,
    },
}

impl Fingerprint {
    #[must_use]
    pub fn of(meta: Option<&EntryMeta>) -> Self {
        match meta {
            None => Self::Absent,
            Some(meta) => match meta.kind {
                EntryKind::Dir => Self::Dir,
                EntryKind::File => Self::File {
                    size: meta.size,
                    hash: meta.hash,
                },
            },
        }
    }

    /// Equal kind and size, and equal hashes when both sides have one
    #[must_use]
    pub fn matches(&self, observed: &Self) -> bool {
        match (self, observed) {
            (Self::Absent, Self::Absent) | (Self::Dir, Self::Dir) => true,
            (
                Self::File { size: a, hash: ha },
                Self::File { size: b, hash: hb },
            ) => a == b && (*ha).zip(*hb).is_none_or(|(x, y)| x == y),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct EchoEntry {
    fingerprint: Fingerprint,
    expires_at: Instant,
}

/// Pending self-caused states keyed by (side written, path)
#[derive(Debug, Clone)]
pub struct EchoSet {
    expiry: Duration,
    entries: HashMap<(Side, RelPath), Vec<EchoEntry>>,
}

impl EchoSet {
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: HashMap::new(),
        }
    }

    /// Record that `side` is about to take on `fingerprint` at `path`
    pub fn record(&mut self, side: Side, path: &RelPath, fingerprint: Fingerprint) {
        self.record_at(side, path, fingerprint, Instant::now());
    }

    pub fn record_at(
        &mut self,
        side: Side,
        path: &RelPath,
        fingerprint: Fingerprint,
        now: Instant,
    ) {
        self.entries
            .entry((side, path.clone()))
            .or_default()
            .push(EchoEntry {
                fingerprint,
                expires_at: now + self.expiry,
            });
    }

    /// Whether an observation on `side` is the echo of a recorded write.
    /// A matching entry is consumed.
    pub fn take_match(&mut self, side: Side, path: &RelPath, observed: &Fingerprint) -> bool {
        self.take_match_at(side, path, observed, Instant::now())
    }

    pub fn take_match_at(
        &mut self,
        side: Side,
        path: &RelPath,
        observed: &Fingerprint,
        now: Instant,
    ) -> bool {
        self.prune(now);
        let key = (side, path.clone());
        let Some(pending) = self.entries.get_mut(&key) else {
            return false;
        };

        let Some(index) = pending
            .iter()
            .position(|entry| entry.fingerprint.matches(observed))
        else {
            return false;
        };

        pending.remove(index);
        if pending.is_empty() {
            self.entries.remove(&key);
        }
        true
    }

    /// Whether an observation on `side` matches a recorded write, without
    /// consuming it
    pub fn has_pending(&mut self, side: Side, path: &RelPath, observed: &Fingerprint) -> bool {
        self.prune(Instant::now());
        self.entries
            .get(&(side, path.clone()))
            .is_some_and(|pending| pending.iter().any(|e| e.fingerprint.matches(observed)))
    }

    /// Drop a recorded write that did not happen
    pub fn forget(&mut self, side: Side, path: &RelPath, fingerprint: &Fingerprint) {
        let key = (side, path.clone());
        if let Some(pending) = self.entries.get_mut(&key) {
            if let Some(index) = pending.iter().position(|e| &e.fingerprint == fingerprint) {
                pending.remove(index);
            }
            if pending.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of unexpired recorded writes
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        self.entries.retain(|_, pending| {
            pending.retain(|entry| entry.expires_at > now);
            !pending.is_empty()
        });
    }
}
