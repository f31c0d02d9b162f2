//! Sync planning and conflict resolution
//!
//! Two planners share one output type: [`compare_sides`] for an initial sync
//! with no history, and [`plan_reconcile`] for a three-way comparison against
//! the last state both sides agreed on. Conflicts are always resolved in
//! favour of the local side.

use std::collections::BTreeSet;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::diff::{Change, ChangeSet, Direction, diff};
use crate::path::RelPath;
use crate::snapshot::{EntryMeta, Snapshot};

/// How entries that exist only on the remote are treated by an initial sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPolicy {
    /// The local tree is authoritative: remote-only entries are removed
    #[default]
    LocalAuthoritative,
    /// Remote-only entries are pulled; differing entries still follow local
    Merge,
}

/// Resolution for a path changed on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Both sides ended in the same state, nothing to do
    Identical,
    /// Both sides deleted the entry
    BothDeleted,
    /// The local state overwrites the remote one
    UseLocal,
}

/// A path whose current state differs between the sides after both changed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: RelPath,
    /// Current local state; `None` if deleted
    pub local: Option<EntryMeta>,
    /// Current remote state; `None` if deleted
    pub remote: Option<EntryMeta>,
}

impl Conflict {
    #[must_use]
    pub fn new(path: RelPath, local: Option<EntryMeta>, remote: Option<EntryMeta>) -> Self {
        Self {
            path,
            local,
            remote,
        }
    }

    /// Local wins unless the two sides already agree
    #[must_use]
    pub fn resolve(&self) -> Resolution {
        match (&self.local, &self.remote) {
            (None, None) => Resolution::BothDeleted,
            (Some(local), Some(remote)) if local.same_content(remote) => Resolution::Identical,
            _ => Resolution::UseLocal,
        }
    }
}

/// Work needed to bring both sides into agreement
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub to_remote: ChangeSet,
    pub to_local: ChangeSet,
    /// Conflicts found and how they were resolved
    pub conflicts: Vec<(Conflict, Resolution)>,
}

impl SyncPlan {
    #[must_use]
    pub fn new() -> Self {
        Self {
            to_remote: ChangeSet::new(Direction::LocalToRemote),
            to_local: ChangeSet::new(Direction::RemoteToLocal),
            conflicts: Vec::new(),
        }
    }

    /// Whether applying the plan would change anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_remote.is_empty() && self.to_local.is_empty()
    }

    #[must_use]
    pub fn total_operations(&self) -> usize {
        self.to_remote.len() + self.to_local.len()
    }

    fn adopt_local(
        &mut self,
        path: &RelPath,
        local: Option<&EntryMeta>,
        remote: Option<&EntryMeta>,
    ) {
        push_state(&mut self.to_remote, path, local, remote);
    }

    fn adopt_remote(
        &mut self,
        path: &RelPath,
        local: Option<&EntryMeta>,
        remote: Option<&EntryMeta>,
    ) {
        push_state(&mut self.to_local, path, remote, local);
    }

    fn finish(mut self) -> Self {
        self.to_remote.normalize();
        self.to_local.normalize();
        self
    }
}

impl Default for SyncPlan {
    fn default() -> Self {
        Self::new()
    }
}

/// Record in `changes` that the target must take on `source`'s state
fn push_state(
    changes: &mut ChangeSet,
    path: &RelPath,
    source: Option<&EntryMeta>,
    target: Option<&EntryMeta>,
) {
    match (source, target) {
        (Some(meta), None) => changes.added.push(Change::new(path.clone(), meta.clone())),
        (Some(meta), Some(_)) => changes.modified.push(Change::new(path.clone(), meta.clone())),
        (None, Some(old)) => changes.removed.push(Change::new(path.clone(), old.clone())),
        (None, None) => {}
    }
}

fn agree(local: Option<&EntryMeta>, remote: Option<&EntryMeta>) -> bool {
    match (local, remote) {
        (None, None) => true,
        (Some(local), Some(remote)) => local.same_content(remote),
        _ => false,
    }
}

/// Plan an initial sync with no shared history.
///
/// Local-only entries are pushed and differing entries take the local
/// version. Remote-only entries are removed, or pulled under
/// [`InitialPolicy::Merge`] unless a local file occupies one of their
/// ancestors. Entries whose state is uncertain on the side that would be
/// overwritten are left alone.
#[must_use]
pub fn compare_sides(local: &Snapshot, remote: &Snapshot, policy: InitialPolicy) -> SyncPlan {
    let mut plan = SyncPlan::new();

    for (path, meta) in local.iter() {
        let theirs = remote.get(path);
        if theirs.is_none() && remote.is_uncertain(path) {
            continue;
        }
        if !agree(Some(meta), theirs) {
            plan.adopt_local(path, Some(meta), theirs);
        }
    }

    for (path, meta) in remote.iter() {
        if local.contains(path) || local.is_uncertain(path) {
            continue;
        }
        let shadowed = path
            .ancestors()
            .any(|ancestor| local.get(&ancestor).is_some_and(EntryMeta::is_file));
        if policy == InitialPolicy::Merge && !shadowed {
            plan.adopt_remote(path, None, Some(meta));
        } else {
            plan.adopt_local(path, None, Some(meta));
        }
    }

    plan.finish()
}

/// Plan a reconciliation from the last agreed baselines.
///
/// A side "claims" a path when it changed that path since its baseline. The
/// local side also claims everything below a directory it replaced or
/// deleted, and a directory the remote deleted if local changed anything
/// inside it. A path claimed only by the remote takes the remote state;
/// everything else that disagrees takes the local state, and paths claimed
/// by both are reported as conflicts.
#[must_use]
pub fn plan_reconcile(
    base_local: &Snapshot,
    local: &Snapshot,
    base_remote: &Snapshot,
    remote: &Snapshot,
) -> SyncPlan {
    let local_changed = changed_paths(&diff(base_local, local, Direction::LocalToRemote));
    let remote_changed = changed_paths(&diff(base_remote, remote, Direction::RemoteToLocal));

    let mut plan = SyncPlan::new();
    let all_paths: BTreeSet<&RelPath> = local.paths().chain(remote.paths()).collect();

    for path in all_paths {
        if local.is_uncertain(path) || remote.is_uncertain(path) {
            continue;
        }
        let ours = local.get(path);
        let theirs = remote.get(path);
        if agree(ours, theirs) {
            continue;
        }

        let remote_claim = remote_changed.contains(path);
        let local_claim = local_changed.contains(path)
            || path.ancestors().any(|a| {
                local_changed.contains(&a) && !local.get(&a).is_some_and(EntryMeta::is_dir)
            })
            || (theirs.is_none() && any_within(&local_changed, path));

        if remote_claim && !local_claim {
            plan.adopt_remote(path, ours, theirs);
            continue;
        }
        if remote_claim {
            let conflict = Conflict::new(path.clone(), ours.cloned(), theirs.cloned());
            let resolution = conflict.resolve();
            plan.conflicts.push((conflict, resolution));
        }
        plan.adopt_local(path, ours, theirs);
    }

    plan.finish()
}

fn changed_paths(changes: &ChangeSet) -> BTreeSet<RelPath> {
    changes.changes().map(|c| c.path.clone()).collect()
}

/// Whether `set` holds any path strictly below `dir`
fn any_within(set: &BTreeSet<RelPath>, dir: &RelPath) -> bool {
    let prefix = dir.descendant_prefix();
    set.range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
        .next()
        .is_some_and(|first| first.as_str().starts_with(&prefix))
}
