//! Snapshot diffing into directional change sets

use std::fmt;

use crate::path::RelPath;
use crate::snapshot::{EntryMeta, Side, Snapshot};

/// Which way a change set flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    /// Direction for changes observed on `side`
    #[must_use]
    pub fn from_side(side: Side) -> Self {
        match side {
            Side::Local => Self::LocalToRemote,
            Side::Remote => Self::RemoteToLocal,
        }
    }

    #[must_use]
    pub fn source(self) -> Side {
        match self {
            Self::LocalToRemote => Side::Local,
            Self::RemoteToLocal => Side::Remote,
        }
    }

    #[must_use]
    pub fn target(self) -> Side {
        self.source().opposite()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalToRemote => "local -> remote",
            Self::RemoteToLocal => "remote -> local",
        })
    }
}

/// One changed path. For removals `meta` is the last known state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: RelPath,
    pub meta: EntryMeta,
}

impl Change {
    #[must_use]
    pub fn new(path: RelPath, meta: EntryMeta) -> Self {
        Self { path, meta }
    }
}

/// Added, modified and removed entries flowing in one direction.
///
/// A path appears in at most one list. `added` and `modified` are ordered
/// parents first, `removed` children first, so each list can be applied in
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub direction: Direction,
    pub added: Vec<Change>,
    pub modified: Vec<Change>,
    pub removed: Vec<Change>,
}

impl ChangeSet {
    #[must_use]
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            added: Vec::new(),
            modified: Vec::new(),
            removed: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    #[must_use]
    pub fn contains(&self, path: &RelPath) -> bool {
        self.changes().any(|change| &change.path == path)
    }

    /// Removals first, then additions and modifications in path order
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.removed.iter().chain(self.upserts())
    }

    /// Additions and modifications merged in path order
    pub fn upserts(&self) -> impl Iterator<Item = &Change> {
        let mut merged: Vec<&Change> = self.added.iter().chain(&self.modified).collect();
        merged.sort_by(|a, b| a.path.cmp(&b.path));
        merged.into_iter()
    }

    /// Restore the documented ordering after out-of-order construction
    pub(crate) fn normalize(&mut self) {
        self.added.sort_by(|a, b| a.path.cmp(&b.path));
        self.modified.sort_by(|a, b| a.path.cmp(&b.path));
        self.removed.sort_by(|a, b| b.path.cmp(&a.path));
    }
}

/// Compare two snapshots of the same side.
///
/// Files differ when size, mtime or (if both known) content hash differ.
/// Directories are compared structurally only. A kind change is reported as
/// `modified` with the new kind. Removing a directory removes every
/// previously known descendant. Paths whose current state is uncertain
/// because of a scan error are never reported as removed.
#[must_use]
pub fn diff(previous: &Snapshot, current: &Snapshot, direction: Direction) -> ChangeSet {
    let mut changes = ChangeSet::new(direction);

    for (path, meta) in current.iter() {
        match previous.get(path) {
            None => changes.added.push(Change::new(path.clone(), meta.clone())),
            Some(old) if !old.same_state(meta) => {
                changes.modified.push(Change::new(path.clone(), meta.clone()));
            }
            Some(_) => {}
        }
    }

    for (path, old) in previous.iter().rev() {
        if current.contains(path) || current.is_uncertain(path) {
            continue;
        }
        changes.removed.push(Change::new(path.clone(), old.clone()));
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ScanError, ScanErrorKind};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, UNIX_EPOCH};

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn file(content: &[u8], mtime_secs: u64) -> EntryMeta {
        let mut meta = EntryMeta::for_content(content);
        meta.modified = Some(UNIX_EPOCH + Duration::from_secs(mtime_secs));
        meta
    }

    fn snapshot(entries: Vec<(&str, EntryMeta)>) -> Snapshot {
        Snapshot::from_entries(
            Side::Local,
            entries.into_iter().map(|(p, m)| (rel(p), m)),
        )
    }

    fn change_paths(changes: &[Change]) -> Vec<&str> {
        changes.iter().map(|c| c.path.as_str()).collect()
    }

    #[test]
    fn test_added_modified_removed() {
        let previous = snapshot(vec![
            ("keep.txt", file(b"same", 100)),
            ("edit.txt", file(b"old", 100)),
            ("gone.txt", file(b"bye", 100)),
        ]);
        let current = snapshot(vec![
            ("keep.txt", file(b"same", 100)),
            ("edit.txt", file(b"new content", 200)),
            ("new.txt", file(b"hi", 300)),
        ]);

        let changes = diff(&previous, &current, Direction::LocalToRemote);
        assert_eq!(change_paths(&changes.added), vec!["new.txt"]);
        assert_eq!(change_paths(&changes.modified), vec!["edit.txt"]);
        assert_eq!(change_paths(&changes.removed), vec!["gone.txt"]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_size_beats_equal_mtime() {
        let previous = snapshot(vec![("a.txt", file(b"1234", 100))]);
        let current = snapshot(vec![("a.txt", file(b"12345", 100))]);

        let changes = diff(&previous, &current, Direction::LocalToRemote);
        assert_eq!(change_paths(&changes.modified), vec!["a.txt"]);
    }

    #[test]
    fn test_directory_removal_removes_descendants_children_first() {
        let previous = snapshot(vec![
            ("d", EntryMeta::dir()),
            ("d/a.txt", file(b"a", 1)),
            ("d/sub", EntryMeta::dir()),
            ("d/sub/b.txt", file(b"b", 1)),
            ("other.txt", file(b"o", 1)),
        ]);
        let current = snapshot(vec![("other.txt", file(b"o", 1))]);

        let changes = diff(&previous, &current, Direction::LocalToRemote);
        assert_eq!(
            change_paths(&changes.removed),
            vec!["d/sub/b.txt", "d/sub", "d/a.txt", "d"]
        );
        assert!(changes.added.is_empty() && changes.modified.is_empty());
    }

    #[test]
    fn test_kind_change_is_modified() {
        let previous = snapshot(vec![("x", EntryMeta::dir()), ("x/inner", file(b"i", 1))]);
        let current = snapshot(vec![("x", file(b"now a file", 2))]);

        let changes = diff(&previous, &current, Direction::LocalToRemote);
        assert_eq!(change_paths(&changes.modified), vec!["x"]);
        assert!(changes.modified[0].meta.is_file());
        assert_eq!(change_paths(&changes.removed), vec!["x/inner"]);
    }

    #[test]
    fn test_uncertain_paths_are_not_removed() {
        let previous = snapshot(vec![
            ("locked", EntryMeta::dir()),
            ("locked/secret.txt", file(b"s", 1)),
        ]);
        let current = Snapshot::from_parts(
            Side::Local,
            [(rel("locked"), EntryMeta::dir())].into_iter().collect(),
            vec![ScanError {
                path: rel("locked"),
                kind: ScanErrorKind::PermissionDenied,
                message: "permission denied".into(),
            }],
        );

        let changes = diff(&previous, &current, Direction::LocalToRemote);
        assert!(changes.is_empty(), "{changes:?}");
    }

    #[test]
    fn test_identical_snapshots_produce_empty_changes() {
        let tree = snapshot(vec![
            ("d", EntryMeta::dir()),
            ("d/a.txt", file(b"a", 1)),
        ]);
        assert!(diff(&tree, &tree, Direction::RemoteToLocal).is_empty());
    }

    #[test]
    fn test_changes_order() {
        let mut changes = ChangeSet::new(Direction::LocalToRemote);
        changes.added.push(Change::new(rel("b/c"), EntryMeta::dir()));
        changes.modified.push(Change::new(rel("a"), file(b"a", 1)));
        changes.added.push(Change::new(rel("b"), EntryMeta::dir()));
        changes.removed.push(Change::new(rel("z"), EntryMeta::dir()));
        changes.removed.push(Change::new(rel("z/y"), file(b"y", 1)));
        changes.normalize();

        let order: Vec<_> = changes.changes().map(|c| c.path.as_str()).collect();
        assert_eq!(order, vec!["z/y", "z", "a", "b", "b/c"]);
        assert!(changes.contains(&rel("b/c")));
        assert_eq!(Direction::LocalToRemote.target(), Side::Remote);
    }
}
