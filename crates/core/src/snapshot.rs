//! Snapshot: A point-in-time view of one sync root

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::exclude::ExclusionMatcher;
use crate::hash::ContentHash;
use crate::path::RelPath;

/// Which side of a sync pair a snapshot or change belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
}

/// Observable state of one file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub kind: EntryKind,
    /// Size in bytes; zero for directories
    pub size: u64,
    /// Modification time, when the side reports one
    pub modified: Option<SystemTime>,
    /// Content hash, when computed
    pub hash: Option<ContentHash>,
    /// Target of the symlink this entry was resolved through
    pub link_target: Option<PathBuf>,
}

impl EntryMeta {
    #[must_use]
    pub fn dir() -> Self {
        Self {
            kind: EntryKind::Dir,
            size: 0,
            modified: None,
            hash: None,
            link_target: None,
        }
    }

    #[must_use]
    pub fn file(size: u64, modified: Option<SystemTime>, hash: Option<ContentHash>) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            modified,
            hash,
            link_target: None,
        }
    }

    /// Metadata for in-memory content about to be written
    #[must_use]
    pub fn for_content(content: &[u8]) -> Self {
        Self::file(
            content.len() as u64,
            None,
            Some(ContentHash::from_bytes(content)),
        )
    }

    #[must_use]
    pub fn with_link_target(mut self, target: PathBuf) -> Self {
        self.link_target = Some(target);
        self
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Same-side comparison used by the diff engine.
    ///
    /// Directories compare structurally. Files differ when size, mtime or
    /// (if both are known) the content hash differ; size wins over equal
    /// mtimes.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.is_dir() {
            return true;
        }
        if self.size != other.size || self.modified != other.modified {
            return false;
        }
        match (self.hash, other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Cross-side comparison: mtimes from two machines are not comparable,
    /// so content is judged by hash when both sides have one, else by size.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.is_dir() {
            return true;
        }
        match (self.hash, other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.size == other.size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorKind {
    NotFound,
    PermissionDenied,
    Other,
}

impl From<std::io::ErrorKind> for ScanErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Other,
        }
    }
}

/// A per-entry failure collected while producing a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    pub path: RelPath,
    pub kind: ScanErrorKind,
    pub message: String,
}

impl ScanError {
    #[must_use]
    pub fn from_io(path: RelPath, err: &std::io::Error) -> Self {
        Self {
            path,
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Immutable view of one root: relative path -> entry metadata, plus the
/// per-entry errors hit while building it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    side: Side,
    entries: BTreeMap<RelPath, EntryMeta>,
    errors: Vec<ScanError>,
}

impl Snapshot {
    #[must_use]
    pub fn empty(side: Side) -> Self {
        Self::from_parts(side, BTreeMap::new(), Vec::new())
    }

    #[must_use]
    pub fn from_entries(side: Side, entries: impl IntoIterator<Item = (RelPath, EntryMeta)>) -> Self {
        Self::from_parts(side, entries.into_iter().collect(), Vec::new())
    }

    #[must_use]
    pub fn from_parts(
        side: Side,
        entries: BTreeMap<RelPath, EntryMeta>,
        errors: Vec<ScanError>,
    ) -> Self {
        Self {
            side,
            entries,
            errors,
        }
    }

    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &RelPath) -> Option<&EntryMeta> {
        self.entries.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &RelPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries in path order (parents before children)
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&RelPath, &EntryMeta)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &RelPath> {
        self.entries.keys()
    }

    #[must_use]
    pub fn errors(&self) -> &[ScanError] {
        &self.errors
    }

    /// Entries strictly below `dir`, in path order
    pub fn descendants<'a>(
        &'a self,
        dir: &RelPath,
    ) -> impl Iterator<Item = (&'a RelPath, &'a EntryMeta)> + 'a {
        let prefix = dir.descendant_prefix();
        self.entries
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(move |(path, _)| path.as_str().starts_with(&prefix))
    }

    /// Whether the state of `path` is unknown because reading it, or one of
    /// its ancestors, failed. Such paths are never treated as absent.
    #[must_use]
    pub fn is_uncertain(&self, path: &RelPath) -> bool {
        self.errors.iter().any(|e| path.is_within(&e.path))
    }

    /// A copy without entries the matcher excludes (e.g. a remote listing)
    #[must_use]
    pub fn filtered(&self, matcher: &ExclusionMatcher) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(path, meta)| !matcher.is_excluded(path, meta.kind))
            .map(|(path, meta)| (path.clone(), meta.clone()))
            .collect();
        Self::from_parts(self.side, entries, self.errors.clone())
    }

    /// Total bytes across file entries
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.values().filter(|m| m.is_file()).map(|m| m.size).sum()
    }

    /// Copy-on-write update used for the orchestrator's baselines
    pub(crate) fn upsert(&mut self, path: RelPath, meta: EntryMeta) {
        if !meta.is_dir() {
            self.remove_descendants(&path);
        }
        self.entries.insert(path, meta);
    }

    /// Remove `path` and everything below it
    pub(crate) fn remove_subtree(&mut self, path: &RelPath) {
        if path.is_root() {
            self.entries.clear();
            return;
        }
        self.entries.remove(path);
        self.remove_descendants(path);
    }

    fn remove_descendants(&mut self, path: &RelPath) {
        let doomed: Vec<RelPath> = self.descendants(path).map(|(p, _)| p.clone()).collect();
        for p in doomed {
            self.entries.remove(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn file(content: &[u8]) -> EntryMeta {
        EntryMeta::for_content(content)
    }

    fn sample() -> Snapshot {
        Snapshot::from_entries(
            Side::Local,
            vec![
                (rel("a"), EntryMeta::dir()),
                (rel("a/x.txt"), file(b"x")),
                (rel("a/sub"), EntryMeta::dir()),
                (rel("a/sub/y.txt"), file(b"y")),
                (rel("a-b.txt"), file(b"ab")),
                (rel("b.txt"), file(b"b")),
            ],
        )
    }

    #[test]
    fn test_descendants_respect_segment_boundary() {
        let snapshot = sample();
        let found: Vec<_> = snapshot
            .descendants(&rel("a"))
            .map(|(p, _)| p.as_str().to_string())
            .collect();
        assert_eq!(found, vec!["a/sub", "a/sub/y.txt", "a/x.txt"]);
        assert_eq!(snapshot.descendants(&RelPath::root()).count(), 6);
    }

    #[test]
    fn test_remove_subtree() {
        let mut snapshot = sample();
        snapshot.remove_subtree(&rel("a"));
        let left: Vec<_> = snapshot.paths().map(RelPath::as_str).collect();
        assert_eq!(left, vec!["a-b.txt", "b.txt"]);
    }

    #[test]
    fn test_uncertain_covers_descendants() {
        let snapshot = Snapshot::from_parts(
            Side::Local,
            BTreeMap::new(),
            vec![ScanError {
                path: rel("locked"),
                kind: ScanErrorKind::PermissionDenied,
                message: "permission denied".into(),
            }],
        );
        assert!(snapshot.is_uncertain(&rel("locked")));
        assert!(snapshot.is_uncertain(&rel("locked/inner.txt")));
        assert!(!snapshot.is_uncertain(&rel("lockedness.txt")));
    }

    #[test]
    fn test_same_state_size_beats_equal_mtime() {
        let when = Some(SystemTime::UNIX_EPOCH);
        let a = EntryMeta::file(3, when, None);
        let b = EntryMeta::file(4, when, None);
        assert!(!a.same_state(&b));
        assert!(a.same_state(&a.clone()));
    }

    #[test]
    fn test_same_content_ignores_mtime() {
        let mut local = file(b"same");
        local.modified = Some(SystemTime::UNIX_EPOCH);
        let remote = file(b"same");
        assert!(local.same_content(&remote));
        assert!(!local.same_state(&remote));

        let unhashed = EntryMeta::file(4, None, None);
        assert!(local.same_content(&unhashed));
        assert!(!EntryMeta::dir().same_content(&local));
    }

    #[test]
    fn test_snapshot_json_round_trip_keeps_errors() {
        let snapshot = Snapshot::from_parts(
            Side::Remote,
            [(rel("f"), file(b"f"))].into_iter().collect(),
            vec![ScanError {
                path: rel("gone"),
                kind: ScanErrorKind::NotFound,
                message: "vanished".into(),
            }],
        );
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.errors().len(), 1);
        assert_eq!(back.side(), Side::Remote);
    }
}
