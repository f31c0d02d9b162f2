//! Slash-normalized paths relative to a sync root

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// A path relative to a sync root, always `/`-separated and normalized.
///
/// The empty path denotes the root itself. Ordering is byte-wise on the
/// normalized form, so a directory sorts before all of its descendants.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    /// The sync root
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse and normalize a relative path.
    ///
    /// `.` segments and repeated slashes are collapsed. Absolute paths and
    /// `..` segments are rejected.
    pub fn new(raw: &str) -> Result<Self> {
        if raw.starts_with('/') || has_drive_prefix(raw) {
            return Err(SyncError::InvalidPath {
                path: raw.to_string(),
                reason: "path is absolute",
            });
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(SyncError::InvalidPath {
                        path: raw.to_string(),
                        reason: "path escapes the sync root",
                    });
                }
                s => segments.push(s),
            }
        }

        Ok(Self(segments.join("/")))
    }

    /// Build a relative path from a native path below `root`
    pub fn from_native(root: &Path, path: &Path) -> Result<Self> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| SyncError::InvalidPath {
                path: path.display().to_string(),
                reason: "path is outside the sync root",
            })?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| SyncError::InvalidPath {
                        path: path.display().to_string(),
                        reason: "path is not valid UTF-8",
                    })?;
                    segments.push(name);
                }
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::InvalidPath {
                        path: path.display().to_string(),
                        reason: "path escapes the sync root",
                    });
                }
            }
        }

        Ok(Self(segments.join("/")))
    }

    /// Resolve against a native root directory
    #[must_use]
    pub fn to_native(&self, root: &Path) -> PathBuf {
        let mut native = root.to_path_buf();
        for segment in self.segments() {
            native.push(segment);
        }
        native
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the path's segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, or `""` for the root
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent directory; `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rsplit_once('/') {
            Some((parent, _)) => Self(parent.to_string()),
            None => Self::root(),
        })
    }

    /// Proper ancestors, nearest first, ending with the root
    pub fn ancestors(&self) -> impl Iterator<Item = Self> {
        std::iter::successors(self.parent(), Self::parent)
    }

    /// Append a single segment
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    /// True if `self` lies strictly below `dir` on a segment boundary
    #[must_use]
    pub fn is_descendant_of(&self, dir: &Self) -> bool {
        if dir.is_root() {
            return !self.is_root();
        }
        self.0.len() > dir.0.len()
            && self.0.starts_with(&dir.0)
            && self.0.as_bytes()[dir.0.len()] == b'/'
    }

    /// True if `self` equals `dir` or lies below it
    #[must_use]
    pub fn is_within(&self, dir: &Self) -> bool {
        self == dir || self.is_descendant_of(dir)
    }

    /// Lower bound of the key range holding this directory's descendants
    pub(crate) fn descendant_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            format!("{}/", self.0)
        }
    }
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl std::borrow::Borrow<str> for RelPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RelPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RelPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl TryFrom<&str> for RelPath {
    type Error = SyncError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RelPath> for String {
    fn from(path: RelPath) -> Self {
        path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(rel("a//b/./c/").as_str(), "a/b/c");
        assert_eq!(rel("./a").as_str(), "a");
        assert!(rel("").is_root());
        assert!(rel(".").is_root());
    }

    #[test]
    fn test_rejects_absolute_and_escaping() {
        assert!(RelPath::new("/etc/passwd").is_err());
        assert!(RelPath::new("C:/Windows").is_err());
        assert!(RelPath::new("a/../../b").is_err());
    }

    #[test]
    fn test_parent_and_ancestors() {
        let path = rel("a/b/c");
        assert_eq!(path.parent(), Some(rel("a/b")));
        assert_eq!(rel("a").parent(), Some(RelPath::root()));
        assert_eq!(RelPath::root().parent(), None);

        let ancestors: Vec<_> = path.ancestors().collect();
        assert_eq!(ancestors, vec![rel("a/b"), rel("a"), RelPath::root()]);
    }

    #[test]
    fn test_descendant_requires_segment_boundary() {
        let dir = rel("ignoredFolder");
        assert!(rel("ignoredFolder/testFile1").is_descendant_of(&dir));
        assert!(!rel("ignoredFolder2/testFile1").is_descendant_of(&dir));
        assert!(!dir.is_descendant_of(&dir));
        assert!(dir.is_within(&dir));
        assert!(dir.is_descendant_of(&RelPath::root()));
    }

    #[test]
    fn test_directory_sorts_before_descendants() {
        let mut paths = vec![rel("a/b"), rel("a-b"), rel("a"), rel("a/b/c")];
        paths.sort();
        let a = paths.iter().position(|p| p == &rel("a")).unwrap();
        let ab = paths.iter().position(|p| p == &rel("a/b")).unwrap();
        let abc = paths.iter().position(|p| p == &rel("a/b/c")).unwrap();
        assert!(a < ab && ab < abc);
    }

    #[test]
    fn test_native_round_trip() {
        let root = Path::new("/srv/app");
        let path = rel("src/main.rs");
        let native = path.to_native(root);
        assert_eq!(native, Path::new("/srv/app/src/main.rs"));
        assert_eq!(RelPath::from_native(root, &native).unwrap(), path);
        assert!(RelPath::from_native(root, Path::new("/elsewhere/x")).is_err());
    }
}
