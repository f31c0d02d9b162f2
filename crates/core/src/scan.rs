//! Tree scanning: walk a root into a [`Snapshot`]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::{Result, SyncError};
use crate::exclude::ExclusionMatcher;
use crate::hash::ContentHash;
use crate::path::RelPath;
use crate::snapshot::{EntryKind, EntryMeta, ScanError, ScanErrorKind, Side, Snapshot};

#[cfg(unix)]
type DirKey = (u64, u64);

#[cfg(not(unix))]
type DirKey = PathBuf;

#[cfg(unix)]
fn dir_key(_native: &Path, metadata: &fs::Metadata) -> DirKey {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn dir_key(native: &Path, _metadata: &fs::Metadata) -> DirKey {
    fs::canonicalize(native).unwrap_or_else(|_| native.to_path_buf())
}

/// True when `path` is excluded whether it turns out to be a file or a
/// directory
fn excluded_as_any_kind(matcher: &ExclusionMatcher, path: &RelPath) -> bool {
    matcher.is_excluded(path, EntryKind::File) && matcher.is_excluded(path, EntryKind::Dir)
}

/// A directory waiting to be read, with the identities of the directories
/// on the way down to it
struct PendingDir {
    path: RelPath,
    ancestors: Vec<DirKey>,
}

/// Scanner for one directory tree
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    side: Side,
    hash_contents: bool,
    follow_symlinks: bool,
}

impl Scanner {
    /// Create a scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            side: Side::Local,
            hash_contents: true,
            follow_symlinks: true,
        }
    }

    /// Side recorded on produced snapshots
    #[must_use]
    pub fn side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    /// Compute BLAKE3 hashes for files (on by default)
    #[must_use]
    pub fn hash_contents(mut self, enabled: bool) -> Self {
        self.hash_contents = enabled;
        self
    }

    /// Record symlinks as their target's kind (on by default). When off,
    /// symlinks are skipped.
    #[must_use]
    pub fn follow_symlinks(mut self, enabled: bool) -> Self {
        self.follow_symlinks = enabled;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the whole tree
    ///
    /// # Errors
    /// Returns `InvalidRoot` if the root is missing or not a directory.
    /// Per-entry failures are collected on the snapshot instead.
    pub fn scan(&self, matcher: &ExclusionMatcher) -> Result<Snapshot> {
        self.walk(&RelPath::root(), matcher, None)
    }

    /// Scan the whole tree, checking `cancel` between directories
    ///
    /// # Errors
    /// As [`Scanner::scan`], plus `Cancelled` once the flag is set.
    pub fn scan_with_cancel(
        &self,
        matcher: &ExclusionMatcher,
        cancel: &AtomicBool,
    ) -> Result<Snapshot> {
        self.walk(&RelPath::root(), matcher, Some(cancel))
    }

    /// Scan only the entries strictly below `start`. A missing or
    /// non-directory `start` yields an empty snapshot.
    ///
    /// # Errors
    /// As [`Scanner::scan`].
    pub fn scan_subtree(&self, start: &RelPath, matcher: &ExclusionMatcher) -> Result<Snapshot> {
        self.walk(start, matcher, None)
    }

    /// Stat and hash a single entry. Absent entries (and skipped symlinks
    /// or special files) are `None`.
    ///
    /// # Errors
    /// Returns the underlying I/O error for anything other than not-found.
    pub fn entry(&self, path: &RelPath) -> io::Result<Option<EntryMeta>> {
        let native = path.to_native(&self.root);
        let resolved = match self.stat(&native) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let (metadata, link_target) = resolved;
        let meta = if metadata.is_dir() {
            EntryMeta::dir()
        } else if metadata.is_file() {
            match self.file_meta(&native, &metadata) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            }
        } else {
            return Ok(None);
        };

        Ok(Some(match link_target {
            Some(target) => meta.with_link_target(target),
            None => meta,
        }))
    }

    fn walk(
        &self,
        start: &RelPath,
        matcher: &ExclusionMatcher,
        cancel: Option<&AtomicBool>,
    ) -> Result<Snapshot> {
        let root_metadata = fs::metadata(&self.root).map_err(|e| SyncError::InvalidRoot {
            path: self.root.clone(),
            reason: e.to_string(),
        })?;
        if !root_metadata.is_dir() {
            return Err(SyncError::InvalidRoot {
                path: self.root.clone(),
                reason: "not a directory".to_string(),
            });
        }

        let mut entries = BTreeMap::new();
        let mut errors = Vec::new();

        let start_native = start.to_native(&self.root);
        let start_key = match fs::metadata(&start_native) {
            Ok(metadata) if metadata.is_dir() => dir_key(&start_native, &metadata),
            Ok(_) => return Ok(Snapshot::empty(self.side)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Snapshot::empty(self.side));
            }
            Err(e) => {
                errors.push(ScanError::from_io(start.clone(), &e));
                return Ok(Snapshot::from_parts(self.side, entries, errors));
            }
        };

        let mut stack = vec![PendingDir {
            path: start.clone(),
            ancestors: vec![start_key],
        }];

        while let Some(dir) = stack.pop() {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(SyncError::Cancelled);
            }

            let read_dir = match fs::read_dir(dir.path.to_native(&self.root)) {
                Ok(read_dir) => read_dir,
                Err(e) => {
                    errors.push(ScanError::from_io(dir.path.clone(), &e));
                    continue;
                }
            };

            for dir_entry in read_dir {
                let dir_entry = match dir_entry {
                    Ok(dir_entry) => dir_entry,
                    Err(e) => {
                        errors.push(ScanError::from_io(dir.path.clone(), &e));
                        continue;
                    }
                };

                let name = match dir_entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(raw) => {
                        // The entry cannot be addressed, so the directory's
                        // contents are only partially known.
                        errors.push(ScanError {
                            path: dir.path.clone(),
                            kind: ScanErrorKind::Other,
                            message: format!("file name is not valid UTF-8: {raw:?}"),
                        });
                        continue;
                    }
                };

                let path = dir.path.join(&name);
                let native = dir_entry.path();

                // Decide exclusion from the unresolved entry so excluded
                // paths are never stat'ed or followed.
                let file_type = match dir_entry.file_type() {
                    Ok(file_type) => file_type,
                    Err(e) => {
                        if !excluded_as_any_kind(matcher, &path) {
                            errors.push(ScanError::from_io(path, &e));
                        }
                        continue;
                    }
                };
                if file_type.is_symlink() {
                    if excluded_as_any_kind(matcher, &path) {
                        continue;
                    }
                } else if file_type.is_dir() || file_type.is_file() {
                    let kind = if file_type.is_dir() {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    };
                    if matcher.is_excluded(&path, kind) {
                        continue;
                    }
                } else {
                    debug!(path = %path, "skipping special file");
                    continue;
                }

                let (metadata, link_target) = match self.stat(&native) {
                    Ok(Some(resolved)) => resolved,
                    Ok(None) => continue,
                    Err(e) => {
                        errors.push(ScanError::from_io(path, &e));
                        continue;
                    }
                };

                let kind = if metadata.is_dir() {
                    EntryKind::Dir
                } else if metadata.is_file() {
                    EntryKind::File
                } else {
                    debug!(path = %path, "skipping special file");
                    continue;
                };

                // A symlink's kind is only known once resolved
                if link_target.is_some() && matcher.is_excluded(&path, kind) {
                    continue;
                }

                let meta = match kind {
                    EntryKind::Dir => {
                        let key = dir_key(&native, &metadata);
                        if dir.ancestors.contains(&key) {
                            debug!(path = %path, "directory cycle, skipping");
                            continue;
                        }
                        let mut ancestors = dir.ancestors.clone();
                        ancestors.push(key);
                        stack.push(PendingDir {
                            path: path.clone(),
                            ancestors,
                        });
                        EntryMeta::dir()
                    }
                    EntryKind::File => match self.file_meta(&native, &metadata) {
                        Ok(meta) => meta,
                        Err(e) => {
                            errors.push(ScanError::from_io(path, &e));
                            continue;
                        }
                    },
                };

                let meta = match link_target {
                    Some(target) => meta.with_link_target(target),
                    None => meta,
                };
                entries.insert(path, meta);
            }
        }

        debug!(
            root = %self.root.display(),
            start = %start,
            entries = entries.len(),
            errors = errors.len(),
            "scan complete"
        );

        Ok(Snapshot::from_parts(self.side, entries, errors))
    }

    /// Metadata for `native` with one level of symlink resolution.
    /// `None` means a symlink that is not followed.
    fn stat(&self, native: &Path) -> io::Result<Option<(fs::Metadata, Option<PathBuf>)>> {
        let metadata = fs::symlink_metadata(native)?;
        if !metadata.file_type().is_symlink() {
            return Ok(Some((metadata, None)));
        }
        if !self.follow_symlinks {
            return Ok(None);
        }
        let target = fs::read_link(native)?;
        let resolved = fs::metadata(native)?;
        Ok(Some((resolved, Some(target))))
    }

    fn file_meta(&self, native: &Path, metadata: &fs::Metadata) -> io::Result<EntryMeta> {
        let hash = if self.hash_contents {
            Some(ContentHash::from_file(native)?)
        } else {
            None
        };
        Ok(EntryMeta::file(metadata.len(), metadata.modified().ok(), hash))
    }
}
