//! Filesystem mutations below a sync root
//!
//! Used by the engine to apply remote changes locally and by
//! `LocalTransport` on its side. Writes are staged in the root's state
//! directory and renamed into place so readers never see partial content.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::exclude::STATE_DIR;
use crate::path::RelPath;

/// Staging directory for in-progress writes
#[must_use]
pub fn staging_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("tmp")
}

/// Atomically replace whatever is at `path` with a file holding `content`
pub fn write_file(root: &Path, path: &RelPath, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(root, &parent)?;
    }

    let target = path.to_native(root);
    if fs::symlink_metadata(&target).is_ok_and(|metadata| metadata.is_dir()) {
        fs::remove_dir_all(&target)?;
    }

    let staging = staging_dir(root);
    fs::create_dir_all(&staging)?;

    let mut tmp = NamedTempFile::new_in(&staging)?;
    tmp.write_all(content)?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}

/// Create `path` and any missing parents, replacing non-directories in the way
pub fn create_dir(root: &Path, path: &RelPath) -> io::Result<()> {
    let mut current = root.to_path_buf();
    for segment in path.segments() {
        current.push(segment);
        match fs::metadata(&current) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                fs::remove_file(&current)?;
                fs::create_dir(&current)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling symlink still occupies the name
                if fs::symlink_metadata(&current).is_ok() {
                    fs::remove_file(&current)?;
                }
                match fs::create_dir(&current) {
                    Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e),
                    _ => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Remove `path`, recursively for directories. Absent paths are fine.
pub fn remove(root: &Path, path: &RelPath) -> io::Result<()> {
    if path.is_root() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to remove the sync root",
        ));
    }

    let target = path.to_native(root);
    let result = match fs::symlink_metadata(&target) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&target),
        Ok(_) => fs::remove_file(&target),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Read a file below the root
pub fn read_file(root: &Path, path: &RelPath) -> io::Result<Vec<u8>> {
    fs::read(path.to_native(root))
}
