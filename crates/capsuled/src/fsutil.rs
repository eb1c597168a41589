//! Filesystem helpers shared across the daemon.
//!
//! The atomic writer follows the temp-file + fsync + rename + directory
//! fsync protocol: a crash at any point leaves either the old complete file
//! or the new complete file, never a torn one. Session state commits and
//! manifest emission both go through it.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Errors from filesystem helpers.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// The target path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParent {
        /// Offending path.
        path: PathBuf,
    },

    /// An I/O operation failed.
    #[error("{context} ({})", path.display())]
    Io {
        /// What was being attempted.
        context: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically.
///
/// The temp file is created in the target directory so the final rename
/// stays on one filesystem; data and the directory entry are both fsynced
/// before returning.
///
/// # Errors
///
/// Returns [`FsError`] when any step of the protocol fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path.parent().ok_or_else(|| FsError::NoParent {
        path: path.to_path_buf(),
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", parent, e))?;
    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", path, e))?;
    tmp.persist(path)
        .map_err(|e| FsError::io("rename into place", path, e.error))?;

    // The rename itself must survive a crash too.
    let dir = File::open(parent).map_err(|e| FsError::io("open parent for fsync", parent, e))?;
    dir.sync_all()
        .map_err(|e| FsError::io("fsync parent directory", parent, e))?;
    Ok(())
}

/// Creates `dir` (and missing ancestors) with `mode` on the leaf.
///
/// An already-existing directory is left untouched.
///
/// # Errors
///
/// Returns [`FsError`] when creation fails.
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<(), FsError> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .map_err(|e| FsError::io("create directory", dir, e))
}

/// Non-recursive listing of the regular files in `dir`, sorted by path.
/// A missing directory lists as empty.
///
/// # Errors
///
/// Returns [`FsError`] when the directory cannot be read.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, FsError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| FsError::io("read directory", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io("read directory entry", dir, e))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Inode number of `path`.
///
/// # Errors
///
/// Returns [`FsError`] when the file cannot be stat'ed.
pub fn inode_of(path: &Path) -> Result<u64, FsError> {
    let meta = fs::metadata(path).map_err(|e| FsError::io("stat", path, e))?;
    Ok(meta.ino())
}

/// Replaces (or creates) the symlink at `link` pointing to `target`.
///
/// # Errors
///
/// Returns [`FsError`] when removal of a previous entry or the link itself
/// fails.
pub fn replace_symlink(target: &Path, link: &Path) -> Result<(), FsError> {
    match fs::symlink_metadata(link) {
        Ok(_) => {
            fs::remove_file(link).map_err(|e| FsError::io("remove old symlink", link, e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(FsError::io("stat symlink", link, e)),
    }
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| FsError::io("create symlink", link, e))
}
