//! Repository of known capsule files.
//!
//! The repository holds at most two copies of every capsule: the
//! pre-installed one shipped on a read-only partition and an optional
//! data-side copy installed later. A data copy is only admitted when a
//! pre-installed counterpart exists and the signing keys match; shared-libs
//! capsules are exempt from the key check so multiple versions can coexist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::capsule::{CAPSULE_SUFFIX, CapsuleError, CapsuleHandle, CapsuleSource, Partition};

/// Errors from populating or querying the repository.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Two pre-installed capsules share a name. The build is broken; this
    /// is fatal for the scan.
    #[error(
        "duplicate pre-installed capsule {name}: {} and {}",
        first.display(),
        second.display()
    )]
    DuplicatePreinstalled {
        /// Duplicated package name.
        name: String,
        /// Path admitted first.
        first: PathBuf,
        /// Conflicting path.
        second: PathBuf,
    },

    /// A data-side capsule has no pre-installed counterpart.
    #[error("data capsule {} requires a pre-installed counterpart", path.display())]
    RequiresPreinstalled {
        /// Path of the rejected data capsule.
        path: PathBuf,
    },

    /// A data-side capsule is signed with a different key than its
    /// pre-installed counterpart.
    #[error("data capsule {} does not match the pre-installed signing key", path.display())]
    KeyMismatch {
        /// Path of the rejected data capsule.
        path: PathBuf,
    },

    /// A directory scan failed wholesale.
    #[error("failed to scan {}", dir.display())]
    Scan {
        /// Directory that could not be read.
        dir: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A pre-installed capsule file could not be opened.
    #[error(transparent)]
    Capsule(#[from] CapsuleError),
}

/// Pre-installed and data-side capsule handles, deduplicated by name.
#[derive(Debug, Default)]
pub struct CapsuleRepository {
    pre_installed: BTreeMap<String, CapsuleHandle>,
    data: BTreeMap<String, CapsuleHandle>,
}

impl CapsuleRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `dirs` for pre-installed capsules and admits every one of
    /// them.
    ///
    /// # Errors
    ///
    /// Fails on an unreadable directory, an unopenable capsule file, or a
    /// duplicate package name. Pre-installed capsules are part of the OS
    /// image, so any of these means the image itself is broken and the
    /// whole scan is rejected.
    pub fn add_pre_installed(
        &mut self,
        source: &dyn CapsuleSource,
        dirs: &[PathBuf],
    ) -> Result<(), RepositoryError> {
        for dir in dirs {
            for path in scan_capsule_files(dir)? {
                let handle = source.open(&path)?;
                if let Some(existing) = self.pre_installed.get(handle.name()) {
                    return Err(RepositoryError::DuplicatePreinstalled {
                        name: handle.name().to_string(),
                        first: existing.path().to_path_buf(),
                        second: path,
                    });
                }
                info!(name = handle.name(), version = handle.version(),
                      path = %path.display(), "found pre-installed capsule");
                self.pre_installed.insert(handle.name().to_string(), handle);
            }
        }
        Ok(())
    }

    /// Scans `dir` for data-side capsules.
    ///
    /// Individually bad entries (unopenable file, missing pre-installed
    /// counterpart, signing-key mismatch) are logged and skipped so one bad
    /// install cannot block the rest from activating. A data copy that
    /// names the same version as its pre-installed counterpart is retained;
    /// the selection tie-break decides which file is mounted.
    ///
    /// # Errors
    ///
    /// Fails only when the directory itself cannot be read.
    pub fn add_data(
        &mut self,
        source: &dyn CapsuleSource,
        dir: &Path,
    ) -> Result<(), RepositoryError> {
        for path in scan_capsule_files(dir)? {
            match self.open_data_capsule(source, &path) {
                Ok(handle) => {
                    info!(name = handle.name(), version = handle.version(),
                          path = %path.display(), "found data capsule");
                    self.data.insert(handle.name().to_string(), handle);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping data capsule"),
            }
        }
        Ok(())
    }

    fn open_data_capsule(
        &self,
        source: &dyn CapsuleSource,
        path: &Path,
    ) -> Result<CapsuleHandle, RepositoryError> {
        let handle = source.open(path)?;
        let Some(pre) = self.pre_installed.get(handle.name()) else {
            return Err(RepositoryError::RequiresPreinstalled {
                path: path.to_path_buf(),
            });
        };
        // Shared-libs capsules intentionally coexist across versions and
        // key rotations.
        if !handle.is_interchangeable_with(pre) && !handle.provides_shared_libs() {
            return Err(RepositoryError::KeyMismatch {
                path: path.to_path_buf(),
            });
        }
        Ok(handle)
    }

    /// All known handles grouped by package name, pre-installed first.
    #[must_use]
    pub fn all_by_name(&self) -> BTreeMap<&str, Vec<&CapsuleHandle>> {
        let mut all: BTreeMap<&str, Vec<&CapsuleHandle>> = BTreeMap::new();
        for handle in self.pre_installed.values() {
            all.entry(handle.name()).or_default().push(handle);
        }
        for handle in self.data.values() {
            all.entry(handle.name()).or_default().push(handle);
        }
        all
    }

    /// The pre-installed handle for `name`, if any.
    #[must_use]
    pub fn pre_installed(&self, name: &str) -> Option<&CapsuleHandle> {
        self.pre_installed.get(name)
    }

    /// The data-side handle for `name`, if any.
    #[must_use]
    pub fn data(&self, name: &str) -> Option<&CapsuleHandle> {
        self.data.get(name)
    }

    /// Whether a pre-installed copy of `name` exists.
    #[must_use]
    pub fn has_pre_installed(&self, name: &str) -> bool {
        self.pre_installed.contains_key(name)
    }

    /// Whether `handle` is the repository's pre-installed copy (matched by
    /// file path, since name and version may be shared with a data copy).
    #[must_use]
    pub fn is_pre_installed(&self, handle: &CapsuleHandle) -> bool {
        self.pre_installed
            .get(handle.name())
            .is_some_and(|pre| pre.path() == handle.path())
    }

    /// Partition tag for `handle`: the pre-installed copy's partition, or
    /// [`Partition::Unknown`] for capsules without one.
    #[must_use]
    pub fn partition(&self, handle: &CapsuleHandle) -> Partition {
        self.pre_installed
            .get(handle.name())
            .map_or(Partition::Unknown, CapsuleHandle::partition)
    }

    /// Every file path currently tracked by the repository.
    #[must_use]
    pub fn known_paths(&self) -> Vec<&Path> {
        self.pre_installed
            .values()
            .chain(self.data.values())
            .map(CapsuleHandle::path)
            .collect()
    }
}

/// Non-recursive scan of `dir` for capsule files, sorted by path.
///
/// A missing directory yields an empty list: a device without a data
/// partition entry simply has nothing installed there.
fn scan_capsule_files(dir: &Path) -> Result<Vec<PathBuf>, RepositoryError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|source| RepositoryError::Scan {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| RepositoryError::Scan {
            dir: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_capsule = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(CAPSULE_SUFFIX));
        if is_capsule && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
