//! Daemon configuration.
//!
//! Paths and knobs come from an optional TOML file; CLI flags override
//! individual fields. Defaults describe the production layout, tests build
//! configs against temp directories.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}", path.display())]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {}", path.display())]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapsuledConfig {
    /// Root under which capsules are mounted and published.
    pub capsule_root: PathBuf,
    /// Directories scanned for pre-installed capsules, in order.
    pub builtin_dirs: Vec<PathBuf>,
    /// Directory of data-side (installed/updated) capsules. Decompressed
    /// capsules are hard-linked here as well.
    pub data_dir: PathBuf,
    /// Scratch area where compressed capsules are materialised.
    pub decompression_dir: PathBuf,
    /// Root of persistent staged-install sessions.
    pub sessions_root: PathBuf,
    /// Base directory holding per-session staged payloads
    /// (`<staging_base_dir>/session_<id>/`).
    pub staging_base_dir: PathBuf,
    /// Name of the process-wide status property.
    pub status_property: String,
    /// True when booting in recovery: the data directory is not scanned.
    pub in_recovery: bool,
}

impl Default for CapsuledConfig {
    fn default() -> Self {
        Self {
            capsule_root: PathBuf::from("/capsule"),
            builtin_dirs: vec![
                PathBuf::from("/system/capsule"),
                PathBuf::from("/system_ext/capsule"),
                PathBuf::from("/product/capsule"),
                PathBuf::from("/vendor/capsule"),
                PathBuf::from("/odm/capsule"),
            ],
            data_dir: PathBuf::from("/data/capsule/active"),
            decompression_dir: PathBuf::from("/data/capsule/decompressed"),
            sessions_root: PathBuf::from("/metadata/capsule/sessions"),
            staging_base_dir: PathBuf::from("/data/capsule/staging"),
            status_property: "capsuled.status".to_string(),
            in_recovery: false,
        }
    }
}

impl CapsuledConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A configuration rooted entirely under `base`, used by tests and the
    /// OTA chroot.
    #[must_use]
    pub fn under_root(base: &Path) -> Self {
        Self {
            capsule_root: base.join("capsule"),
            builtin_dirs: vec![base.join("builtin")],
            data_dir: base.join("data"),
            decompression_dir: base.join("decompressed"),
            sessions_root: base.join("sessions"),
            staging_base_dir: base.join("staging"),
            status_property: "capsuled.status".to_string(),
            in_recovery: false,
        }
    }
}
