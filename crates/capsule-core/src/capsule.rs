//! Opened capsule handles and their identity rules.
//!
//! A [`CapsuleHandle`] is the in-memory view of one capsule file on disk:
//! its identity (name, version, signing key), where it came from, and the
//! location of the embedded filesystem image inside the file. Handles are
//! read-mostly; the repository owns them and every other component borrows.
//!
//! Parsing and signature verification of the on-disk format are not done
//! here; they belong to the [`CapsuleSource`] implementation the daemon is
//! wired with.

use std::fmt;
use std::path::{Path, PathBuf};

/// File-name suffix of capsule files picked up by directory scans.
pub const CAPSULE_SUFFIX: &str = ".capsule";

/// Partition a pre-installed capsule was shipped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Partition {
    /// `/system`.
    System,
    /// `/system_ext`.
    SystemExt,
    /// `/product`.
    Product,
    /// `/vendor`.
    Vendor,
    /// `/odm`.
    Odm,
    /// Not shipped on a recognised partition (e.g. data-side installs).
    #[default]
    Unknown,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::SystemExt => "system_ext",
            Self::Product => "product",
            Self::Vendor => "vendor",
            Self::Odm => "odm",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Errors surfaced when opening or reading a capsule file.
#[derive(Debug, thiserror::Error)]
pub enum CapsuleError {
    /// The file is not a well-formed capsule.
    #[error("malformed capsule at {}: {reason}", path.display())]
    Malformed {
        /// Path of the offending file.
        path: PathBuf,
        /// Parser's description of what was wrong.
        reason: String,
    },

    /// I/O failure while reading the capsule file.
    #[error("failed to read capsule at {}", path.display())]
    Io {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// An opened capsule file.
///
/// Two handles refer to the *same logical capsule* iff their names match;
/// they are *interchangeable* iff names and signing keys both match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleHandle {
    name: String,
    version: u64,
    version_name: String,
    public_key: Vec<u8>,
    path: PathBuf,
    partition: Partition,
    provides_shared_libs: bool,
    is_compressed: bool,
    image_offset: u64,
    image_size: u64,
    image_digest: Option<Vec<u8>>,
}

impl CapsuleHandle {
    /// Starts building a handle for `name` at `version`.
    pub fn builder(name: impl Into<String>, version: u64) -> CapsuleHandleBuilder {
        CapsuleHandleBuilder {
            handle: Self {
                name: name.into(),
                version,
                version_name: version.to_string(),
                public_key: Vec::new(),
                path: PathBuf::new(),
                partition: Partition::Unknown,
                provides_shared_libs: false,
                is_compressed: false,
                image_offset: 0,
                image_size: 0,
                image_digest: None,
            },
        }
    }

    /// Package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Monotonic version code.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Human-readable version string for the activation manifest.
    #[must_use]
    pub fn version_name(&self) -> &str {
        &self.version_name
    }

    /// Signing-key fingerprint (opaque bytes).
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Path of the capsule file this handle was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Partition tag assigned when the file was opened.
    #[must_use]
    pub const fn partition(&self) -> Partition {
        self.partition
    }

    /// Whether the manifest flags this capsule as exporting shared
    /// libraries. Multiple versions of such capsules may coexist.
    #[must_use]
    pub const fn provides_shared_libs(&self) -> bool {
        self.provides_shared_libs
    }

    /// Whether the embedded image must be materialised before it can be
    /// mounted.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Byte offset of the embedded filesystem image within the file.
    #[must_use]
    pub const fn image_offset(&self) -> u64 {
        self.image_offset
    }

    /// Byte length of the embedded filesystem image.
    #[must_use]
    pub const fn image_size(&self) -> u64 {
        self.image_size
    }

    /// SHA-256 digest the outer capsule declares for the embedded image,
    /// when the capsule is compressed.
    #[must_use]
    pub fn image_digest(&self) -> Option<&[u8]> {
        self.image_digest.as_deref()
    }

    /// `<name>@<version>`, the stem used for mount points, device names and
    /// materialised file names.
    #[must_use]
    pub fn versioned_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// True iff `other` refers to the same logical capsule.
    #[must_use]
    pub fn is_same_capsule(&self, other: &Self) -> bool {
        self.name == other.name
    }

    /// True iff `other` refers to the same logical capsule signed with the
    /// same key, making the two files interchangeable.
    #[must_use]
    pub fn is_interchangeable_with(&self, other: &Self) -> bool {
        self.is_same_capsule(other) && self.public_key == other.public_key
    }
}

impl fmt::Display for CapsuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.path.display())
    }
}

/// Builder for [`CapsuleHandle`], used by capsule sources and tests.
#[derive(Debug)]
pub struct CapsuleHandleBuilder {
    handle: CapsuleHandle,
}

impl CapsuleHandleBuilder {
    /// Overrides the manifest version string (defaults to the decimal
    /// rendering of the version code).
    #[must_use]
    pub fn version_name(mut self, version_name: impl Into<String>) -> Self {
        self.handle.version_name = version_name.into();
        self
    }

    /// Sets the signing-key fingerprint.
    #[must_use]
    pub fn public_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.handle.public_key = key.into();
        self
    }

    /// Sets the path the capsule was opened from.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.handle.path = path.into();
        self
    }

    /// Sets the partition tag.
    #[must_use]
    pub fn partition(mut self, partition: Partition) -> Self {
        self.handle.partition = partition;
        self
    }

    /// Marks the capsule as exporting shared libraries.
    #[must_use]
    pub fn provides_shared_libs(mut self, yes: bool) -> Self {
        self.handle.provides_shared_libs = yes;
        self
    }

    /// Marks the capsule as compressed and records where the embedded image
    /// lives inside the file.
    #[must_use]
    pub fn compressed(mut self, offset: u64, size: u64) -> Self {
        self.handle.is_compressed = true;
        self.handle.image_offset = offset;
        self.handle.image_size = size;
        self
    }

    /// Records where the mountable image lives inside an uncompressed
    /// capsule file.
    #[must_use]
    pub fn image(mut self, offset: u64, size: u64) -> Self {
        self.handle.image_offset = offset;
        self.handle.image_size = size;
        self
    }

    /// Declares the expected digest of the embedded image.
    #[must_use]
    pub fn image_digest(mut self, digest: impl Into<Vec<u8>>) -> Self {
        self.handle.image_digest = Some(digest.into());
        self
    }

    /// Finishes the handle.
    #[must_use]
    pub fn build(self) -> CapsuleHandle {
        self.handle
    }
}

/// Opens capsule files.
///
/// The production implementation parses the signed on-disk format and
/// verifies the manifest signature before returning a handle; tests use a
/// fixture-backed source. Either way, a returned handle is trusted by the
/// rest of the pipeline.
pub trait CapsuleSource {
    /// Opens the capsule file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError`] when the file cannot be read or is not a
    /// well-formed, correctly signed capsule.
    fn open(&self, path: &Path) -> Result<CapsuleHandle, CapsuleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_name_formatting() {
        let handle = CapsuleHandle::builder("com.example.runtime", 31).build();
        assert_eq!(handle.versioned_name(), "com.example.runtime@31");
    }

    #[test]
    fn version_name_defaults_to_version_code() {
        let handle = CapsuleHandle::builder("a", 7).build();
        assert_eq!(handle.version_name(), "7");

        let named = CapsuleHandle::builder("a", 7).version_name("7.1-beta").build();
        assert_eq!(named.version_name(), "7.1-beta");
    }

    #[test]
    fn same_capsule_ignores_version_and_key() {
        let v1 = CapsuleHandle::builder("a", 1).public_key([1u8; 4]).build();
        let v2 = CapsuleHandle::builder("a", 2).public_key([2u8; 4]).build();
        let other = CapsuleHandle::builder("b", 1).public_key([1u8; 4]).build();

        assert!(v1.is_same_capsule(&v2));
        assert!(!v1.is_same_capsule(&other));
    }

    #[test]
    fn interchangeable_requires_matching_key() {
        let key_a = CapsuleHandle::builder("a", 1).public_key([1u8; 4]).build();
        let key_a2 = CapsuleHandle::builder("a", 2).public_key([1u8; 4]).build();
        let key_b = CapsuleHandle::builder("a", 2).public_key([2u8; 4]).build();

        assert!(key_a.is_interchangeable_with(&key_a2));
        assert!(!key_a.is_interchangeable_with(&key_b));
    }
}
