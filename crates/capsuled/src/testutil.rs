//! Shared fixtures for engine and bootstrap tests.
//!
//! Capsule fixtures are real files with a tiny self-describing layout so
//! the whole pipeline (scan → open → decompress → mount probe) runs
//! against them unprivileged:
//!
//! ```text
//! [signing key: 8 bytes][image: ext4-looking bytes]            plain
//! [signing key: 8 bytes][b"CAPZ"][image: ext4-looking bytes]   compressed
//! ```
//!
//! Name and version come from the file stem (`<name>@<version>.capsule`);
//! a name containing `sharedlibs` marks the capsule as exporting shared
//! libraries, a name containing `vendor` lands it on the vendor partition.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use capsule_core::capsule::{CapsuleError, CapsuleHandle, CapsuleSource, Partition};
use capsule_core::database::{LiveMount, MountScanner};

use crate::context::{
    CheckpointInterface, CollaboratorError, EngineContext, InstallResult, MetricsSink,
    Sha256Verifier, StatusSink, VintfChecker,
};
use crate::kernel::VerityTable;
use crate::kernel::fake::FakeKernel;

const KEY_LEN: usize = 8;
const COMPRESSED_TAG: &[u8] = b"CAPZ";

/// An 8 KiB image with an ext4 superblock magic, enough for fstype
/// probing.
pub fn ext4_image() -> Vec<u8> {
    let mut image = vec![0u8; 8192];
    image[0x438..0x43A].copy_from_slice(&0xEF53u16.to_le_bytes());
    image
}

/// Writes a plain capsule fixture `<name>@<version>.capsule` into `dir`.
pub fn write_capsule(dir: &Path, name: &str, version: u64, key: &[u8; KEY_LEN]) -> PathBuf {
    let path = dir.join(format!("{name}@{version}.capsule"));
    std::fs::create_dir_all(dir).unwrap();
    let mut content = key.to_vec();
    content.extend_from_slice(&ext4_image());
    std::fs::write(&path, content).unwrap();
    path
}

/// Writes a compressed capsule fixture whose embedded image must be
/// materialised before mounting.
pub fn write_compressed_capsule(
    dir: &Path,
    name: &str,
    version: u64,
    key: &[u8; KEY_LEN],
) -> PathBuf {
    let path = dir.join(format!("{name}@{version}.capsule"));
    std::fs::create_dir_all(dir).unwrap();
    let mut content = key.to_vec();
    content.extend_from_slice(COMPRESSED_TAG);
    content.extend_from_slice(&ext4_image());
    std::fs::write(&path, content).unwrap();
    path
}

/// Capsule parser for the fixture layout above. Also answers verity
/// metadata with a fixed table, as the signed descriptor would.
#[derive(Debug, Default)]
pub struct FixtureSource;

impl CapsuleSource for FixtureSource {
    fn open(&self, path: &Path) -> Result<CapsuleHandle, CapsuleError> {
        let malformed = |reason: &str| CapsuleError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| malformed("no file stem"))?;
        let (name, version) = stem.rsplit_once('@').ok_or_else(|| malformed("no @version"))?;
        let version: u64 = version.parse().map_err(|_| malformed("bad version"))?;

        let content = std::fs::read(path).map_err(|source| CapsuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if content.len() < KEY_LEN {
            return Err(malformed("truncated"));
        }
        let (key, body) = content.split_at(KEY_LEN);

        let partition = if name.contains("vendor") {
            Partition::Vendor
        } else {
            Partition::System
        };
        let mut builder = CapsuleHandle::builder(name, version)
            .path(path)
            .public_key(key.to_vec())
            .partition(partition)
            .provides_shared_libs(name.contains("sharedlibs"));

        builder = if body.starts_with(COMPRESSED_TAG) {
            let offset = (KEY_LEN + COMPRESSED_TAG.len()) as u64;
            let inner = &body[COMPRESSED_TAG.len()..];
            let digest = {
                use sha2::Digest;
                sha2::Sha256::digest(inner).to_vec()
            };
            builder.compressed(offset, inner.len() as u64).image_digest(digest)
        } else {
            builder.image(KEY_LEN as u64, body.len() as u64)
        };

        Ok(builder.build())
    }
}

impl crate::context::VerityMetadataSource for FixtureSource {
    fn verity_table(&self, _handle: &CapsuleHandle) -> Result<VerityTable, CollaboratorError> {
        Ok(VerityTable {
            data_block_size: 4096,
            hash_block_size: 4096,
            data_blocks: 2,
            hash_start_block: 3,
            algorithm: "sha256".to_string(),
            root_digest: "12".repeat(32),
            salt: "34".repeat(32),
        })
    }
}

/// Scanner for a daemon that booted with nothing mounted.
#[derive(Debug, Default)]
pub struct EmptyScanner;

impl MountScanner for EmptyScanner {
    fn scan(&self) -> Result<Vec<LiveMount>, String> {
        Ok(Vec::new())
    }
}

/// Scanner returning a canned set of live mounts.
#[derive(Debug, Default)]
pub struct FixedScanner(pub Vec<LiveMount>);

impl MountScanner for FixedScanner {
    fn scan(&self) -> Result<Vec<LiveMount>, String> {
        Ok(self.0.clone())
    }
}

/// Records every status transition.
#[derive(Debug, Default)]
pub struct RecordingStatus(pub Mutex<Vec<String>>);

impl StatusSink for RecordingStatus {
    fn set(&self, status: &str) {
        self.0.lock().unwrap().push(status.to_string());
    }
}

/// Records metrics calls.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    /// `(capsule_name, version, is_rollback)` per request.
    pub requested: Mutex<Vec<(String, u64, bool)>>,
    /// `(file_hash, success)` per completion.
    pub ended: Mutex<Vec<(String, bool)>>,
}

impl MetricsSink for RecordingMetrics {
    fn installation_requested(
        &self,
        capsule_name: &str,
        version: u64,
        is_rollback: bool,
        _file_hashes: &[String],
    ) {
        self.requested
            .lock()
            .unwrap()
            .push((capsule_name.to_string(), version, is_rollback));
    }

    fn installation_ended(&self, file_hash: &str, result: InstallResult) {
        self.ended
            .lock()
            .unwrap()
            .push((file_hash.to_string(), result == InstallResult::Success));
    }
}

/// Checkpoint fake with settable answers.
#[derive(Debug, Default)]
pub struct FakeCheckpoint {
    /// Answer for `supports_fs_checkpoints`.
    pub supports: bool,
    /// Answer for `needs_checkpoint`.
    pub needs_checkpoint: bool,
    /// Answer for `needs_rollback`.
    pub needs_rollback: bool,
    /// Recorded `start_checkpoint` calls.
    pub started: Mutex<Vec<i32>>,
    /// Recorded `abort_changes` messages.
    pub aborted: Mutex<Vec<String>>,
}

impl CheckpointInterface for FakeCheckpoint {
    fn supports_fs_checkpoints(&self) -> Result<bool, CollaboratorError> {
        Ok(self.supports)
    }

    fn needs_checkpoint(&self) -> Result<bool, CollaboratorError> {
        Ok(self.needs_checkpoint)
    }

    fn needs_rollback(&self) -> Result<bool, CollaboratorError> {
        Ok(self.needs_rollback)
    }

    fn start_checkpoint(&self, retries: i32) -> Result<(), CollaboratorError> {
        self.started.lock().unwrap().push(retries);
        Ok(())
    }

    fn abort_changes(&self, msg: &str, _retry: bool) -> Result<(), CollaboratorError> {
        self.aborted.lock().unwrap().push(msg.to_string());
        Ok(())
    }
}

/// Vendor-interface checker that rejects capsules whose name contains a
/// configured needle.
#[derive(Debug, Default)]
pub struct FakeVintf {
    /// Names containing this substring fail the check.
    pub reject_containing: Option<String>,
}

impl VintfChecker for FakeVintf {
    fn check(&self, handle: &CapsuleHandle, _mount_point: &Path) -> Result<(), CollaboratorError> {
        match &self.reject_containing {
            Some(needle) if handle.name().contains(needle.as_str()) => Err(CollaboratorError(
                format!("{} is vendor-interface incompatible", handle.name()),
            )),
            _ => Ok(()),
        }
    }
}

/// Owns every collaborator an [`EngineContext`] borrows.
#[derive(Debug, Default)]
pub struct Harness {
    /// Fake kernel backends.
    pub kernel: FakeKernel,
    /// Fixture capsule parser.
    pub source: FixtureSource,
    /// Real digest verifier (fixtures carry real digests).
    pub verifier: Sha256Verifier,
    /// Startup scanner.
    pub scanner: EmptyScanner,
    /// Checkpoint fake.
    pub checkpoint: FakeCheckpoint,
    /// Metrics recorder.
    pub metrics: RecordingMetrics,
    /// Vintf fake.
    pub vintf: FakeVintf,
    /// Status recorder.
    pub status: RecordingStatus,
}

impl Harness {
    /// Builds the context borrowing this harness's collaborators.
    pub fn ctx(&self) -> EngineContext<'_> {
        EngineContext {
            source: &self.source,
            verifier: &self.verifier,
            verity_metadata: &self.source,
            loops: &self.kernel,
            verity: &self.kernel,
            mounts: &self.kernel,
            scanner: &self.scanner,
            checkpoint: &self.checkpoint,
            metrics: &self.metrics,
            vintf: &self.vintf,
            status: &self.status,
        }
    }
}
