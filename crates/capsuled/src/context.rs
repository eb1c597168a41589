//! Collaborator interfaces and the engine context.
//!
//! Everything the activation pipeline needs from outside (capsule
//! parsing, digest verification, verity metadata, kernel backends, the
//! checkpoint service, metrics, vendor-interface checks, the status
//! property) is carried in one [`EngineContext`] passed through the
//! pipeline. No process-level singletons.

use std::io::Read;
use std::path::{Path, PathBuf};

use capsule_core::capsule::{CapsuleHandle, CapsuleSource};
use capsule_core::database::MountScanner;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::kernel::{LoopBackend, MountBackend, VerityBackend, VerityTable};

/// Error reported by an external collaborator.
///
/// Collaborators are opaque services; their failures carry a message and
/// nothing the pipeline can usefully match on.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl From<String> for CollaboratorError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for CollaboratorError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

/// Verifies a materialised image against the outer capsule's declaration.
pub trait ImageVerifier {
    /// Checks that `image` matches what `expected` declares.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on digest mismatch or read failure.
    fn verify(&self, image: &Path, expected: &CapsuleHandle) -> Result<(), CollaboratorError>;
}

/// Reads dm-verity parameters out of a capsule's signed metadata.
pub trait VerityMetadataSource {
    /// The verity table for `handle`'s embedded image.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the capsule carries no usable
    /// verity descriptor.
    fn verity_table(&self, handle: &CapsuleHandle) -> Result<VerityTable, CollaboratorError>;
}

/// Filesystem-checkpoint service consulted before committing staged
/// sessions.
pub trait CheckpointInterface {
    /// Whether the storage stack supports filesystem checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the service is unreachable.
    fn supports_fs_checkpoints(&self) -> Result<bool, CollaboratorError>;

    /// Whether a checkpoint should be taken before committing.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the service is unreachable.
    fn needs_checkpoint(&self) -> Result<bool, CollaboratorError>;

    /// Whether the previous boot demands a rollback of staged changes.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the service is unreachable.
    fn needs_rollback(&self) -> Result<bool, CollaboratorError>;

    /// Starts a checkpoint spanning `retries` boot attempts.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the checkpoint cannot start.
    fn start_checkpoint(&self, retries: i32) -> Result<(), CollaboratorError>;

    /// Abandons checkpointed changes.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the abort cannot be issued.
    fn abort_changes(&self, msg: &str, retry: bool) -> Result<(), CollaboratorError>;
}

/// Outcome reported to the metrics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallResult {
    /// The staged install was activated.
    Success,
    /// The staged install failed to activate.
    Failure,
}

/// Fire-and-forget installation telemetry. Failures inside the sink must
/// never abort activation, so the methods cannot fail.
pub trait MetricsSink {
    /// A staged install is about to be committed.
    fn installation_requested(
        &self,
        capsule_name: &str,
        version: u64,
        is_rollback: bool,
        file_hashes: &[String],
    );

    /// A staged install finished.
    fn installation_ended(&self, file_hash: &str, result: InstallResult);
}

/// Vendor-interface compatibility check, run for vendor/odm capsules after
/// they are mounted.
pub trait VintfChecker {
    /// Checks `handle` as mounted at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] when the mounted capsule is
    /// incompatible with the device's vendor interface.
    fn check(&self, handle: &CapsuleHandle, mount_point: &Path) -> Result<(), CollaboratorError>;
}

/// Publishes the process-wide activation status.
pub trait StatusSink {
    /// Sets the status property to `status` (`starting`, `activated`,
    /// `ready`).
    fn set(&self, status: &str);
}

/// Everything the pipeline consumes, passed explicitly.
pub struct EngineContext<'a> {
    /// Capsule file parser.
    pub source: &'a dyn CapsuleSource,
    /// Materialised-image verifier.
    pub verifier: &'a dyn ImageVerifier,
    /// Verity metadata reader.
    pub verity_metadata: &'a dyn VerityMetadataSource,
    /// Loop device backend.
    pub loops: &'a dyn LoopBackend,
    /// Verity device backend.
    pub verity: &'a dyn VerityBackend,
    /// Mount backend.
    pub mounts: &'a dyn MountBackend,
    /// Kernel-state scanner for startup reconciliation.
    pub scanner: &'a dyn MountScanner,
    /// Checkpoint service.
    pub checkpoint: &'a dyn CheckpointInterface,
    /// Telemetry sink.
    pub metrics: &'a dyn MetricsSink,
    /// Vendor-interface checker.
    pub vintf: &'a dyn VintfChecker,
    /// Status property sink.
    pub status: &'a dyn StatusSink,
}

/// SHA-256 of a file's contents.
///
/// # Errors
///
/// Propagates read errors.
pub fn sha256_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Hex SHA-256 digests of `paths`, computed on a small helper pool.
///
/// Helpers only hash; results come back to the calling thread. Unreadable
/// files yield an empty digest string rather than failing the batch.
#[must_use]
pub fn sha256_files(paths: &[PathBuf]) -> Vec<String> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| scope.spawn(move || sha256_file(path).map(hex::encode).unwrap_or_default()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    })
}

/// Digest-comparing verifier: the materialised image must hash to the
/// digest the outer capsule declares.
#[derive(Debug, Default)]
pub struct Sha256Verifier;

impl ImageVerifier for Sha256Verifier {
    fn verify(&self, image: &Path, expected: &CapsuleHandle) -> Result<(), CollaboratorError> {
        let Some(declared) = expected.image_digest() else {
            return Err(CollaboratorError(format!(
                "{expected} declares no image digest"
            )));
        };
        let actual = sha256_file(image)
            .map_err(|e| CollaboratorError(format!("failed to hash {}: {e}", image.display())))?;
        if actual == declared {
            debug!(image = %image.display(), "image digest verified");
            Ok(())
        } else {
            Err(CollaboratorError(format!(
                "digest mismatch for {}: expected {}, got {}",
                image.display(),
                hex::encode(declared),
                hex::encode(&actual)
            )))
        }
    }
}

/// Status sink that logs transitions; stands in where no property service
/// exists.
#[derive(Debug, Default)]
pub struct LogStatusSink {
    /// Property name included in the log line.
    pub property: String,
}

impl StatusSink for LogStatusSink {
    fn set(&self, status: &str) {
        info!(property = %self.property, status, "status updated");
    }
}

/// Metrics sink that drops everything on the floor (telemetry is
/// best-effort by contract).
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn installation_requested(
        &self,
        capsule_name: &str,
        version: u64,
        is_rollback: bool,
        _file_hashes: &[String],
    ) {
        debug!(capsule_name, version, is_rollback, "installation requested");
    }

    fn installation_ended(&self, file_hash: &str, result: InstallResult) {
        debug!(file_hash, ?result, "installation ended");
    }
}

/// Checkpoint service for devices without checkpoint support.
#[derive(Debug, Default)]
pub struct NoCheckpoint;

impl CheckpointInterface for NoCheckpoint {
    fn supports_fs_checkpoints(&self) -> Result<bool, CollaboratorError> {
        Ok(false)
    }

    fn needs_checkpoint(&self) -> Result<bool, CollaboratorError> {
        Ok(false)
    }

    fn needs_rollback(&self) -> Result<bool, CollaboratorError> {
        Ok(false)
    }

    fn start_checkpoint(&self, _retries: i32) -> Result<(), CollaboratorError> {
        Err("checkpoints not supported".into())
    }

    fn abort_changes(&self, _msg: &str, _retry: bool) -> Result<(), CollaboratorError> {
        Err("checkpoints not supported".into())
    }
}

/// Vendor-interface checker that accepts everything; used on devices whose
/// compatibility data lives elsewhere.
#[derive(Debug, Default)]
pub struct PermissiveVintf;

impl VintfChecker for PermissiveVintf {
    fn check(&self, handle: &CapsuleHandle, _mount_point: &Path) -> Result<(), CollaboratorError> {
        debug!(capsule = %handle, "vendor-interface check skipped (permissive)");
        Ok(())
    }
}
