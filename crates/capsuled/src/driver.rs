//! One activation attempt: loop attach, verity, mount.
//!
//! The scoped unit here is the *attempt*. Until the mount succeeds, a
//! guard owns every kernel resource acquired so far and tears it down in
//! reverse order on any early exit; a partially activated capsule must
//! never outlive its activation call. Deactivation is the mirror image and
//! is deliberately best-effort: every step runs regardless of earlier
//! failures, and the failures are aggregated into one error.

use std::path::{Path, PathBuf};

use capsule_core::capsule::CapsuleHandle;
use capsule_core::database::MountedRecord;
use tracing::{debug, warn};

use crate::context::{CollaboratorError, VerityMetadataSource};
use crate::fsutil::{self, FsError};
use crate::kernel::{
    self, KernelError, LoopBackend, MountBackend, VerityBackend, verity_device_name,
};

/// Errors from one activation attempt or teardown.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A kernel-facing step failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// The mount point could not be prepared.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The capsule's verity descriptor could not be read.
    #[error("no verity metadata for {capsule}: {source}")]
    VerityMetadata {
        /// Capsule being activated.
        capsule: String,
        /// Collaborator failure.
        #[source]
        source: CollaboratorError,
    },

    /// Deactivation finished but some steps failed.
    #[error("teardown of {} incomplete: {}", mount_point.display(), failures.join("; "))]
    Teardown {
        /// Mount point being torn down.
        mount_point: PathBuf,
        /// Description of every failed step.
        failures: Vec<String>,
    },
}

/// Drives activation attempts against the kernel backends.
pub struct ActivationDriver<'a> {
    loops: &'a dyn LoopBackend,
    verity: &'a dyn VerityBackend,
    mounts: &'a dyn MountBackend,
    verity_metadata: &'a dyn VerityMetadataSource,
    device_suffix: String,
}

impl<'a> ActivationDriver<'a> {
    /// Creates a driver whose verity devices carry `device_suffix`
    /// (`chroot` under OTA bootstrap, the daemon's process tag otherwise).
    pub fn new(
        loops: &'a dyn LoopBackend,
        verity: &'a dyn VerityBackend,
        mounts: &'a dyn MountBackend,
        verity_metadata: &'a dyn VerityMetadataSource,
        device_suffix: impl Into<String>,
    ) -> Self {
        Self {
            loops,
            verity,
            mounts,
            verity_metadata,
            device_suffix: device_suffix.into(),
        }
    }

    /// Activates `handle` at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] after tearing down whatever was partially
    /// set up.
    pub fn activate(
        &self,
        handle: &CapsuleHandle,
        mount_point: &Path,
        verity_required: bool,
    ) -> Result<MountedRecord, DriverError> {
        fsutil::ensure_dir(mount_point, 0o755)?;

        let fstype = kernel::detect_fstype(handle.path(), handle.image_offset())?;

        let loop_device =
            self.loops
                .attach(handle.path(), handle.image_offset(), handle.image_size())?;
        let mut guard = AttemptGuard {
            driver: self,
            loop_device: Some(loop_device.clone()),
            verity_name: None,
            armed: true,
        };

        let (block_device, verity_name) = if verity_required {
            let table = self.verity_metadata.verity_table(handle).map_err(|source| {
                DriverError::VerityMetadata {
                    capsule: handle.versioned_name(),
                    source,
                }
            })?;
            let name = verity_device_name(&handle.versioned_name(), &self.device_suffix);
            let device = self.verity.create(&name, &loop_device, &table)?;
            guard.verity_name = Some(name.clone());
            (device, name)
        } else {
            (loop_device.clone(), String::new())
        };

        self.mounts.mount(&block_device, mount_point, fstype)?;
        guard.armed = false;

        debug!(capsule = %handle, mount_point = %mount_point.display(), fstype, "activated");
        Ok(MountedRecord {
            version: handle.version(),
            loop_device,
            image_path: handle.path().to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            verity_device: verity_name,
        })
    }

    /// Deactivates `record`: unmount, remove verity, detach loop.
    ///
    /// Every step is attempted regardless of earlier failures.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Teardown`] aggregating every failed step.
    pub fn deactivate(&self, record: &MountedRecord) -> Result<(), DriverError> {
        let mut failures = Vec::new();

        if let Err(e) = self.mounts.unmount(&record.mount_point) {
            failures.push(e.to_string());
        }
        if !record.verity_device.is_empty() {
            if let Err(e) = self.verity.remove(&record.verity_device) {
                failures.push(e.to_string());
            }
        }
        if let Err(e) = self.loops.detach(&record.loop_device) {
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            debug!(mount_point = %record.mount_point.display(), "deactivated");
            Ok(())
        } else {
            Err(DriverError::Teardown {
                mount_point: record.mount_point.clone(),
                failures,
            })
        }
    }
}

/// Owns partially acquired kernel resources during an attempt. Dropping it
/// armed tears them down in reverse acquisition order.
struct AttemptGuard<'d, 'a> {
    driver: &'d ActivationDriver<'a>,
    loop_device: Option<PathBuf>,
    verity_name: Option<String>,
    armed: bool,
}

impl Drop for AttemptGuard<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(name) = self.verity_name.take() {
            if let Err(e) = self.driver.verity.remove(&name) {
                warn!(name, error = %e, "failed to roll back verity device");
            }
        }
        if let Some(device) = self.loop_device.take() {
            if let Err(e) = self.driver.loops.detach(&device) {
                warn!(device = %device.display(), error = %e, "failed to roll back loop device");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CollaboratorError;
    use crate::kernel::VerityTable;
    use crate::kernel::fake::FakeKernel;
    use std::io::{Seek, SeekFrom, Write};

    struct FixedVerity {
        fail: bool,
    }

    impl VerityMetadataSource for FixedVerity {
        fn verity_table(&self, handle: &CapsuleHandle) -> Result<VerityTable, CollaboratorError> {
            if self.fail {
                return Err(CollaboratorError(format!("{handle} has no descriptor")));
            }
            Ok(VerityTable {
                data_block_size: 4096,
                hash_block_size: 4096,
                data_blocks: 16,
                hash_start_block: 17,
                algorithm: "sha256".to_string(),
                root_digest: "ab".repeat(32),
                salt: "cd".repeat(32),
            })
        }
    }

    /// Writes an ext4-looking image file and returns a handle over it.
    fn capsule_fixture(dir: &Path, name: &str, version: u64) -> CapsuleHandle {
        let path = dir.join(format!("{name}@{version}.capsule"));
        let mut file = std::fs::File::create(&path).unwrap();
        file.seek(SeekFrom::Start(0x438)).unwrap();
        file.write_all(&0xEF53u16.to_le_bytes()).unwrap();
        file.set_len(8192).unwrap();
        CapsuleHandle::builder(name, version)
            .path(&path)
            .image(0, 8192)
            .build()
    }

    fn driver<'a>(kernel: &'a FakeKernel, meta: &'a FixedVerity) -> ActivationDriver<'a> {
        ActivationDriver::new(kernel, kernel, kernel, meta, "test")
    }

    #[test]
    fn activate_produces_a_complete_record() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let meta = FixedVerity { fail: false };
        let handle = capsule_fixture(dir.path(), "pkg", 3);
        let mount_point = dir.path().join("capsule/pkg@3");

        let record = driver(&kernel, &meta).activate(&handle, &mount_point, true).unwrap();

        assert_eq!(record.version, 3);
        assert_eq!(record.loop_device, Path::new("/dev/loop0"));
        assert_eq!(record.image_path, handle.path());
        assert_eq!(record.mount_point, mount_point);
        assert_eq!(record.verity_device, "pkg@3.test");
        assert_eq!(kernel.mount_count(), 1);
        assert_eq!(kernel.verity_count(), 1);
    }

    #[test]
    fn activate_without_verity_leaves_name_empty() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let meta = FixedVerity { fail: false };
        let handle = capsule_fixture(dir.path(), "pkg", 1);

        let record = driver(&kernel, &meta)
            .activate(&handle, &dir.path().join("mnt"), false)
            .unwrap();

        assert_eq!(record.verity_device, "");
        assert_eq!(kernel.verity_count(), 0);
    }

    #[test]
    fn mount_failure_tears_down_verity_and_loop() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        kernel.failures.lock().unwrap().fail_mount_containing = Some("pkg".to_string());
        let meta = FixedVerity { fail: false };
        let handle = capsule_fixture(dir.path(), "pkg", 1);

        let err = driver(&kernel, &meta)
            .activate(&handle, &dir.path().join("pkg@1"), true)
            .unwrap_err();

        assert!(matches!(err, DriverError::Kernel(KernelError::Mount { .. })));
        assert!(kernel.is_quiescent(), "partial state leaked: {:?}", kernel.state.lock().unwrap());
    }

    #[test]
    fn missing_verity_metadata_detaches_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let meta = FixedVerity { fail: true };
        let handle = capsule_fixture(dir.path(), "pkg", 1);

        let err = driver(&kernel, &meta)
            .activate(&handle, &dir.path().join("mnt"), true)
            .unwrap_err();

        assert!(matches!(err, DriverError::VerityMetadata { .. }));
        assert!(kernel.is_quiescent());
    }

    #[test]
    fn loop_exhaustion_is_reported_per_capsule() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        kernel.failures.lock().unwrap().fail_attach = true;
        let meta = FixedVerity { fail: false };
        let handle = capsule_fixture(dir.path(), "pkg", 1);

        let err = driver(&kernel, &meta)
            .activate(&handle, &dir.path().join("mnt"), true)
            .unwrap_err();
        assert!(matches!(err, DriverError::Kernel(KernelError::LoopExhausted { .. })));
    }

    #[test]
    fn deactivate_reverses_activation() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let meta = FixedVerity { fail: false };
        let handle = capsule_fixture(dir.path(), "pkg", 1);

        let d = driver(&kernel, &meta);
        let record = d.activate(&handle, &dir.path().join("mnt"), true).unwrap();
        d.deactivate(&record).unwrap();

        assert!(kernel.is_quiescent());

        // Teardown ran in reverse order: umount, then verity, then loop.
        let log = kernel.state.lock().unwrap().log.clone();
        let tail: Vec<_> = log.iter().rev().take(3).rev().collect();
        assert!(tail[0].starts_with("umount"));
        assert!(tail[1].starts_with("verity-remove"));
        assert!(tail[2].starts_with("detach"));
    }

    #[test]
    fn deactivate_aggregates_all_failures() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let meta = FixedVerity { fail: false };
        let handle = capsule_fixture(dir.path(), "pkg", 1);

        let d = driver(&kernel, &meta);
        let record = d.activate(&handle, &dir.path().join("mnt"), true).unwrap();

        {
            let mut failures = kernel.failures.lock().unwrap();
            failures.fail_unmount = true;
            failures.fail_detach = true;
        }

        let err = d.deactivate(&record).unwrap_err();
        let DriverError::Teardown { failures, .. } = err else {
            panic!("expected Teardown, got: {err}");
        };
        // Unmount and detach failed; the verity step in between still ran.
        assert_eq!(failures.len(), 2);
        assert_eq!(kernel.verity_count(), 0);
    }
}
