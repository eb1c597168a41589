//! OTA chroot bootstrap.
//!
//! During an over-the-air update the update engine runs the activation
//! pipeline inside a chroot to assemble the next OS image's capsule view.
//! The host daemon's devices are still live, so verity devices get the
//! `chroot` suffix, and the pipeline is reduced: no sessions, no
//! checkpoint, no status property. The caller is a short-lived process
//! that reports through its exit code.

use std::path::PathBuf;

use tracing::{error, info};

use crate::config::CapsuledConfig;
use crate::context::EngineContext;
use crate::engine::ActivationEngine;

/// Verity-device suffix used inside the OTA chroot.
pub const CHROOT_DEVICE_SUFFIX: &str = "chroot";

/// Runs the reduced pipeline against `builtin_dirs` and `data_dir`,
/// returning the process exit code: 0 on success, 1 when the pipeline
/// failed (in which case no manifest was emitted).
#[must_use]
pub fn run(
    ctx: &EngineContext<'_>,
    mut config: CapsuledConfig,
    builtin_dirs: Vec<PathBuf>,
    data_dir: PathBuf,
) -> i32 {
    if !builtin_dirs.is_empty() {
        config.builtin_dirs = builtin_dirs;
    }
    config.data_dir = data_dir;

    let mut engine = ActivationEngine::with_device_suffix(ctx, config, CHROOT_DEVICE_SUFFIX);
    match engine.run_ota_chroot() {
        Ok(()) => {
            info!("OTA chroot bootstrap complete");
            0
        }
        Err(e) => {
            error!(error = %e, "OTA chroot bootstrap failed");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil;
    use crate::testutil::{Harness, write_capsule, write_compressed_capsule};
    use capsule_core::manifest::MANIFEST_FILE_NAME;

    const KEY: &[u8; 8] = b"keyAAAAA";

    #[test]
    fn pre_installed_only_bootstrap_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = CapsuledConfig::under_root(dir.path());
        let builtin = config.builtin_dirs[0].clone();
        write_capsule(&builtin, "aaa", 1, KEY);
        let harness = Harness::default();
        let ctx = harness.ctx();

        let code = run(&ctx, config.clone(), vec![builtin], config.data_dir.clone());

        assert_eq!(code, 0);
        assert!(
            harness.kernel.state.lock().unwrap().mounts
                .contains_key(&config.capsule_root.join("aaa@1"))
        );
        assert!(config.capsule_root.join(MANIFEST_FILE_NAME).exists());

        // Devices are suffixed so they cannot collide with the host
        // daemon's devices of the same base names.
        let verity = harness.kernel.state.lock().unwrap().verity.clone();
        assert!(verity.contains_key("aaa@1.chroot"));
    }

    #[test]
    fn data_capsule_participates_in_selection() {
        let dir = tempfile::tempdir().unwrap();
        let config = CapsuledConfig::under_root(dir.path());
        let builtin = config.builtin_dirs[0].clone();
        write_capsule(&builtin, "aaa", 1, KEY);
        write_capsule(&config.data_dir, "aaa", 2, KEY);
        let harness = Harness::default();
        let ctx = harness.ctx();

        let code = run(&ctx, config.clone(), vec![builtin], config.data_dir.clone());

        assert_eq!(code, 0);
        let mounts = harness.kernel.state.lock().unwrap().mounts.clone();
        assert!(mounts.contains_key(&config.capsule_root.join("aaa@2")));
        assert!(!mounts.contains_key(&config.capsule_root.join("aaa@1")));
    }

    #[test]
    fn compressed_capsule_is_materialised_before_mounting() {
        let dir = tempfile::tempdir().unwrap();
        let config = CapsuledConfig::under_root(dir.path());
        let builtin = config.builtin_dirs[0].clone();
        write_compressed_capsule(&builtin, "packed", 1, KEY);
        let harness = Harness::default();
        let ctx = harness.ctx();

        let code = run(&ctx, config.clone(), vec![builtin], config.data_dir.clone());

        assert_eq!(code, 0);
        assert!(
            harness.kernel.state.lock().unwrap().mounts
                .contains_key(&config.capsule_root.join("packed@1"))
        );

        // The active copy is hard-linked to the decompressed copy.
        assert_eq!(
            fsutil::inode_of(&config.data_dir.join("packed@1.capsule")).unwrap(),
            fsutil::inode_of(&config.decompression_dir.join("packed@1.capsule")).unwrap()
        );
    }

    #[test]
    fn unscannable_builtin_dir_exits_1_without_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = CapsuledConfig::under_root(dir.path());
        let builtin = config.builtin_dirs[0].clone();
        std::fs::create_dir_all(&builtin).unwrap();
        std::fs::write(builtin.join("broken.capsule"), b"junk").unwrap();
        let harness = Harness::default();
        let ctx = harness.ctx();

        let code = run(&ctx, config.clone(), vec![builtin], config.data_dir.clone());

        assert_eq!(code, 1);
        assert!(!config.capsule_root.join(MANIFEST_FILE_NAME).exists());
        assert!(harness.kernel.is_quiescent());
    }

    #[test]
    fn missing_data_dir_bootstraps_pre_installed_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = CapsuledConfig::under_root(dir.path());
        let builtin = config.builtin_dirs[0].clone();
        write_capsule(&builtin, "aaa", 1, KEY);
        let harness = Harness::default();
        let ctx = harness.ctx();

        let code = run(
            &ctx,
            config.clone(),
            vec![builtin],
            dir.path().join("does-not-exist"),
        );

        assert_eq!(code, 0);
        assert!(
            harness.kernel.state.lock().unwrap().mounts
                .contains_key(&config.capsule_root.join("aaa@1"))
        );
    }
}
