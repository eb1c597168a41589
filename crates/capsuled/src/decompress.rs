//! Materialisation of compressed capsules.
//!
//! A compressed capsule carries its mountable image as an embedded byte
//! range. Before activation the range is copied into the decompression
//! area, verified against the digest the outer capsule declares, and
//! hard-linked into the active-capsule directory; activation then mounts
//! only the active-dir copy. The decompression area is garbage-collected
//! by inode comparison so a rollback that removes the active copy also
//! frees its scratch twin.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use capsule_core::capsule::{CAPSULE_SUFFIX, CapsuleHandle};
use capsule_core::repository::CapsuleRepository;
use tracing::{debug, info, warn};

use crate::context::{CollaboratorError, ImageVerifier};
use crate::fsutil::{self, FsError};

/// Name of the space-reservation file maintained by [`reserve_slab`].
pub const RESERVED_SLAB_FILE: &str = "reserved.slab";

/// Errors from the decompression stage.
#[derive(Debug, thiserror::Error)]
pub enum DecompressError {
    /// A reservation cannot be negative.
    #[error("cannot reserve {size} bytes")]
    NegativeReservation {
        /// Requested size.
        size: i64,
    },

    /// Filesystem helper failure.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Copying the embedded image failed.
    #[error("failed to materialise {} to {}", capsule.display(), dest.display())]
    Materialize {
        /// Outer capsule file.
        capsule: PathBuf,
        /// Destination being written.
        dest: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The materialised image does not match the outer capsule.
    #[error("verification of {} failed: {source}", dest.display())]
    Verify {
        /// Materialised file that failed verification.
        dest: PathBuf,
        /// Verifier's report.
        #[source]
        source: CollaboratorError,
    },

    /// Hard-linking into the active directory failed.
    #[error("failed to link {} into {}", dest.display(), active.display())]
    Link {
        /// Materialised file.
        dest: PathBuf,
        /// Intended active path.
        active: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Materialises every compressed handle in `handles`.
///
/// Each embedded image is copied to
/// `<decompression_dir>/<name>@<version>.capsule`, verified, and
/// hard-linked to `<active_dir>/<name>@<version>.capsule`. The returned
/// handles point at the active-dir paths. A failure affects only its own
/// capsule: the entry is logged and omitted, never aborting the batch.
pub fn process_compressed(
    verifier: &dyn ImageVerifier,
    handles: &[&CapsuleHandle],
    decompression_dir: &Path,
    active_dir: &Path,
) -> Vec<CapsuleHandle> {
    let mut materialized = Vec::new();
    for handle in handles {
        match process_one(verifier, handle, decompression_dir, active_dir) {
            Ok(active) => materialized.push(active),
            Err(err) => {
                warn!(capsule = %handle, error = %err, "skipping compressed capsule");
            }
        }
    }
    materialized
}

fn process_one(
    verifier: &dyn ImageVerifier,
    handle: &CapsuleHandle,
    decompression_dir: &Path,
    active_dir: &Path,
) -> Result<CapsuleHandle, DecompressError> {
    fsutil::ensure_dir(decompression_dir, 0o755)?;
    fsutil::ensure_dir(active_dir, 0o755)?;

    let file_name = format!("{}{}", handle.versioned_name(), CAPSULE_SUFFIX);
    let dest = decompression_dir.join(&file_name);
    let active = active_dir.join(&file_name);

    materialize(handle, &dest)?;

    if let Err(source) = verifier.verify(&dest, handle) {
        // A bad copy must not survive to be picked up by a later scan.
        let _ = std::fs::remove_file(&dest);
        return Err(DecompressError::Verify { dest, source });
    }

    link_into_active(&dest, &active)?;
    info!(capsule = %handle, active = %active.display(), "materialised compressed capsule");

    Ok(materialized_handle(handle, &active))
}

/// Copies the embedded image byte range out of the outer capsule.
fn materialize(handle: &CapsuleHandle, dest: &Path) -> Result<(), DecompressError> {
    let copy = || -> std::io::Result<()> {
        let mut outer = File::open(handle.path())?;
        outer.seek(SeekFrom::Start(handle.image_offset()))?;
        let mut reader = outer.take(handle.image_size());
        let mut out = File::create(dest)?;
        std::io::copy(&mut reader, &mut out)?;
        out.sync_all()
    };
    copy().map_err(|source| DecompressError::Materialize {
        capsule: handle.path().to_path_buf(),
        dest: dest.to_path_buf(),
        source,
    })
}

/// Hard-links `dest` to `active`, replacing a stale entry but leaving an
/// already-correct link alone.
fn link_into_active(dest: &Path, active: &Path) -> Result<(), DecompressError> {
    let link_err = |source| DecompressError::Link {
        dest: dest.to_path_buf(),
        active: active.to_path_buf(),
        source,
    };

    if active.exists() {
        if fsutil::inode_of(dest).ok() == fsutil::inode_of(active).ok() {
            return Ok(());
        }
        std::fs::remove_file(active).map_err(link_err)?;
    }
    std::fs::hard_link(dest, active).map_err(link_err)
}

/// The handle activation will use: same identity as the outer capsule, but
/// backed by the materialised file, which is the image itself.
fn materialized_handle(outer: &CapsuleHandle, active: &Path) -> CapsuleHandle {
    let size = std::fs::metadata(active).map(|m| m.len()).unwrap_or(outer.image_size());
    let mut builder = CapsuleHandle::builder(outer.name(), outer.version())
        .version_name(outer.version_name())
        .public_key(outer.public_key().to_vec())
        .path(active)
        .partition(outer.partition())
        .provides_shared_libs(outer.provides_shared_libs())
        .image(0, size);
    if let Some(digest) = outer.image_digest() {
        builder = builder.image_digest(digest.to_vec());
    }
    builder.build()
}

/// Whether the decompression slab should grow for an incoming compressed
/// capsule `name` at `new_version`: true iff the repository holds no
/// non-compressed copy of `name` at an equal or higher version.
#[must_use]
pub fn should_reserve_for(name: &str, new_version: u64, repo: &CapsuleRepository) -> bool {
    let blocks = |handle: &CapsuleHandle| {
        !handle.is_compressed() && handle.version() >= new_version
    };
    let blocked = repo.pre_installed(name).is_some_and(blocks)
        || repo.data(name).is_some_and(blocks);
    !blocked
}

/// Maintains a single reservation file of exactly `size` bytes in `dir`.
///
/// Size 0 deletes the file. Calls are idempotent; growing or shrinking
/// rewrites the same file.
///
/// # Errors
///
/// Returns [`DecompressError::NegativeReservation`] for negative sizes and
/// I/O errors otherwise.
pub fn reserve_slab(size: i64, dir: &Path) -> Result<(), DecompressError> {
    if size < 0 {
        return Err(DecompressError::NegativeReservation { size });
    }

    let slab = dir.join(RESERVED_SLAB_FILE);
    if size == 0 {
        match std::fs::remove_file(&slab) {
            Ok(()) => debug!(slab = %slab.display(), "reservation released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(FsError::Io {
                    context: "remove reservation file",
                    path: slab,
                    source,
                }
                .into());
            }
        }
        return Ok(());
    }

    fsutil::ensure_dir(dir, 0o755)?;
    let io_err = |context, source| FsError::Io {
        context,
        path: slab.clone(),
        source,
    };

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&slab)
        .map_err(|e| io_err("open reservation file", e))?;

    // Reserve real blocks where the filesystem supports it; fall back to a
    // plain truncate elsewhere.
    //
    // SAFETY: file owns a valid open descriptor; mode 0 extends the file
    // to the requested length.
    let rc = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t) };
    if rc != 0 {
        #[allow(clippy::cast_sign_loss)] // size < 0 rejected above
        file.set_len(size as u64)
            .map_err(|e| io_err("truncate reservation file", e))?;
    }

    debug!(slab = %slab.display(), size, "reservation updated");
    Ok(())
}

/// Deletes every file in `decompression_dir` that is not hard-linked to
/// the same-named file in `active_dir`.
///
/// Covers both orphan shapes: the active copy was removed (rollback), or
/// the active entry is a different inode under the same name (stale copy).
/// Failures are logged per file and never abort the sweep.
pub fn remove_unlinked(decompression_dir: &Path, active_dir: &Path) {
    let files = match fsutil::list_files(decompression_dir) {
        Ok(files) => files,
        Err(e) => {
            warn!(dir = %decompression_dir.display(), error = %e, "cannot scan decompression dir");
            return;
        }
    };

    for scratch in files {
        let Some(file_name) = scratch.file_name() else {
            continue;
        };
        let active = active_dir.join(file_name);

        let keep = active.exists()
            && fsutil::inode_of(&scratch).ok() == fsutil::inode_of(&active).ok();
        if keep {
            continue;
        }

        info!(file = %scratch.display(), "removing unlinked decompressed capsule");
        if let Err(e) = std::fs::remove_file(&scratch) {
            warn!(file = %scratch.display(), error = %e, "failed to remove orphan");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct AcceptAll;

    impl ImageVerifier for AcceptAll {
        fn verify(&self, _image: &Path, _expected: &CapsuleHandle) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    struct RejectAll;

    impl ImageVerifier for RejectAll {
        fn verify(&self, image: &Path, _expected: &CapsuleHandle) -> Result<(), CollaboratorError> {
            Err(CollaboratorError(format!("rejected {}", image.display())))
        }
    }

    /// A compressed capsule file: junk header, then the embedded image.
    fn compressed_fixture(dir: &Path, name: &str, version: u64, image: &[u8]) -> CapsuleHandle {
        let path = dir.join(format!("{name}.capsule"));
        let mut file = File::create(&path).unwrap();
        file.write_all(b"OUTERHDR").unwrap();
        file.write_all(image).unwrap();
        CapsuleHandle::builder(name, version)
            .path(&path)
            .compressed(8, image.len() as u64)
            .build()
    }

    #[test]
    fn materialises_embedded_range_and_hard_links() {
        let dir = tempfile::tempdir().unwrap();
        let decompression_dir = dir.path().join("scratch");
        let active_dir = dir.path().join("active");
        let handle = compressed_fixture(dir.path(), "pkg", 2, b"inner image bytes");

        let out = process_compressed(&AcceptAll, &[&handle], &decompression_dir, &active_dir);

        let scratch = decompression_dir.join("pkg@2.capsule");
        let active = active_dir.join("pkg@2.capsule");
        assert_eq!(std::fs::read(&scratch).unwrap(), b"inner image bytes");
        assert_eq!(
            fsutil::inode_of(&scratch).unwrap(),
            fsutil::inode_of(&active).unwrap()
        );

        // The returned handle points at the active copy, not the scratch
        // copy, and is no longer marked compressed.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path(), active);
        assert!(!out[0].is_compressed());
        assert_eq!(out[0].version(), 2);
        assert_eq!(out[0].image_size(), b"inner image bytes".len() as u64);
    }

    #[test]
    fn verification_failure_skips_entry_and_removes_copy() {
        let dir = tempfile::tempdir().unwrap();
        let decompression_dir = dir.path().join("scratch");
        let active_dir = dir.path().join("active");
        let handle = compressed_fixture(dir.path(), "pkg", 1, b"bytes");

        let out = process_compressed(&RejectAll, &[&handle], &decompression_dir, &active_dir);

        assert!(out.is_empty());
        assert!(!decompression_dir.join("pkg@1.capsule").exists());
        assert!(!active_dir.join("pkg@1.capsule").exists());
    }

    #[test]
    fn one_bad_entry_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let decompression_dir = dir.path().join("scratch");
        let active_dir = dir.path().join("active");
        let good = compressed_fixture(dir.path(), "good", 1, b"image");
        // Offset past end of file: materialisation yields a short copy, but
        // the verifier accepts everything, so use a missing file instead.
        let bad = CapsuleHandle::builder("bad", 1)
            .path(dir.path().join("missing.capsule"))
            .compressed(0, 16)
            .build();

        let out = process_compressed(&AcceptAll, &[&bad, &good], &decompression_dir, &active_dir);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "good");
    }

    #[test]
    fn rerun_reuses_the_existing_link() {
        let dir = tempfile::tempdir().unwrap();
        let decompression_dir = dir.path().join("scratch");
        let active_dir = dir.path().join("active");
        let handle = compressed_fixture(dir.path(), "pkg", 1, b"image");

        let first = process_compressed(&AcceptAll, &[&handle], &decompression_dir, &active_dir);
        let second = process_compressed(&AcceptAll, &[&handle], &decompression_dir, &active_dir);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(
            fsutil::inode_of(&decompression_dir.join("pkg@1.capsule")).unwrap(),
            fsutil::inode_of(&active_dir.join("pkg@1.capsule")).unwrap()
        );
    }

    mod reservation {
        use super::*;

        fn slab_files(dir: &Path) -> Vec<PathBuf> {
            fsutil::list_files(dir).unwrap()
        }

        #[test]
        fn creates_a_single_file_of_exact_size() {
            let dir = tempfile::tempdir().unwrap();
            reserve_slab(100, dir.path()).unwrap();

            let files = slab_files(dir.path());
            assert_eq!(files.len(), 1);
            assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 100);
        }

        #[test]
        fn repeated_calls_keep_a_single_file() {
            let dir = tempfile::tempdir().unwrap();
            reserve_slab(100, dir.path()).unwrap();
            reserve_slab(100, dir.path()).unwrap();

            let files = slab_files(dir.path());
            assert_eq!(files.len(), 1);
            assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 100);
        }

        #[test]
        fn grows_and_shrinks_in_place() {
            let dir = tempfile::tempdir().unwrap();
            reserve_slab(100, dir.path()).unwrap();

            reserve_slab(1000, dir.path()).unwrap();
            let files = slab_files(dir.path());
            assert_eq!(files.len(), 1);
            assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 1000);

            reserve_slab(10, dir.path()).unwrap();
            let files = slab_files(dir.path());
            assert_eq!(files.len(), 1);
            assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 10);
        }

        #[test]
        fn zero_releases_the_reservation() {
            let dir = tempfile::tempdir().unwrap();
            reserve_slab(100, dir.path()).unwrap();
            reserve_slab(0, dir.path()).unwrap();
            assert!(slab_files(dir.path()).is_empty());

            // Releasing an absent reservation is fine too.
            reserve_slab(0, dir.path()).unwrap();
        }

        #[test]
        fn negative_size_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            assert!(matches!(
                reserve_slab(-1, dir.path()),
                Err(DecompressError::NegativeReservation { size: -1 })
            ));
        }
    }

    mod reserve_policy {
        use super::*;
        use capsule_core::capsule::{CapsuleError, CapsuleSource};
        use std::collections::HashMap;

        struct TableSource {
            handles: HashMap<PathBuf, CapsuleHandle>,
        }

        impl CapsuleSource for TableSource {
            fn open(&self, path: &Path) -> Result<CapsuleHandle, CapsuleError> {
                self.handles.get(path).cloned().ok_or_else(|| CapsuleError::Malformed {
                    path: path.to_path_buf(),
                    reason: "not a fixture".to_string(),
                })
            }
        }

        /// (name, version, compressed, is_data) rows → repository.
        fn repo_from(dir: &Path, rows: &[(&str, u64, bool, bool)]) -> CapsuleRepository {
            let pre_dir = dir.join("pre");
            let data_dir = dir.join("data");
            std::fs::create_dir_all(&pre_dir).unwrap();
            std::fs::create_dir_all(&data_dir).unwrap();

            let mut handles = HashMap::new();
            for (name, version, compressed, is_data) in rows {
                let side = if *is_data { &data_dir } else { &pre_dir };
                let path = side.join(format!("{name}@{version}.capsule"));
                std::fs::write(&path, b"x").unwrap();
                let mut builder =
                    CapsuleHandle::builder(*name, *version).public_key([1u8; 4]).path(&path);
                if *compressed {
                    builder = builder.compressed(0, 1);
                }
                handles.insert(path, builder.build());
            }
            let source = TableSource { handles };
            let mut repo = CapsuleRepository::new();
            repo.add_pre_installed(&source, &[pre_dir]).unwrap();
            repo.add_data(&source, &data_dir).unwrap();
            repo
        }

        #[test]
        fn brand_new_name_reserves() {
            let dir = tempfile::tempdir().unwrap();
            let repo = repo_from(dir.path(), &[]);
            assert!(should_reserve_for("com.brand.new", 1, &repo));
        }

        #[test]
        fn equal_or_higher_noncompressed_version_blocks() {
            let dir = tempfile::tempdir().unwrap();
            let repo = repo_from(
                dir.path(),
                &[("pkg", 1, false, false), ("pkg", 2, false, true)],
            );

            assert!(should_reserve_for("pkg", 3, &repo));
            assert!(!should_reserve_for("pkg", 2, &repo));
            assert!(!should_reserve_for("pkg", 1, &repo));
        }

        #[test]
        fn compressed_copies_do_not_block() {
            let dir = tempfile::tempdir().unwrap();
            let repo = repo_from(dir.path(), &[("pkg", 5, true, false)]);

            // The only existing copy is itself compressed, so an incoming
            // compressed capsule always needs slab space.
            assert!(should_reserve_for("pkg", 1, &repo));
            assert!(should_reserve_for("pkg", 5, &repo));
        }
    }

    mod cleanup {
        use super::*;

        #[test]
        fn orphan_without_active_copy_is_deleted() {
            let dir = tempfile::tempdir().unwrap();
            let scratch_dir = dir.path().join("scratch");
            let active_dir = dir.path().join("active");
            std::fs::create_dir_all(&scratch_dir).unwrap();
            std::fs::create_dir_all(&active_dir).unwrap();
            std::fs::write(scratch_dir.join("pkg@1.capsule"), b"x").unwrap();

            remove_unlinked(&scratch_dir, &active_dir);
            assert!(!scratch_dir.join("pkg@1.capsule").exists());
        }

        #[test]
        fn same_name_but_separate_copy_is_deleted() {
            let dir = tempfile::tempdir().unwrap();
            let scratch_dir = dir.path().join("scratch");
            let active_dir = dir.path().join("active");
            std::fs::create_dir_all(&scratch_dir).unwrap();
            std::fs::create_dir_all(&active_dir).unwrap();
            std::fs::write(scratch_dir.join("pkg@1.capsule"), b"x").unwrap();
            std::fs::write(active_dir.join("pkg@1.capsule"), b"x").unwrap();

            remove_unlinked(&scratch_dir, &active_dir);
            assert!(!scratch_dir.join("pkg@1.capsule").exists());
            assert!(active_dir.join("pkg@1.capsule").exists());
        }

        #[test]
        fn hard_linked_copy_survives() {
            let dir = tempfile::tempdir().unwrap();
            let scratch_dir = dir.path().join("scratch");
            let active_dir = dir.path().join("active");
            std::fs::create_dir_all(&scratch_dir).unwrap();
            std::fs::create_dir_all(&active_dir).unwrap();
            std::fs::write(scratch_dir.join("pkg@1.capsule"), b"x").unwrap();
            std::fs::hard_link(
                scratch_dir.join("pkg@1.capsule"),
                active_dir.join("pkg@1.capsule"),
            )
            .unwrap();

            remove_unlinked(&scratch_dir, &active_dir);
            assert!(scratch_dir.join("pkg@1.capsule").exists());
        }

        #[test]
        fn link_under_a_different_name_does_not_protect() {
            let dir = tempfile::tempdir().unwrap();
            let scratch_dir = dir.path().join("scratch");
            let active_dir = dir.path().join("active");
            std::fs::create_dir_all(&scratch_dir).unwrap();
            std::fs::create_dir_all(&active_dir).unwrap();
            std::fs::write(scratch_dir.join("pkg@1.capsule"), b"x").unwrap();
            std::fs::hard_link(
                scratch_dir.join("pkg@1.capsule"),
                active_dir.join("renamed.capsule"),
            )
            .unwrap();

            remove_unlinked(&scratch_dir, &active_dir);
            assert!(!scratch_dir.join("pkg@1.capsule").exists());
        }
    }
}
