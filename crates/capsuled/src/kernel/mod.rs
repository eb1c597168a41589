//! Kernel interfaces behind trait seams.
//!
//! Loop devices, device-mapper verity targets and mounts all live in
//! namespaces shared with the rest of the OS, and all of them require
//! privilege. The driver only ever talks to the three traits here; the
//! real implementations live in [`linux`], and tests swap in the in-memory
//! fakes so the whole activation path runs unprivileged.

pub mod linux;

#[cfg(test)]
pub mod fake;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Errors from kernel-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// No free loop device could be obtained.
    #[error("loop device pool exhausted")]
    LoopExhausted {
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Configuring a loop device failed.
    #[error("loop setup failed for {}: {context}", image.display())]
    Loop {
        /// Image being attached.
        image: PathBuf,
        /// What was being attempted.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Building or removing a verity device failed.
    #[error("verity device {name}: {context}")]
    Verity {
        /// Device-mapper name.
        name: String,
        /// What was being attempted.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A mount or unmount failed.
    #[error("mount operation on {} failed: {context}", target.display())]
    Mount {
        /// Mount point.
        target: PathBuf,
        /// What was being attempted.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The embedded image carries no recognisable filesystem superblock.
    #[error("unrecognised filesystem image in {}", image.display())]
    UnknownFilesystem {
        /// Image that could not be identified.
        image: PathBuf,
    },
}

/// dm-verity table parameters read from a capsule's signed metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    /// Data block size in bytes.
    pub data_block_size: u32,
    /// Hash block size in bytes.
    pub hash_block_size: u32,
    /// Number of data blocks covered by the tree.
    pub data_blocks: u64,
    /// Block index where the hash tree starts on the hash device.
    pub hash_start_block: u64,
    /// Hash algorithm name, e.g. `sha256`.
    pub algorithm: String,
    /// Hex-encoded root digest.
    pub root_digest: String,
    /// Hex-encoded salt.
    pub salt: String,
}

/// Attaches and detaches loop devices.
pub trait LoopBackend {
    /// Attaches a read-only loop device backed by `image` starting at
    /// `offset` for `size_limit` bytes, returning the device path.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when no device is free or configuration
    /// fails.
    fn attach(&self, image: &Path, offset: u64, size_limit: u64) -> Result<PathBuf, KernelError>;

    /// Detaches the loop device at `device`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when the detach ioctl fails.
    fn detach(&self, device: &Path) -> Result<(), KernelError>;
}

/// Creates and removes dm-verity devices.
pub trait VerityBackend {
    /// Builds a verity target named `name` over `data_device`, returning
    /// the path of the mapped device.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when any device-mapper step fails.
    fn create(
        &self,
        name: &str,
        data_device: &Path,
        table: &VerityTable,
    ) -> Result<PathBuf, KernelError>;

    /// Removes the verity device named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when removal fails.
    fn remove(&self, name: &str) -> Result<(), KernelError>;
}

/// Mounts and unmounts block devices.
pub trait MountBackend {
    /// Read-only mounts `device` at `target` with filesystem `fstype`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when the mount syscall fails.
    fn mount(&self, device: &Path, target: &Path, fstype: &str) -> Result<(), KernelError>;

    /// Unmounts whatever is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when the unmount syscall fails.
    fn unmount(&self, target: &Path) -> Result<(), KernelError>;
}

const EXT4_MAGIC_OFFSET: u64 = 0x438;
const EXT4_MAGIC: u16 = 0xEF53;
const F2FS_MAGIC_OFFSET: u64 = 0x400;
const F2FS_MAGIC: u32 = 0xF2F5_2010;
const EROFS_MAGIC_OFFSET: u64 = 0x400;
const EROFS_MAGIC: u32 = 0xE0F5_E1E2;

// The single 4-byte read in detect_fstype relies on this.
const _: () = assert!(EROFS_MAGIC_OFFSET == F2FS_MAGIC_OFFSET);

/// Identifies the filesystem of the image embedded in `image` at
/// `image_offset` by its superblock magic.
///
/// # Errors
///
/// Returns [`KernelError::UnknownFilesystem`] for unrecognised images and
/// [`KernelError::Loop`] (read context) for I/O failures.
pub fn detect_fstype(image: &Path, image_offset: u64) -> Result<&'static str, KernelError> {
    let io_err = |context, source| KernelError::Loop {
        image: image.to_path_buf(),
        context,
        source,
    };

    let mut file = File::open(image).map_err(|e| io_err("open image for probing", e))?;

    // f2fs and erofs share the superblock offset; one read answers both.
    let mut word = [0u8; 4];
    file.seek(SeekFrom::Start(image_offset + F2FS_MAGIC_OFFSET))
        .map_err(|e| io_err("seek to superblock", e))?;
    if file.read_exact(&mut word).is_ok() {
        match u32::from_le_bytes(word) {
            F2FS_MAGIC => return Ok("f2fs"),
            EROFS_MAGIC => return Ok("erofs"),
            _ => {}
        }
    }

    let mut half = [0u8; 2];
    file.seek(SeekFrom::Start(image_offset + EXT4_MAGIC_OFFSET))
        .map_err(|e| io_err("seek to superblock", e))?;
    if file.read_exact(&mut half).is_ok() && u16::from_le_bytes(half) == EXT4_MAGIC {
        return Ok("ext4");
    }

    Err(KernelError::UnknownFilesystem {
        image: image.to_path_buf(),
    })
}

/// Device-mapper name for one activation attempt:
/// `<name>@<version>.<suffix>`.
///
/// The suffix keeps OTA-chroot devices (`chroot`) from colliding with the
/// live daemon's devices of the same base name.
#[must_use]
pub fn verity_device_name(versioned_name: &str, suffix: &str) -> String {
    format!("{versioned_name}.{suffix}")
}
