//! Capsule source backed by sidecar descriptors.
//!
//! The daemon treats capsule parsing and signature verification as an
//! external service; on devices wired with this source, that service is
//! the build system, which drops a TOML descriptor next to every capsule
//! file (`<file>.meta`) at image-build or install time. The descriptor
//! carries the identity, flags, embedded-image geometry and verity table
//! that a native parser would read out of the signed container itself.
//!
//! Verity tables are cached by (name, version) as files are opened, so a
//! capsule materialised out of a compressed outer file (which has no
//! sidecar of its own) still resolves its table through the outer
//! capsule's descriptor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use capsule_core::capsule::{CapsuleError, CapsuleHandle, CapsuleSource, Partition};
use serde::Deserialize;

use crate::context::{CollaboratorError, VerityMetadataSource};
use crate::kernel::VerityTable;

/// Suffix of sidecar descriptor files.
pub const SIDECAR_SUFFIX: &str = ".meta";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SidecarFile {
    name: String,
    version: u64,
    version_name: Option<String>,
    /// Hex signing-key fingerprint.
    public_key: String,
    #[serde(default)]
    provides_shared_libs: bool,
    #[serde(default)]
    compressed: bool,
    #[serde(default)]
    image_offset: u64,
    /// Defaults to the rest of the file after `image_offset`.
    image_size: Option<u64>,
    /// Hex SHA-256 of the embedded image; required for compressed
    /// capsules.
    image_digest: Option<String>,
    verity: Option<VeritySection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VeritySection {
    data_block_size: u32,
    hash_block_size: u32,
    data_blocks: u64,
    hash_start_block: u64,
    algorithm: String,
    root_digest: String,
    salt: String,
}

impl From<VeritySection> for VerityTable {
    fn from(section: VeritySection) -> Self {
        Self {
            data_block_size: section.data_block_size,
            hash_block_size: section.hash_block_size,
            data_blocks: section.data_blocks,
            hash_start_block: section.hash_start_block,
            algorithm: section.algorithm,
            root_digest: section.root_digest,
            salt: section.salt,
        }
    }
}

/// Sidecar-backed capsule source and verity-metadata provider.
#[derive(Debug, Default)]
pub struct SidecarSource {
    verity_tables: Mutex<HashMap<(String, u64), VerityTable>>,
}

impl SidecarSource {
    /// A source with an empty verity cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn malformed(path: &Path, reason: impl Into<String>) -> CapsuleError {
        CapsuleError::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

impl CapsuleSource for SidecarSource {
    fn open(&self, path: &Path) -> Result<CapsuleHandle, CapsuleError> {
        let mut sidecar_path = path.as_os_str().to_os_string();
        sidecar_path.push(SIDECAR_SUFFIX);

        let text = std::fs::read_to_string(&sidecar_path).map_err(|source| CapsuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let sidecar: SidecarFile = toml::from_str(&text)
            .map_err(|e| Self::malformed(path, format!("bad sidecar: {e}")))?;

        let key = hex::decode(&sidecar.public_key)
            .map_err(|e| Self::malformed(path, format!("bad public key hex: {e}")))?;

        let file_len = std::fs::metadata(path)
            .map_err(|source| CapsuleError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if sidecar.image_offset > file_len {
            return Err(Self::malformed(path, "image offset past end of file"));
        }
        let image_size = sidecar.image_size.unwrap_or(file_len - sidecar.image_offset);

        let mut builder = CapsuleHandle::builder(&sidecar.name, sidecar.version)
            .path(path)
            .public_key(key)
            .partition(partition_for_path(path))
            .provides_shared_libs(sidecar.provides_shared_libs);
        if let Some(version_name) = &sidecar.version_name {
            builder = builder.version_name(version_name);
        }
        builder = if sidecar.compressed {
            builder.compressed(sidecar.image_offset, image_size)
        } else {
            builder.image(sidecar.image_offset, image_size)
        };
        if let Some(digest_hex) = &sidecar.image_digest {
            let digest = hex::decode(digest_hex)
                .map_err(|e| Self::malformed(path, format!("bad image digest hex: {e}")))?;
            builder = builder.image_digest(digest);
        } else if sidecar.compressed {
            return Err(Self::malformed(path, "compressed capsule without image digest"));
        }

        if let Some(section) = sidecar.verity {
            self.verity_tables
                .lock()
                .unwrap()
                .insert((sidecar.name.clone(), sidecar.version), section.into());
        }

        Ok(builder.build())
    }
}

impl VerityMetadataSource for SidecarSource {
    fn verity_table(&self, handle: &CapsuleHandle) -> Result<VerityTable, CollaboratorError> {
        self.verity_tables
            .lock()
            .unwrap()
            .get(&(handle.name().to_string(), handle.version()))
            .cloned()
            .ok_or_else(|| CollaboratorError(format!("no verity descriptor seen for {handle}")))
    }
}

/// Partition tag inferred from the capsule file's location.
fn partition_for_path(path: &Path) -> Partition {
    for component in path.components() {
        let Some(name) = component.as_os_str().to_str() else {
            continue;
        };
        match name {
            "system" => return Partition::System,
            "system_ext" => return Partition::SystemExt,
            "product" => return Partition::Product,
            "vendor" => return Partition::Vendor,
            "odm" => return Partition::Odm,
            _ => {}
        }
    }
    Partition::Unknown
}
