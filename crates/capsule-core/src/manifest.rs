//! Activation manifest published for the rest of the OS.
//!
//! After activation the daemon writes `capsule-info-list.xml` under the
//! capsule root, listing every known capsule and whether it is the factory
//! copy and/or currently mounted. External readers (installers, update
//! engines, debugging tools) treat this file as the authoritative record of
//! what was activated.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name of the activation manifest under the capsule root.
pub const MANIFEST_FILE_NAME: &str = "capsule-info-list.xml";

/// One manifest entry: a capsule file the daemon knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleInfo {
    /// Package name.
    pub module_name: String,
    /// Path of this capsule file.
    pub module_path: PathBuf,
    /// Path of the pre-installed copy of the same package, when one
    /// exists.
    pub preinstalled_module_path: Option<PathBuf>,
    /// Version code.
    pub version_code: i64,
    /// Human-readable version string.
    pub version_name: String,
    /// True iff this entry is the pre-installed copy.
    pub is_factory: bool,
    /// True iff this file is currently mounted.
    pub is_active: bool,
}

/// Writes the manifest for `entries` to `out`.
///
/// # Errors
///
/// Propagates I/O errors from `out`.
pub fn write_manifest<W: Write>(out: &mut W, entries: &[CapsuleInfo]) -> io::Result<()> {
    writeln!(out, r#"<?xml version="1.0" encoding="utf-8"?>"#)?;
    writeln!(out, "<capsule-info-list>")?;
    for info in entries {
        write!(
            out,
            r#"  <capsule-info moduleName="{}" modulePath="{}""#,
            escape(&info.module_name),
            escape_path(&info.module_path),
        )?;
        if let Some(pre) = &info.preinstalled_module_path {
            write!(out, r#" preinstalledModulePath="{}""#, escape_path(pre))?;
        }
        writeln!(
            out,
            r#" versionCode="{}" versionName="{}" isFactory="{}" isActive="{}"/>"#,
            info.version_code,
            escape(&info.version_name),
            info.is_factory,
            info.is_active,
        )?;
    }
    writeln!(out, "</capsule-info-list>")?;
    Ok(())
}

fn escape_path(path: &Path) -> String {
    escape(&path.display().to_string())
}

/// XML attribute-value escaping.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
