//! ExifTool wrapper for embedded metadata.
//!
//! Copies the full tag set (EXIF, XMP, IPTC, GPS, ICC) from source to
//! destination in one exiftool invocation. Availability is checked once per
//! process; a missing exiftool degrades to a single warning, not per-file
//! spam.

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

static EXIFTOOL_AVAILABLE: OnceLock<bool> = OnceLock::new();
static MISSING_WARNED: OnceLock<()> = OnceLock::new();

pub fn is_exiftool_available() -> bool {
    *EXIFTOOL_AVAILABLE.get_or_init(|| which::which("exiftool").is_ok())
}

/// Copy embedded tag groups from `src` into `dst`.
///
/// No `-overwrite_original`: exiftool writes a `_original` backup which is
/// removed only after a successful exit, so a killed process cannot leave a
/// half-written destination.
pub fn copy_embedded_metadata(src: &Path, dst: &Path) -> io::Result<()> {
    if !is_exiftool_available() {
        MISSING_WARNED.get_or_init(|| {
            tracing::warn!("exiftool not found; embedded metadata will not be preserved");
            eprintln!("⚠️  exiftool not found - EXIF/XMP/ICC tags will NOT be carried over");
        });
        return Ok(());
    }

    let output = Command::new("exiftool")
        .arg("-tagsfromfile")
        .arg(src)
        .arg("-all:all")
        .arg("-ICC_Profile<ICC_Profile")
        .arg("-use")
        .arg("MWG")
        .arg("-api")
        .arg("LargeFileSupport=1")
        .arg("-q")
        .arg("-m")
        .arg(dst)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Minor warnings (-m) still exit 0; a nonzero exit is a real failure.
        return Err(io::Error::other(format!(
            "exiftool exit {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }

    // Drop the backup exiftool left next to dst.
    let mut backup_name = dst.file_name().unwrap_or_default().to_os_string();
    backup_name.push("_original");
    let backup = dst.with_file_name(backup_name);
    let _ = std::fs::remove_file(backup);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_exiftool_is_silent_noop() {
        // Regardless of whether exiftool exists, copying between two plain
        // files must not error out the migration layer.
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        std::fs::write(&src, b"a").unwrap();
        std::fs::write(&dst, b"b").unwrap();

        if !is_exiftool_available() {
            assert!(copy_embedded_metadata(&src, &dst).is_ok());
        }
    }

    #[test]
    fn test_backup_file_removed_after_copy() {
        if !is_exiftool_available() {
            eprintln!("exiftool not available, skipping test");
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.jpg");
        let dst = dir.path().join("dst.jpg");
        // Minimal JPEGs: SOI + EOI.
        std::fs::write(&src, [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        std::fs::write(&dst, [0xFF, 0xD8, 0xFF, 0xD9]).unwrap();

        let _ = copy_embedded_metadata(&src, &dst);
        assert!(!dir.path().join("dst.jpg_original").exists());
    }
}
