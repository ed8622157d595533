//! Metadata migration (pipeline stage 5, second half).
//!
//! 分层保留：embedded tags (ExifTool) → extended attributes → filesystem
//! timestamps，顺序固定。Timestamps are captured once at the top of the
//! pipeline and applied last, because both exiftool and the xattr pass touch
//! the destination (and exiftool may touch the source's mtime).
//!
//! Migration failure never aborts a verified transcode: the pixels are worth
//! more than the tags, and the caller logs the warning.

use std::path::Path;

mod exif;
mod xattrs;
pub mod timestamps;

pub use exif::copy_embedded_metadata;
pub use timestamps::SourceTimes;
pub use xattrs::copy_xattrs;

use crate::errors::{PixlyError, Result};

/// Copy everything externally observable from `src` to `dst`.
///
/// `times` must be the timestamps captured before any tool touched `src`.
/// Returns `Err(MetadataMigrationFailed)` when a layer failed; the
/// destination file is still valid for swap either way.
pub fn migrate_metadata(src: &Path, dst: &Path, times: &SourceTimes) -> Result<()> {
    let mut failures: Vec<String> = Vec::new();

    // 1. Embedded container metadata (EXIF/XMP/ICC/GPS).
    if let Err(e) = copy_embedded_metadata(src, dst) {
        failures.push(format!("embedded: {}", e));
    }

    // 2. Extended attributes, minus quarantine/sandbox tags.
    if let Err(e) = copy_xattrs(src, dst) {
        failures.push(format!("xattr: {}", e));
    }

    // 3. Timestamps last - the steps above rewrite dst and bump its mtime.
    if let Err(e) = times.apply(dst) {
        failures.push(format!("timestamps: {}", e));
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(PixlyError::MetadataMigrationFailed {
            detail: failures.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_plain_files_preserves_mtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.png");
        let dst = dir.path().join("dst.jxl");
        std::fs::write(&src, b"source bytes").unwrap();

        // Backdate the source so preservation is observable.
        let old = filetime::FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_times(&src, old, old).unwrap();

        let times = SourceTimes::capture(&src).unwrap();
        std::fs::write(&dst, b"converted").unwrap();

        // The payloads are not real media, so a present exiftool will reject
        // the embedded-copy layer; timestamps must be applied regardless.
        let result = migrate_metadata(&src, &dst, &times);
        if !crate::metadata::exif::is_exiftool_available() {
            assert!(result.is_ok(), "migration failed: {:?}", result);
        }

        let dst_meta = std::fs::metadata(&dst).unwrap();
        let dst_mtime = filetime::FileTime::from_last_modification_time(&dst_meta);
        assert_eq!(dst_mtime.unix_seconds(), 1_500_000_000);
    }
}
