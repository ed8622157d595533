//! Extended attribute migration.
//!
//! Copies every xattr from source to destination except quarantine and
//! sandbox provenance tags - carrying those onto a freshly produced file
//! would re-flag it for Gatekeeper on macOS.

use std::io;
use std::path::Path;

/// Tags that must not follow the file.
const EXCLUDED_XATTRS: &[&str] = &[
    "com.apple.quarantine",
    "com.apple.provenance",
    "com.apple.app-sandbox.read-write",
];

fn is_excluded(name: &str) -> bool {
    EXCLUDED_XATTRS.iter().any(|ex| name == *ex)
}

pub fn copy_xattrs(src: &Path, dst: &Path) -> io::Result<()> {
    let names = match xattr::list(src) {
        Ok(iter) => iter,
        // Filesystems without xattr support: nothing to carry.
        Err(_) => return Ok(()),
    };

    let mut last_err: Option<io::Error> = None;
    for name in names {
        let Some(name_str) = name.to_str() else {
            continue;
        };
        if is_excluded(name_str) {
            tracing::debug!(attr = name_str, "Skipping quarantine/sandbox xattr");
            continue;
        }
        match xattr::get(src, name_str) {
            Ok(Some(value)) => {
                if let Err(e) = xattr::set(dst, name_str, &value) {
                    tracing::warn!(attr = name_str, error = %e, "Failed to copy xattr");
                    last_err = Some(e);
                }
            }
            _ => continue,
        }
    }

    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_list() {
        assert!(is_excluded("com.apple.quarantine"));
        assert!(is_excluded("com.apple.provenance"));
        assert!(!is_excluded("user.comment"));
        assert!(!is_excluded("com.apple.metadata:_kMDItemUserTags"));
    }

    #[test]
    fn test_copy_xattrs_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, b"s").unwrap();
        std::fs::write(&dst, b"d").unwrap();

        // tmpfs and some CI filesystems refuse user xattrs; skip when so.
        if xattr::set(&src, "user.pixly_test", b"value").is_err() {
            eprintln!("filesystem lacks xattr support, skipping test");
            return;
        }

        copy_xattrs(&src, &dst).unwrap();
        let copied = xattr::get(&dst, "user.pixly_test").unwrap();
        assert_eq!(copied.as_deref(), Some(b"value".as_slice()));
    }

    #[test]
    fn test_copy_xattrs_without_any_attrs() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, b"s").unwrap();
        std::fs::write(&dst, b"d").unwrap();
        assert!(copy_xattrs(&src, &dst).is_ok());
    }
}
