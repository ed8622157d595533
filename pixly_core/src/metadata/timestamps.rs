//! Filesystem timestamp capture and restore.
//!
//! Timestamps are captured ONCE, before any conversion work, because running
//! exiftool against the source can rewrite its mtime. atime/mtime restore via
//! `filetime`; creation time restores through the platform setter where one
//! exists (macOS `setattrlist`). Linux exposes no birthtime setter, so btime
//! is carried only where the OS allows.

use filetime::FileTime;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Snapshot of a source file's externally visible times.
#[derive(Debug, Clone, Copy)]
pub struct SourceTimes {
    pub atime: FileTime,
    pub mtime: FileTime,
    pub birthtime: Option<SystemTime>,
}

impl SourceTimes {
    pub fn capture(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            atime: FileTime::from_last_access_time(&meta),
            mtime: FileTime::from_last_modification_time(&meta),
            birthtime: meta.created().ok(),
        })
    }

    /// Apply the snapshot to `dst`. Creation time first where settable -
    /// macOS clamps mtime up to creation time, so the order matters.
    pub fn apply(&self, dst: &Path) -> io::Result<()> {
        #[cfg(target_os = "macos")]
        if let Some(birth) = self.birthtime {
            if let Err(e) = macos::set_creation_time(dst, birth) {
                tracing::warn!(path = %dst.display(), error = %e, "Failed to set creation time");
            }
        }

        filetime::set_file_times(dst, self.atime, self.mtime)
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[repr(C)]
    struct AttrList {
        bitmapcount: libc::c_ushort,
        reserved: u16,
        commonattr: u32,
        volattr: u32,
        dirattr: u32,
        fileattr: u32,
        forkattr: u32,
    }

    const ATTR_BIT_MAP_COUNT: libc::c_ushort = 5;
    const ATTR_CMN_CRTIME: u32 = 0x0000_0200;

    /// Set the HFS+/APFS creation time via setattrlist(2).
    pub fn set_creation_time(path: &Path, t: SystemTime) -> io::Result<()> {
        let since_epoch = t
            .duration_since(UNIX_EPOCH)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pre-epoch birthtime"))?;
        let ts = libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
        };
        let attr = AttrList {
            bitmapcount: ATTR_BIT_MAP_COUNT,
            reserved: 0,
            commonattr: ATTR_CMN_CRTIME,
            volattr: 0,
            dirattr: 0,
            fileattr: 0,
            forkattr: 0,
        };

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let rc = unsafe {
            libc::setattrlist(
                c_path.as_ptr(),
                &attr as *const AttrList as *mut libc::c_void,
                &ts as *const libc::timespec as *mut libc::c_void,
                std::mem::size_of::<libc::timespec>(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_apply_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, b"source").unwrap();

        let atime = FileTime::from_unix_time(1_400_000_000, 0);
        let mtime = FileTime::from_unix_time(1_450_000_000, 0);
        filetime::set_file_times(&src, atime, mtime).unwrap();

        let times = SourceTimes::capture(&src).unwrap();
        assert_eq!(times.mtime.unix_seconds(), 1_450_000_000);

        std::fs::write(&dst, b"converted").unwrap();
        times.apply(&dst).unwrap();

        let meta = std::fs::metadata(&dst).unwrap();
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_450_000_000
        );
        assert_eq!(
            FileTime::from_last_access_time(&meta).unix_seconds(),
            1_400_000_000
        );
    }

    #[test]
    fn test_capture_survives_source_mutation() {
        // The snapshot must hold the ORIGINAL times even after the source is
        // rewritten (exiftool does exactly that).
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"v1").unwrap();
        let old = FileTime::from_unix_time(1_300_000_000, 0);
        filetime::set_file_times(&src, old, old).unwrap();

        let times = SourceTimes::capture(&src).unwrap();
        std::fs::write(&src, b"v2 mutated").unwrap();

        assert_eq!(times.mtime.unix_seconds(), 1_300_000_000);
    }

    #[test]
    fn test_capture_missing_file_errors() {
        assert!(SourceTimes::capture(Path::new("/nonexistent/x.bin")).is_err());
    }
}
