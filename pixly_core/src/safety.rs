//! Safety checks.
//!
//! An in-place batch rewriter pointed at the wrong directory is a disaster;
//! refuse system roots and bare home directories loudly, before any file is
//! touched.

use std::path::Path;

const DANGEROUS_DIRS: &[&str] = &[
    "/",
    "/System",
    "/usr",
    "/bin",
    "/sbin",
    "/etc",
    "/var",
    "/private",
    "/Library",
    "/Applications",
    "/Users",
    "/home",
    "/root",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/tmp",
    "/opt",
];

pub fn check_dangerous_directory(path: &Path) -> Result<(), String> {
    let path_str = path.to_string_lossy();

    for dangerous in DANGEROUS_DIRS {
        if path_str == *dangerous {
            return Err(format!(
                "🚨 DANGEROUS OPERATION BLOCKED!\n\
                 ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
                 ❌ Target '{}' is a protected system directory.\n\
                 ❌ Rewriting media in place here could damage your system.\n\
                 \n\
                 💡 Point pixly at a media subdirectory instead.\n\
                 ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━",
                dangerous
            ));
        }
    }

    // A bare home directory (/Users/x, /home/x) is one `*` away from every
    // personal file.
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let canonical_str = canonical.to_string_lossy();
    if (canonical_str.starts_with("/Users/") || canonical_str.starts_with("/home/"))
        && canonical.components().count() <= 3
    {
        return Err(format!(
            "🚨 DANGEROUS OPERATION BLOCKED!\n\
             ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
             ❌ Target '{}' is a home directory root.\n\
             ❌ An in-place run here would chew through ALL your files.\n\
             \n\
             💡 Use a subdirectory like ~/Pictures/export instead.\n\
             ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━",
            path.display()
        ));
    }

    Ok(())
}
