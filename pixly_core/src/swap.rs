//! Atomic replacement (pipeline stage 6, first half).
//!
//! No crash or signal may leave a destroyed or half-written original. The
//! sealed scratch output is first copied next to its destination (same
//! filesystem, so the final rename is atomic), the copy is proven identical
//! by SHA-256, fsynced, and only then renamed into place. The source is
//! removed only after the rename succeeded, and only when the swap changed
//! the path. Every destructive step pushes its reverse onto an undo stack
//! that is drained best-effort on failure.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::errors::{PixlyError, Result};

/// Transient-I/O retries for the verified copy.
const COPY_RETRIES: u32 = 3;

/// Where the converted file must land.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Replace the source in its own directory, with the target extension.
    InPlace,
    /// Mirror the tree: `output_root` + the source's path relative to
    /// `input_root`, with the target extension.
    Mirror {
        input_root: PathBuf,
        output_root: PathBuf,
    },
}

/// Resolve the final output path for a source file.
pub fn resolve_final_path(
    source: &Path,
    target_extension: &str,
    destination: &Destination,
) -> Result<PathBuf> {
    match destination {
        Destination::InPlace => Ok(source.with_extension(target_extension)),
        Destination::Mirror {
            input_root,
            output_root,
        } => {
            let rel = source
                .strip_prefix(input_root)
                .map_err(|_| PixlyError::SwapFailed {
                    step: "resolve",
                    detail: format!(
                        "{} is not under input root {}",
                        source.display(),
                        input_root.display()
                    ),
                })?;
            Ok(output_root.join(rel).with_extension(target_extension))
        }
    }
}

enum UndoAction {
    DeleteFile(PathBuf),
}

impl UndoAction {
    fn run(self) {
        match self {
            UndoAction::DeleteFile(path) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    // Undo failures are logged, never escalated.
                    tracing::warn!(path = %path.display(), error = %e, "Undo step failed");
                }
            }
        }
    }
}

fn drain_undo(stack: Vec<UndoAction>) {
    for action in stack.into_iter().rev() {
        action.run();
    }
}

#[derive(Debug)]
pub struct SwapOutcome {
    pub final_path: PathBuf,
    pub source_removed: bool,
}

/// Execute the replace protocol. On success the verified output sits at the
/// final path and the scratch temp is gone; on failure the source is intact
/// and no partial file remains in its directory.
pub fn atomic_swap(
    source: &Path,
    sealed_temp: &Path,
    target_extension: &str,
    destination: &Destination,
    attempt_id: &str,
) -> Result<SwapOutcome> {
    let mut undo: Vec<UndoAction> = Vec::new();

    // Step 1: final path.
    let final_path = resolve_final_path(source, target_extension, destination)?;
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PixlyError::SwapFailed {
            step: "mkdir",
            detail: e.to_string(),
        })?;
    }

    // Step 2: staging name in the destination directory - same filesystem as
    // the final path, so the rename below cannot degrade to a copy.
    let staging_name = format!(
        "{}.tmp.{}",
        final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string()),
        attempt_id
    );
    let temp_in_place = final_path.with_file_name(staging_name);

    // Step 3: hash-verified copy with bounded retries.
    copy_verified(sealed_temp, &temp_in_place).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_in_place);
    })?;
    undo.push(UndoAction::DeleteFile(temp_in_place.clone()));

    // Step 4: the commit point. Overwrites any previous conversion output
    // left by a resumed run.
    if let Err(e) = std::fs::rename(&temp_in_place, &final_path) {
        drain_undo(undo);
        return Err(PixlyError::SwapFailed {
            step: "rename",
            detail: e.to_string(),
        });
    }
    // The staging file moved; from here the undo target is the final path.
    undo.clear();
    undo.push(UndoAction::DeleteFile(final_path.clone()));

    // Step 5: remove the source, only after the rename, only when the swap
    // did not already replace it (extension changed or mirror mode kept it).
    let replaces_source = final_path == source;
    let mut source_removed = replaces_source;
    if !replaces_source && matches!(destination, Destination::InPlace) {
        if let Err(e) = std::fs::remove_file(source) {
            drain_undo(undo);
            return Err(PixlyError::SwapFailed {
                step: "remove_source",
                detail: e.to_string(),
            });
        }
        source_removed = true;
    }

    // Step 6: the scratch temp has served its purpose.
    let _ = std::fs::remove_file(sealed_temp);

    tracing::info!(
        source = %source.display(),
        output = %final_path.display(),
        "Swap committed"
    );
    Ok(SwapOutcome {
        final_path,
        source_removed,
    })
}

/// Copy `from` to `to` and require equal SHA-256 digests, retrying transient
/// failures.
fn copy_verified(from: &Path, to: &Path) -> Result<()> {
    let mut last_detail = String::new();
    for attempt in 1..=COPY_RETRIES {
        match try_copy_verified(from, to) {
            Ok(()) => return Ok(()),
            Err(detail) => {
                tracing::warn!(
                    from = %from.display(),
                    to = %to.display(),
                    attempt,
                    detail = %detail,
                    "Verified copy failed"
                );
                last_detail = detail;
            }
        }
    }
    Err(PixlyError::SwapFailed {
        step: "copy",
        detail: format!("{} attempts failed: {}", COPY_RETRIES, last_detail),
    })
}

fn try_copy_verified(from: &Path, to: &Path) -> std::result::Result<(), String> {
    std::fs::copy(from, to).map_err(|e| format!("copy: {}", e))?;

    let digest_from = sha256_file(from).map_err(|e| format!("hash source: {}", e))?;
    let digest_to = sha256_file(to).map_err(|e| format!("hash copy: {}", e))?;
    if digest_from != digest_to {
        return Err("content hash mismatch after copy".to_string());
    }

    // Make the bytes durable before the rename commits them.
    std::fs::File::open(to)
        .and_then(|f| f.sync_all())
        .map_err(|e| format!("fsync: {}", e))?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
