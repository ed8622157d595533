//! Directory scanner.
//!
//! Walks the target tree and yields candidates in a stable order. The
//! extension set is a cheap pre-filter only - the pipeline re-sniffs every
//! file by magic bytes and trusts the bytes, not the name.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Extensions worth feeding to the probe.
pub const CANDIDATE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "jpe", "jfif", "png", "gif", "webp", "heic", "heif", "bmp", "tiff", "tif",
    "mp4", "m4v", "mov", "mkv", "webm", "avi",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime: Option<SystemTime>,
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

pub fn has_candidate_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CANDIDATE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lazily walk `root`, depth-first, name-sorted for a stable emission order.
/// Unreadable entries are logged and skipped.
pub fn candidate_iter(root: &Path) -> impl Iterator<Item = Candidate> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e) || e.depth() == 0)
        .filter_map(|entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "Scanner could not read entry");
                    return None;
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let path = entry.path();
            if !has_candidate_extension(path) {
                return None;
            }
            let Ok(meta) = entry.metadata() else {
                tracing::warn!(path = %path.display(), "Scanner could not stat file");
                return None;
            };
            if meta.len() == 0 {
                tracing::debug!(path = %path.display(), "Skipping zero-byte file");
                return None;
            }
            Some(Candidate {
                path: path.to_path_buf(),
                size_bytes: meta.len(),
                mtime: meta.modified().ok(),
            })
        })
}

/// Eager form of [`candidate_iter`].
pub fn collect_candidates(root: &Path) -> Vec<Candidate> {
    candidate_iter(root).collect()
}
