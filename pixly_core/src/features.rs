//! Feature extraction (pipeline stage 1).
//!
//! Combines the byte-level sniffer with an ffprobe pass and emits one
//! immutable [`FileFeatures`] record per candidate. A file that cannot be
//! probed at all is corrupted; that is fatal for the file, never for the run.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{PixlyError, Result};
use crate::probe::{self, pixel_format_has_alpha};
use crate::sniff::{self, MediaFormat};

/// How the predictor treats the file: one frame, many frames, or a real
/// video container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaClass {
    StillImage,
    AnimatedImage,
    Video,
    Unknown,
}

impl MediaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaClass::StillImage => "still_image",
            MediaClass::AnimatedImage => "animated_image",
            MediaClass::Video => "video",
            MediaClass::Unknown => "unknown",
        }
    }
}

/// Immutable probe summary for one candidate file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFeatures {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format: MediaFormat,
    pub media_class: MediaClass,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub has_alpha: bool,
    /// >= 1; > 1 means animated.
    pub frame_count: u64,
    pub duration_secs: f64,
    pub video_codec: String,
    pub has_audio: bool,
    pub bytes_per_pixel: f64,
    pub icc_profile_present: bool,
    pub exif_present: bool,
    /// Sniffed format disagreed with the extension (advisory, logged).
    pub extension_mismatch: bool,
}

/// Class from format + frame count. A one-frame GIF or WebP is a still
/// image; APNG and multi-frame HEIF are animated.
pub fn classify(format: MediaFormat, frame_count: u64) -> MediaClass {
    match format {
        MediaFormat::Jpeg | MediaFormat::Bmp | MediaFormat::Tiff => MediaClass::StillImage,
        MediaFormat::Png | MediaFormat::Gif | MediaFormat::Webp | MediaFormat::Heif => {
            if frame_count > 1 {
                MediaClass::AnimatedImage
            } else {
                MediaClass::StillImage
            }
        }
        MediaFormat::Mp4 | MediaFormat::Mov | MediaFormat::Mkv | MediaFormat::Avi => {
            MediaClass::Video
        }
        MediaFormat::Jxl | MediaFormat::Avif => MediaClass::StillImage,
        MediaFormat::Other => MediaClass::Unknown,
    }
}

/// Probe ceiling for a single file.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Chunk scans read the whole file; refuse anything absurd to bound memory.
const MAX_SCAN_BYTES: u64 = 512 * 1024 * 1024;

/// JPEG marker scans only need the header segment area.
const JPEG_SCAN_BYTES: usize = 256 * 1024;

pub fn extract_features(path: &Path, size_bytes: u64) -> Result<FileFeatures> {
    extract_features_with_timeout(path, size_bytes, DEFAULT_PROBE_TIMEOUT)
}

pub fn extract_features_with_timeout(
    path: &Path,
    size_bytes: u64,
    probe_timeout: Duration,
) -> Result<FileFeatures> {
    if size_bytes == 0 {
        return Err(PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: "zero-byte file".to_string(),
        });
    }

    let format = sniff::sniff_format(path)?;
    if format == MediaFormat::Other {
        return Err(PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: "unrecognized magic bytes".to_string(),
        });
    }

    let mismatch = sniff::extension_mismatch(path, format);
    if mismatch {
        tracing::info!(
            path = %path.display(),
            sniffed = format.as_str(),
            "Extension disagrees with content; trusting content"
        );
    }

    let probed = probe::probe_media(path, probe_timeout)?;

    // The container scan is the authority on animation for formats where
    // ffprobe reports a single stream frame (APNG) or none at all.
    let (frame_count, chunk_icc, chunk_exif) = scan_container(path, size_bytes, format)?;
    let frame_count = match format {
        MediaFormat::Png | MediaFormat::Gif | MediaFormat::Webp => frame_count,
        _ => probed.frame_count,
    }
    .max(1);

    let media_class = classify(format, frame_count);

    if media_class != MediaClass::Video && probed.width as u64 * probed.height as u64 == 0 {
        return Err(PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: "image with zero dimensions".to_string(),
        });
    }

    let pixel_total = (probed.width as u64)
        .saturating_mul(probed.height as u64)
        .saturating_mul(frame_count)
        .max(1);
    let bytes_per_pixel = size_bytes as f64 / pixel_total as f64;

    let has_alpha = pixel_format_has_alpha(&probed.pixel_format) || chunk_alpha(path, format);

    Ok(FileFeatures {
        path: path.to_path_buf(),
        size_bytes,
        format,
        media_class,
        width: probed.width,
        height: probed.height,
        pixel_format: probed.pixel_format,
        has_alpha,
        frame_count,
        duration_secs: probed.duration_secs,
        video_codec: probed.video_codec,
        has_audio: probed.has_audio,
        bytes_per_pixel,
        icc_profile_present: chunk_icc,
        exif_present: chunk_exif,
        extension_mismatch: mismatch,
    })
}

/// Byte-level container scan: frame count plus ICC/EXIF presence where the
/// container records them. Falls back to (1, false, false) for formats whose
/// metadata only ffprobe/exiftool can see.
fn scan_container(path: &Path, size_bytes: u64, format: MediaFormat) -> Result<(u64, bool, bool)> {
    match format {
        MediaFormat::Png | MediaFormat::Gif | MediaFormat::Webp => {
            if size_bytes > MAX_SCAN_BYTES {
                return Err(PixlyError::CorruptedInput {
                    path: path.to_path_buf(),
                    detail: format!("file exceeds {} byte scan limit", MAX_SCAN_BYTES),
                });
            }
            let data = std::fs::read(path)?;
            Ok(match format {
                MediaFormat::Png => (
                    sniff::png_frame_count(&data) as u64,
                    sniff::png_has_icc(&data),
                    sniff::png_has_exif(&data),
                ),
                MediaFormat::Gif => ((sniff::gif_frame_count(&data) as u64).max(1), false, false),
                _ => (
                    sniff::webp_frame_count(&data) as u64,
                    sniff::webp_has_icc(&data),
                    sniff::webp_has_exif(&data),
                ),
            })
        }
        MediaFormat::Jpeg => {
            let (icc, exif) = jpeg_marker_scan(path)?;
            Ok((1, icc, exif))
        }
        _ => Ok((1, false, false)),
    }
}

fn chunk_alpha(path: &Path, format: MediaFormat) -> bool {
    if format != MediaFormat::Webp {
        return false;
    }
    std::fs::read(path)
        .map(|d| sniff::webp_has_alpha(&d))
        .unwrap_or(false)
}

/// Light JPEG header walk for APP1 "Exif" and APP2 "ICC_PROFILE" segments.
fn jpeg_marker_scan(path: &Path) -> Result<(bool, bool)> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; JPEG_SCAN_BYTES];
    let n = file.read(&mut buf)?;
    buf.truncate(n);

    let mut icc = false;
    let mut exif = false;
    let mut pos = 2usize; // past SOI
    while pos + 4 <= buf.len() {
        if buf[pos] != 0xFF {
            break;
        }
        let marker = buf[pos + 1];
        // Standalone markers carry no length.
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            pos += 2;
            continue;
        }
        let seg_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        if seg_len < 2 {
            break;
        }
        let body = &buf[(pos + 4).min(buf.len())..(pos + 2 + seg_len).min(buf.len())];
        match marker {
            0xE1 if body.starts_with(b"Exif\0") => exif = true,
            0xE2 if body.starts_with(b"ICC_PROFILE\0") => icc = true,
            0xDA => break, // start of scan: headers are over
            _ => {}
        }
        pos += 2 + seg_len;
    }
    Ok((icc, exif))
}
