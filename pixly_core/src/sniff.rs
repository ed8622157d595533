//! Content-based format detection.
//!
//! Pure analysis layer - never trusts file extensions. The first bytes decide
//! the format; chunk scans decide animation (APNG `acTL`, GIF image
//! descriptors, WebP `ANMF`). 扩展名仅作参考，以 magic bytes 为准。

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Container formats the engine recognizes at the byte level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Heif,
    Bmp,
    Tiff,
    Mp4,
    Mov,
    Mkv,
    Avi,
    /// Already-modern outputs we never touch again.
    Jxl,
    Avif,
    Other,
}

impl MediaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFormat::Jpeg => "jpeg",
            MediaFormat::Png => "png",
            MediaFormat::Gif => "gif",
            MediaFormat::Webp => "webp",
            MediaFormat::Heif => "heif",
            MediaFormat::Bmp => "bmp",
            MediaFormat::Tiff => "tiff",
            MediaFormat::Mp4 => "mp4",
            MediaFormat::Mov => "mov",
            MediaFormat::Mkv => "mkv",
            MediaFormat::Avi => "avi",
            MediaFormat::Jxl => "jxl",
            MediaFormat::Avif => "avif",
            MediaFormat::Other => "other",
        }
    }

    pub fn is_video_container(&self) -> bool {
        matches!(
            self,
            MediaFormat::Mp4 | MediaFormat::Mov | MediaFormat::Mkv | MediaFormat::Avi
        )
    }

    /// Formats this engine already produces; re-runs skip them up front.
    pub fn is_modern_target(&self) -> bool {
        matches!(self, MediaFormat::Jxl | MediaFormat::Avif)
    }

    /// The extension the format would normally carry, for mismatch logging.
    pub fn canonical_extensions(&self) -> &'static [&'static str] {
        match self {
            MediaFormat::Jpeg => &["jpg", "jpeg", "jpe", "jfif"],
            MediaFormat::Png => &["png"],
            MediaFormat::Gif => &["gif"],
            MediaFormat::Webp => &["webp"],
            MediaFormat::Heif => &["heif", "heic"],
            MediaFormat::Bmp => &["bmp"],
            MediaFormat::Tiff => &["tiff", "tif"],
            MediaFormat::Mp4 => &["mp4", "m4v"],
            MediaFormat::Mov => &["mov", "qt"],
            MediaFormat::Mkv => &["mkv", "webm"],
            MediaFormat::Avi => &["avi"],
            MediaFormat::Jxl => &["jxl"],
            MediaFormat::Avif => &["avif"],
            MediaFormat::Other => &[],
        }
    }
}

/// Sniff the format from the first bytes of the file.
///
/// Reads at most 32 bytes. Files shorter than 12 bytes are `Other` (no known
/// container fits); callers treat unprobeable `Other` files as corrupted.
pub fn sniff_format(path: &Path) -> std::io::Result<MediaFormat> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 32];
    let n = file.read(&mut header)?;
    Ok(sniff_format_from_bytes(&header[..n]))
}

pub fn sniff_format_from_bytes(header: &[u8]) -> MediaFormat {
    if header.len() < 12 {
        return MediaFormat::Other;
    }

    if header.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return MediaFormat::Png;
    }
    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return MediaFormat::Jpeg;
    }
    if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        return MediaFormat::Gif;
    }
    if header.starts_with(b"RIFF") {
        if &header[8..12] == b"WEBP" {
            return MediaFormat::Webp;
        }
        if &header[8..12] == b"AVI " {
            return MediaFormat::Avi;
        }
    }

    // ISO-BMFF: size(4) + "ftyp" + major brand.
    if &header[4..8] == b"ftyp" {
        let brand = &header[8..12];
        if brand == b"avif" || brand == b"avis" {
            return MediaFormat::Avif;
        }
        if brand == b"heic" || brand == b"heix" || brand == b"heif" || brand == b"mif1" {
            return MediaFormat::Heif;
        }
        if brand == b"qt  " {
            return MediaFormat::Mov;
        }
        // isom / mp41 / mp42 / m4v and friends
        return MediaFormat::Mp4;
    }

    // JXL bare codestream or ISO-BMFF JXL container.
    if header.starts_with(&[0xFF, 0x0A]) {
        return MediaFormat::Jxl;
    }
    if header.starts_with(&[0x00, 0x00, 0x00, 0x0C, 0x4A, 0x58, 0x4C, 0x20]) {
        return MediaFormat::Jxl;
    }

    // Matroska / WebM share the EBML magic.
    if header.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return MediaFormat::Mkv;
    }

    if header.starts_with(&[0x49, 0x49, 0x2A, 0x00])
        || header.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
    {
        return MediaFormat::Tiff;
    }
    if header.starts_with(b"BM") {
        return MediaFormat::Bmp;
    }

    MediaFormat::Other
}

/// True when the sniffed format disagrees with the file's extension. Advisory
/// only; all decisions run off the sniffed format.
pub fn extension_mismatch(path: &Path, format: MediaFormat) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_lowercase(),
        None => return false,
    };
    let canonical = format.canonical_extensions();
    if canonical.is_empty() {
        return false;
    }
    !canonical.contains(&ext.as_str())
}

// ── PNG / APNG ────────────────────────────────────────────────────────────────

/// Scan PNG chunks for `acTL` (animation control). The chunk must appear
/// before `IDAT` per the APNG spec; scanning stops there.
pub fn png_is_animated(data: &[u8]) -> bool {
    if !data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return false;
    }
    let mut pos = 8usize;
    while pos + 8 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let chunk_type = &data[pos + 4..pos + 8];
        match chunk_type {
            b"acTL" => return true,
            b"IDAT" | b"IEND" => return false,
            _ => {}
        }
        // chunk = len(4) + type(4) + data(len) + crc(4)
        pos = match pos.checked_add(12 + len) {
            Some(p) => p,
            None => return false,
        };
    }
    false
}

/// APNG frame count from the `acTL` chunk's `num_frames` field, 1 for plain
/// PNG or a malformed animation chunk.
pub fn png_frame_count(data: &[u8]) -> u32 {
    if !data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return 1;
    }
    let mut pos = 8usize;
    while pos + 8 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let chunk_type = &data[pos + 4..pos + 8];
        if chunk_type == b"acTL" {
            if pos + 12 <= data.len() && len >= 4 {
                let n = u32::from_be_bytes([
                    data[pos + 8],
                    data[pos + 9],
                    data[pos + 10],
                    data[pos + 11],
                ]);
                return n.max(1);
            }
            return 1;
        }
        if chunk_type == b"IDAT" || chunk_type == b"IEND" {
            return 1;
        }
        pos = match pos.checked_add(12 + len) {
            Some(p) => p,
            None => return 1,
        };
    }
    1
}

/// True when the PNG carries an `iCCP` chunk (embedded ICC profile).
pub fn png_has_icc(data: &[u8]) -> bool {
    scan_png_chunk(data, b"iCCP")
}

/// True when the PNG carries an `eXIf` chunk.
pub fn png_has_exif(data: &[u8]) -> bool {
    scan_png_chunk(data, b"eXIf")
}

fn scan_png_chunk(data: &[u8], wanted: &[u8; 4]) -> bool {
    if !data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return false;
    }
    let mut pos = 8usize;
    while pos + 8 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let chunk_type = &data[pos + 4..pos + 8];
        if chunk_type == wanted {
            return true;
        }
        if chunk_type == b"IEND" {
            return false;
        }
        pos = match pos.checked_add(12 + len) {
            Some(p) => p,
            None => return false,
        };
    }
    false
}

// ── GIF ───────────────────────────────────────────────────────────────────────

/// Count image descriptors (0x2C) in a GIF stream, walking the block
/// structure so descriptor bytes inside pixel data are not miscounted.
pub fn gif_frame_count(data: &[u8]) -> u32 {
    if data.len() < 13 || &data[0..3] != b"GIF" {
        return 0;
    }

    // Header(6) + logical screen descriptor(7), then optional global color table.
    let packed = data[10];
    let has_gct = (packed & 0x80) != 0;
    let gct_size = if has_gct {
        3 * (1usize << ((packed & 0x07) + 1))
    } else {
        0
    };
    let mut pos = 13 + gct_size;

    let mut frames = 0u32;
    while pos < data.len() {
        match data[pos] {
            0x2C => {
                frames += 1;
                if pos + 10 > data.len() {
                    break;
                }
                let img_packed = data[pos + 9];
                let lct_size = if (img_packed & 0x80) != 0 {
                    3 * (1usize << ((img_packed & 0x07) + 1))
                } else {
                    0
                };
                pos += 10 + lct_size;
                if pos >= data.len() {
                    break;
                }
                pos += 1; // LZW minimum code size
                pos = skip_sub_blocks(data, pos);
            }
            0x21 => {
                // Extension: label byte then sub-blocks.
                if pos + 2 >= data.len() {
                    break;
                }
                pos += 2;
                pos = skip_sub_blocks(data, pos);
            }
            0x3B => break,
            _ => pos += 1,
        }
    }
    frames
}

fn skip_sub_blocks(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() {
        let block_size = data[pos] as usize;
        pos += 1;
        if block_size == 0 {
            break;
        }
        pos += block_size;
    }
    pos
}

// ── WebP ──────────────────────────────────────────────────────────────────────

pub fn webp_is_animated(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"ANIM")
}

pub fn webp_frame_count(data: &[u8]) -> u32 {
    let count = data.windows(4).filter(|w| *w == b"ANMF").count() as u32;
    count.max(1)
}

pub fn webp_has_alpha(data: &[u8]) -> bool {
    // VP8X flag byte (bit 4 = alpha) or a standalone ALPH chunk.
    if let Some(pos) = data.windows(4).position(|w| w == b"VP8X") {
        if let Some(&flags) = data.get(pos + 8) {
            if flags & 0x10 != 0 {
                return true;
            }
        }
    }
    data.windows(4).any(|w| w == b"ALPH")
}

pub fn webp_has_icc(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"ICCP")
}

pub fn webp_has_exif(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"EXIF")
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Arbitrary bytes must never panic the sniffer or the chunk scanners.
        #[test]
        fn prop_sniffer_total_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = sniff_format_from_bytes(&data);
            let _ = png_is_animated(&data);
            let _ = png_frame_count(&data);
            let _ = gif_frame_count(&data);
            let _ = webp_frame_count(&data);
            let _ = webp_has_alpha(&data);
        }

        /// Frame counts stay >= 1 for anything that parses as PNG/WebP.
        #[test]
        fn prop_frame_count_floor(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert!(png_frame_count(&data) >= 1);
            prop_assert!(webp_frame_count(&data) >= 1);
        }
    }
}
