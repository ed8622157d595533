//! Output verification (pipeline stage 5, first half).
//!
//! Checks run in a fixed order and any failure deletes the temp output:
//! existence, strict shrinkage (plus the mode's minimum-reduction floor),
//! decodability, and a size-ratio sanity guard against encoder pathologies.
//! JPEG→JXL transcodes additionally reverse-decode and byte-compare against
//! the original stream - bit-exact or rejected, no middle ground.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::encoder::process::{run_tool, ProcessLimits};
use crate::errors::{PixlyError, Result};
use crate::features::{FileFeatures, MediaClass};
use crate::params::{ConversionParams, TargetFormat};
use crate::probe;

/// Reject outputs larger than this multiple of the source even before the
/// shrinkage check can see them.
pub const MAX_GROWTH_RATIO: f64 = 1.5;

/// Seal one temp output or delete it.
///
/// Returns the verification elapsed time on success. On any `Err` the temp
/// file is already gone.
pub fn verify_output(
    features: &FileFeatures,
    params: &ConversionParams,
    temp_output: &Path,
    min_reduction: f64,
    probe_timeout: Duration,
    cancel: &CancelToken,
) -> Result<Duration> {
    let started = Instant::now();
    match run_checks(features, params, temp_output, min_reduction, probe_timeout, cancel) {
        Ok(()) => Ok(started.elapsed()),
        Err(e) => {
            let _ = std::fs::remove_file(temp_output);
            Err(e)
        }
    }
}

fn run_checks(
    features: &FileFeatures,
    params: &ConversionParams,
    temp_output: &Path,
    min_reduction: f64,
    probe_timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let original_size = features.size_bytes;

    // 1. Existence and nonzero size.
    let new_size = std::fs::metadata(temp_output).map(|m| m.len()).unwrap_or(0);
    if new_size == 0 {
        return Err(PixlyError::VerificationRejected {
            reason: "output missing or empty".to_string(),
        });
    }

    // 2. Strict shrinkage, tightened by the minimum-reduction floor.
    let floor = (original_size as f64 * (1.0 - min_reduction)) as u64;
    if new_size >= original_size || new_size > floor {
        return Err(PixlyError::NoShrinkage {
            original_size,
            new_size,
        });
    }

    // 3. Decodability.
    match params.target {
        TargetFormat::Jxl => {
            verify_jxl_signature(temp_output)?;
            if params.lossless_jpeg_transcode {
                verify_jpeg_roundtrip(&features.path, temp_output, cancel)?;
            } else if which::which("jxlinfo").is_ok() {
                verify_with_jxlinfo(temp_output)?;
            }
        }
        TargetFormat::Avif => {
            let probed = probe::probe_media(temp_output, probe_timeout).map_err(|e| {
                PixlyError::VerificationRejected {
                    reason: format!("AVIF output not decodable: {}", e),
                }
            })?;
            if features.media_class == MediaClass::AnimatedImage && probed.frame_count < 2 {
                return Err(PixlyError::VerificationRejected {
                    reason: format!(
                        "animation collapsed to {} frame(s)",
                        probed.frame_count
                    ),
                });
            }
        }
        TargetFormat::Mov => {
            let probed = probe::probe_media(temp_output, probe_timeout).map_err(|e| {
                PixlyError::VerificationRejected {
                    reason: format!("MOV output not decodable: {}", e),
                }
            })?;
            // Stream copy must carry the codec through unchanged.
            if probed.video_codec != features.video_codec {
                return Err(PixlyError::VerificationRejected {
                    reason: format!(
                        "stream copy changed codec: {} -> {}",
                        features.video_codec, probed.video_codec
                    ),
                });
            }
            if features.duration_secs > 0.0
                && (probed.duration_secs - features.duration_secs).abs() > 1.0
            {
                return Err(PixlyError::VerificationRejected {
                    reason: format!(
                        "duration drifted: {:.2}s -> {:.2}s",
                        features.duration_secs, probed.duration_secs
                    ),
                });
            }
        }
    }

    // 4. Size-ratio sanity. Unreachable after the shrinkage check in the
    // normal flow, kept as an independent guard against future relaxations.
    if new_size as f64 > original_size as f64 * MAX_GROWTH_RATIO {
        return Err(PixlyError::VerificationRejected {
            reason: format!(
                "output {}x larger than source",
                new_size as f64 / original_size as f64
            ),
        });
    }

    Ok(())
}

/// JXL bare-codestream or container signature.
fn verify_jxl_signature(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut sig = [0u8; 12];
    let n = file.read(&mut sig)?;
    let ok = (n >= 2 && sig[0] == 0xFF && sig[1] == 0x0A)
        || (n >= 8 && sig[..8] == [0x00, 0x00, 0x00, 0x0C, 0x4A, 0x58, 0x4C, 0x20]);
    if ok {
        Ok(())
    } else {
        Err(PixlyError::VerificationRejected {
            reason: "invalid JXL signature".to_string(),
        })
    }
}

fn verify_with_jxlinfo(path: &Path) -> Result<()> {
    let output = std::process::Command::new("jxlinfo")
        .arg(path)
        .output()
        .map_err(PixlyError::Io)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(PixlyError::VerificationRejected {
            reason: format!(
                "jxlinfo rejected output: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Reverse-decode the JXL and require the reconstructed JPEG to be
/// byte-identical to the source. Without `djxl` the transcode cannot be
/// proven bit-exact and is rejected rather than trusted.
fn verify_jpeg_roundtrip(source: &Path, jxl_output: &Path, cancel: &CancelToken) -> Result<()> {
    if which::which("djxl").is_err() {
        return Err(PixlyError::VerificationRejected {
            reason: "djxl unavailable, cannot prove bit-exact transcode".to_string(),
        });
    }

    let recon = jxl_output.with_extension("recon.jpg");
    let mut cmd = std::process::Command::new("djxl");
    cmd.arg(jxl_output).arg(&recon);

    let limits = ProcessLimits {
        wall_clock: Duration::from_secs(120),
        stall_window: Duration::from_secs(30),
    };
    let result = run_tool("djxl", cmd, &recon, &limits, cancel);

    let verdict = match result {
        Ok(out) if out.status.success() => {
            if files_identical(source, &recon)? {
                Ok(())
            } else {
                Err(PixlyError::VerificationRejected {
                    reason: "reverse decode differs from source JPEG".to_string(),
                })
            }
        }
        Ok(out) => Err(PixlyError::VerificationRejected {
            reason: format!("djxl failed: {}", out.stderr_tail),
        }),
        Err(e) => Err(e),
    };

    let _ = std::fs::remove_file(&recon);
    verdict
}

/// Chunked byte comparison; no full-file reads for large sources.
pub fn files_identical(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = std::fs::metadata(a)?;
    let meta_b = std::fs::metadata(b)?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut reader_a = BufReader::new(File::open(a)?);
    let mut reader_b = BufReader::new(File::open(b)?);
    let mut buf_a = [0u8; 64 * 1024];
    let mut buf_b = [0u8; 64 * 1024];

    loop {
        let n = reader_a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        reader_b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::MediaFormat;
    use std::path::PathBuf;

    fn still_features(path: PathBuf, size: u64) -> FileFeatures {
        FileFeatures {
            path,
            size_bytes: size,
            format: MediaFormat::Png,
            media_class: MediaClass::StillImage,
            width: 100,
            height: 100,
            pixel_format: "rgb24".to_string(),
            has_alpha: false,
            frame_count: 1,
            duration_secs: 0.0,
            video_codec: "png".to_string(),
            has_audio: false,
            bytes_per_pixel: 0.1,
            icc_profile_present: false,
            exif_present: false,
            extension_mismatch: false,
        }
    }

    fn jxl_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0x0A];
        data.resize(len, 0x11);
        data
    }

    #[test]
    fn test_missing_output_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        let features = still_features(source, 1000);
        let r = verify_output(
            &features,
            &ConversionParams::jxl_lossless(7),
            &dir.path().join("missing.jxl"),
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(matches!(r, Err(PixlyError::VerificationRejected { .. })));
    }

    #[test]
    fn test_equal_size_is_no_shrinkage_and_deletes_temp() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        let temp = dir.path().join("a.out.jxl");
        std::fs::write(&temp, jxl_bytes(1000)).unwrap();

        let features = still_features(source, 1000);
        let r = verify_output(
            &features,
            &ConversionParams::jxl_lossless(7),
            &temp,
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(matches!(r, Err(PixlyError::NoShrinkage { .. })));
        assert!(!temp.exists(), "rejected temp must be deleted");
    }

    #[test]
    fn test_larger_output_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, vec![0u8; 500]).unwrap();
        let temp = dir.path().join("a.out.jxl");
        std::fs::write(&temp, jxl_bytes(800)).unwrap();

        let features = still_features(source, 500);
        let r = verify_output(
            &features,
            &ConversionParams::jxl_lossless(7),
            &temp,
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(matches!(r, Err(PixlyError::NoShrinkage { .. })));
        assert!(!temp.exists());
    }

    #[test]
    fn test_minimum_reduction_floor() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        // 5% smaller: passes strict shrinkage, fails a 7% floor.
        let temp = dir.path().join("a.out.jxl");
        std::fs::write(&temp, jxl_bytes(950)).unwrap();

        let features = still_features(source, 1000);
        let r = verify_output(
            &features,
            &ConversionParams::jxl_lossless(7),
            &temp,
            0.07,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(matches!(r, Err(PixlyError::NoShrinkage { .. })));
    }

    #[test]
    fn test_valid_jxl_passes_without_jxlinfo() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        let temp = dir.path().join("a.out.jxl");
        std::fs::write(&temp, jxl_bytes(400)).unwrap();

        let features = still_features(source, 1000);
        if which::which("jxlinfo").is_ok() {
            // A real jxlinfo would reject this synthetic stream; the
            // signature-only path is what this test covers.
            eprintln!("jxlinfo present, skipping signature-only test");
            return;
        }
        let r = verify_output(
            &features,
            &ConversionParams::jxl_lossless(7),
            &temp,
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(r.is_ok());
        assert!(temp.exists());
    }

    #[test]
    fn test_bad_jxl_signature_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, vec![0u8; 1000]).unwrap();
        let temp = dir.path().join("a.out.jxl");
        std::fs::write(&temp, vec![0x42u8; 400]).unwrap();

        let features = still_features(source, 1000);
        let r = verify_output(
            &features,
            &ConversionParams::jxl_lossless(7),
            &temp,
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        assert!(matches!(r, Err(PixlyError::VerificationRejected { .. })));
        assert!(!temp.exists());
    }

    #[test]
    fn test_files_identical() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");
        let d = dir.path().join("d.bin");
        std::fs::write(&a, vec![7u8; 100_000]).unwrap();
        std::fs::write(&b, vec![7u8; 100_000]).unwrap();
        let mut different = vec![7u8; 100_000];
        different[99_999] = 8;
        std::fs::write(&c, &different).unwrap();
        std::fs::write(&d, vec![7u8; 99_999]).unwrap();

        assert!(files_identical(&a, &b).unwrap());
        assert!(!files_identical(&a, &c).unwrap());
        assert!(!files_identical(&a, &d).unwrap());
    }

    #[test]
    fn test_max_growth_ratio_constant() {
        assert!((MAX_GROWTH_RATIO - 1.5).abs() < f64::EPSILON);
    }
}
