//! Conversion parameter records.
//!
//! A [`ConversionParams`] value is immutable once emitted by the predictor or
//! the exploration engine; the encoder driver dispatches on `target` and reads
//! only the knobs that are meaningful for that target. The set of targets is
//! closed: JXL for stills, AVIF for animations, stream-copied MOV for video.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetFormat {
    Jxl,
    Avif,
    Mov,
}

impl TargetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Jxl => "jxl",
            TargetFormat::Avif => "avif",
            TargetFormat::Mov => "mov",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::Jxl => "JXL",
            TargetFormat::Avif => "AVIF",
            TargetFormat::Mov => "MOV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodeMode {
    /// Container-level rewrite, decoded bytes untouched (JPEG→JXL transcode,
    /// video stream copy).
    LosslessRepackage,
    /// Pixel-exact compression (JXL distance 0).
    LosslessMath,
    Lossy,
}

impl EncodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodeMode::LosslessRepackage => "lossless_repackage",
            EncodeMode::LosslessMath => "lossless_math",
            EncodeMode::Lossy => "lossy",
        }
    }
}

/// Parameter tuple handed to the encoder driver.
///
/// Only the knobs relevant for `target` are populated; [`validate`] enforces
/// the per-target minimums before any process is spawned.
///
/// [`validate`]: ConversionParams::validate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionParams {
    pub target: TargetFormat,
    pub mode: EncodeMode,

    /// JXL perceptual distance; 0.0 = mathematically lossless.
    pub distance: Option<f64>,
    /// JXL encoder effort, 1-9.
    pub effort: Option<u8>,
    /// Bit-exact JPEG→JXL bitstream repackage.
    pub lossless_jpeg_transcode: bool,

    /// AVIF/AV1 constant rate factor, 0-63.
    pub crf: Option<u8>,
    /// AVIF/AV1 encoder speed preset, 0-10.
    pub speed: Option<u8>,

    /// MOV: copy streams without re-encoding. Always true for Mov; this
    /// engine never re-encodes video.
    pub copy_streams: bool,
}

impl ConversionParams {
    pub fn jxl_lossless_transcode(effort: u8) -> Self {
        Self {
            target: TargetFormat::Jxl,
            mode: EncodeMode::LosslessRepackage,
            distance: Some(0.0),
            effort: Some(effort),
            lossless_jpeg_transcode: true,
            crf: None,
            speed: None,
            copy_streams: false,
        }
    }

    pub fn jxl_lossless(effort: u8) -> Self {
        Self {
            target: TargetFormat::Jxl,
            mode: EncodeMode::LosslessMath,
            distance: Some(0.0),
            effort: Some(effort),
            lossless_jpeg_transcode: false,
            crf: None,
            speed: None,
            copy_streams: false,
        }
    }

    pub fn jxl_lossy(distance: f64, effort: u8) -> Self {
        Self {
            target: TargetFormat::Jxl,
            mode: if distance == 0.0 {
                EncodeMode::LosslessMath
            } else {
                EncodeMode::Lossy
            },
            distance: Some(distance),
            effort: Some(effort),
            lossless_jpeg_transcode: false,
            crf: None,
            speed: None,
            copy_streams: false,
        }
    }

    pub fn avif(crf: u8, speed: u8) -> Self {
        Self {
            target: TargetFormat::Avif,
            mode: EncodeMode::Lossy,
            distance: None,
            effort: None,
            lossless_jpeg_transcode: false,
            crf: Some(crf),
            speed: Some(speed),
            copy_streams: false,
        }
    }

    pub fn mov_stream_copy() -> Self {
        Self {
            target: TargetFormat::Mov,
            mode: EncodeMode::LosslessRepackage,
            distance: None,
            effort: None,
            lossless_jpeg_transcode: false,
            crf: None,
            speed: None,
            copy_streams: true,
        }
    }

    /// Enforce the per-target invariants.
    ///
    /// jxl ⇒ at least one of {distance, effort, transcode}; avif ⇒ crf and
    /// speed present and in range; mov ⇒ copy_streams set.
    pub fn validate(&self) -> Result<(), String> {
        match self.target {
            TargetFormat::Jxl => {
                if self.distance.is_none() && self.effort.is_none() && !self.lossless_jpeg_transcode
                {
                    return Err("JXL params need distance, effort, or transcode".to_string());
                }
                if let Some(d) = self.distance {
                    if !(0.0..=25.0).contains(&d) {
                        return Err(format!("JXL distance {} out of range [0, 25]", d));
                    }
                }
                if let Some(e) = self.effort {
                    if !(1..=9).contains(&e) {
                        return Err(format!("JXL effort {} out of range [1, 9]", e));
                    }
                }
            }
            TargetFormat::Avif => {
                let crf = self
                    .crf
                    .ok_or_else(|| "AVIF params need crf".to_string())?;
                if crf > 63 {
                    return Err(format!("AVIF crf {} out of range [0, 63]", crf));
                }
                let speed = self
                    .speed
                    .ok_or_else(|| "AVIF params need speed".to_string())?;
                if speed > 10 {
                    return Err(format!("AVIF speed {} out of range [0, 10]", speed));
                }
            }
            TargetFormat::Mov => {
                if !self.copy_streams {
                    return Err("MOV target requires copy_streams (no re-encode path)".to_string());
                }
            }
        }
        Ok(())
    }

    /// Short human tag for logs and the learning store, e.g. `jxl.d0.e7`,
    /// `jxl.transcode.e7`, `avif.crf35.s6`, `mov.copy`.
    pub fn method_tag(&self) -> String {
        match self.target {
            TargetFormat::Jxl => {
                if self.lossless_jpeg_transcode {
                    format!("jxl.transcode.e{}", self.effort.unwrap_or(7))
                } else {
                    format!(
                        "jxl.d{}.e{}",
                        self.distance.unwrap_or(0.0),
                        self.effort.unwrap_or(7)
                    )
                }
            }
            TargetFormat::Avif => format!(
                "avif.crf{}.s{}",
                self.crf.unwrap_or(0),
                self.speed.unwrap_or(6)
            ),
            TargetFormat::Mov => "mov.copy".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_validate() {
        assert!(ConversionParams::jxl_lossless(7).validate().is_ok());
        assert!(ConversionParams::jxl_lossless_transcode(7).validate().is_ok());
        assert!(ConversionParams::jxl_lossy(1.0, 7).validate().is_ok());
        assert!(ConversionParams::avif(35, 6).validate().is_ok());
        assert!(ConversionParams::mov_stream_copy().validate().is_ok());
    }

    #[test]
    fn test_avif_requires_crf_and_speed() {
        let mut p = ConversionParams::avif(35, 6);
        p.crf = None;
        assert!(p.validate().is_err());

        let mut p = ConversionParams::avif(35, 6);
        p.speed = None;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_mov_requires_stream_copy() {
        let mut p = ConversionParams::mov_stream_copy();
        p.copy_streams = false;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(ConversionParams::avif(64, 6).validate().is_err());
        assert!(ConversionParams::avif(35, 11).validate().is_err());
        assert!(ConversionParams::jxl_lossy(-1.0, 7).validate().is_err());
        assert!(ConversionParams::jxl_lossless(10).validate().is_err());
    }

    #[test]
    fn test_distance_zero_is_lossless_math() {
        assert_eq!(
            ConversionParams::jxl_lossy(0.0, 7).mode,
            EncodeMode::LosslessMath
        );
        assert_eq!(ConversionParams::jxl_lossy(1.0, 7).mode, EncodeMode::Lossy);
    }

    #[test]
    fn test_method_tags() {
        assert_eq!(ConversionParams::mov_stream_copy().method_tag(), "mov.copy");
        assert_eq!(ConversionParams::avif(35, 6).method_tag(), "avif.crf35.s6");
        assert_eq!(
            ConversionParams::jxl_lossless_transcode(7).method_tag(),
            "jxl.transcode.e7"
        );
    }
}
