//! Predictor (pipeline stage 2).
//!
//! An ordered table of golden rules maps features to parameters; the first
//! matching rule wins. The learned tuner only rescales expectation and
//! confidence from store aggregates - it never edits parameters, it can only
//! hand the decision to the exploration engine. Given identical features and
//! identical store contents the output is identical.

use serde::Serialize;

use crate::config::ProcessingMode;
use crate::features::{FileFeatures, MediaClass};
use crate::params::{ConversionParams, TargetFormat};
use crate::sniff::MediaFormat;

/// Aggregated history for one `(rule, format)` pair, read from the learning
/// store snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleStats {
    pub observations: u64,
    pub mean_abs_error: f64,
    pub mean_actual_saving: f64,
}

/// Read-only stats lookup. The learning store's snapshot implements this;
/// tests substitute fixed maps.
pub trait StatsProvider {
    fn rule_stats(&self, rule: &str, format: &str) -> Option<RuleStats>;
}

/// Tuner thresholds: trusted history tightens confidence, noisy history
/// loosens it and forces exploration.
const TUNER_GOOD_ERROR: f64 = 0.05;
const TUNER_BAD_ERROR: f64 = 0.15;
const TUNER_SCALE_UP: f64 = 1.15;
const TUNER_SCALE_DOWN: f64 = 0.70;
const CONFIDENCE_CEILING: f64 = 0.99;

pub const FALLBACK_RULE: &str = "fallback";

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub params: ConversionParams,
    pub expected_saving_ratio: f64,
    pub confidence: f64,
    pub rule_name: &'static str,
    pub should_explore: bool,
    /// Nonempty exactly when `should_explore`.
    pub exploration_candidates: Vec<ConversionParams>,
}

struct RuleEffect {
    params: ConversionParams,
    expected_saving: f64,
    confidence: f64,
}

/// One row of the golden rules table: a name, the modes it participates in,
/// a match predicate and an effect. Adding a row never touches the matcher.
struct GoldenRule {
    name: &'static str,
    modes: &'static [ProcessingMode],
    matches: fn(&FileFeatures) -> bool,
    effect: fn(&FileFeatures) -> RuleEffect,
}

/// PNG effort ladder: cap tail latency on large inputs, spend effort on tiny
/// ones.
pub fn png_effort_for_size(size_bytes: u64) -> u8 {
    if size_bytes > 10 * 1024 * 1024 {
        5
    } else if size_bytes < 100 * 1024 {
        9
    } else {
        7
    }
}

fn jpeg_expected_saving(pixel_format: &str) -> f64 {
    match pixel_format {
        "yuvj444p" | "yuv444p" => 0.30,
        "yuvj422p" | "yuv422p" => 0.24,
        "yuvj420p" | "yuv420p" => 0.18,
        _ => 0.22,
    }
}

fn png_expected_saving(effort: u8) -> f64 {
    match effort {
        9 => 0.70,
        5 => 0.55,
        _ => 0.62,
    }
}

fn gif_animated_crf(frame_count: u64) -> u8 {
    // Longer animations tolerate a coarser rate factor.
    if frame_count > 30 {
        38
    } else {
        35
    }
}

const AUTO_Q: &[ProcessingMode] = &[ProcessingMode::Auto, ProcessingMode::Quality];
const AUTO_ONLY: &[ProcessingMode] = &[ProcessingMode::Auto];
const EMOJI_ONLY: &[ProcessingMode] = &[ProcessingMode::Emoji];

/// The golden rules, in authoritative match order.
static GOLDEN_RULES: &[GoldenRule] = &[
    GoldenRule {
        name: "jpeg.lossless_transcode",
        modes: AUTO_Q,
        matches: |f| f.format == MediaFormat::Jpeg,
        effect: |f| RuleEffect {
            params: ConversionParams::jxl_lossless_transcode(7),
            expected_saving: jpeg_expected_saving(&f.pixel_format),
            confidence: 0.90,
        },
    },
    GoldenRule {
        name: "png.lossless_default",
        modes: AUTO_Q,
        matches: |f| f.format == MediaFormat::Png && f.media_class == MediaClass::StillImage,
        effect: |f| {
            let effort = png_effort_for_size(f.size_bytes);
            RuleEffect {
                params: ConversionParams::jxl_lossless(effort),
                expected_saving: png_expected_saving(effort),
                confidence: 0.85,
            }
        },
    },
    GoldenRule {
        name: "gif.static",
        modes: AUTO_Q,
        matches: |f| f.format == MediaFormat::Gif && f.frame_count == 1,
        effect: |_| RuleEffect {
            params: ConversionParams::jxl_lossless(7),
            expected_saving: 0.40,
            confidence: 0.75,
        },
    },
    GoldenRule {
        name: "gif.animated",
        modes: AUTO_ONLY,
        matches: |f| f.format == MediaFormat::Gif && f.frame_count > 1,
        effect: |f| RuleEffect {
            params: ConversionParams::avif(gif_animated_crf(f.frame_count), 6),
            expected_saving: 0.50,
            confidence: 0.70,
        },
    },
    GoldenRule {
        name: "webp.static",
        modes: AUTO_Q,
        matches: |f| f.format == MediaFormat::Webp && f.media_class == MediaClass::StillImage,
        effect: |_| RuleEffect {
            params: ConversionParams::jxl_lossless(7),
            expected_saving: 0.20,
            confidence: 0.65,
        },
    },
    GoldenRule {
        name: "webp.animated",
        modes: AUTO_ONLY,
        matches: |f| f.format == MediaFormat::Webp && f.media_class == MediaClass::AnimatedImage,
        effect: |_| RuleEffect {
            params: ConversionParams::avif(30, 6),
            expected_saving: 0.35,
            confidence: 0.60,
        },
    },
    GoldenRule {
        name: "heif.default",
        modes: AUTO_Q,
        matches: |f| f.format == MediaFormat::Heif,
        effect: |_| RuleEffect {
            params: ConversionParams::jxl_lossless(7),
            expected_saving: 0.25,
            confidence: 0.70,
        },
    },
    GoldenRule {
        name: "video.repackage",
        modes: AUTO_Q,
        matches: |f| f.media_class == MediaClass::Video,
        effect: |_| RuleEffect {
            params: ConversionParams::mov_stream_copy(),
            expected_saving: 0.02,
            confidence: 0.95,
        },
    },
    // Emoji mode: everything raster goes AVIF, stricter shrinkage floor is
    // enforced by the verifier via the mode's min_reduction.
    GoldenRule {
        name: "emoji.animated",
        modes: EMOJI_ONLY,
        matches: |f| f.media_class == MediaClass::AnimatedImage,
        effect: |f| RuleEffect {
            params: ConversionParams::avif(gif_animated_crf(f.frame_count), 6),
            expected_saving: 0.50,
            confidence: 0.70,
        },
    },
    GoldenRule {
        name: "emoji.still",
        modes: EMOJI_ONLY,
        matches: |f| f.media_class == MediaClass::StillImage,
        effect: |_| RuleEffect {
            params: ConversionParams::avif(30, 6),
            expected_saving: 0.40,
            confidence: 0.65,
        },
    },
    GoldenRule {
        name: FALLBACK_RULE,
        modes: AUTO_ONLY,
        matches: |_| true,
        effect: |_| RuleEffect {
            params: ConversionParams::jxl_lossy(1.0, 7),
            expected_saving: 0.20,
            confidence: 0.40,
        },
    },
    GoldenRule {
        name: "fallback.lossless",
        modes: &[ProcessingMode::Quality],
        matches: |f| f.media_class == MediaClass::StillImage,
        effect: |_| RuleEffect {
            params: ConversionParams::jxl_lossless(7),
            expected_saving: 0.30,
            confidence: 0.40,
        },
    },
];

/// Emit the prediction for one file, or `None` when the active mode's rule
/// subset has no row for it (quality mode and a lossy-only input, emoji mode
/// and a video). `None` is a clean per-file skip, never an error.
pub fn predict(
    features: &FileFeatures,
    mode: ProcessingMode,
    confidence_threshold: f64,
    min_observations: u64,
    stats: Option<&dyn StatsProvider>,
) -> Option<Prediction> {
    let rule = GOLDEN_RULES
        .iter()
        .filter(|r| r.modes.contains(&mode))
        .find(|r| (r.matches)(features))?;

    let effect = (rule.effect)(features);
    let mut expected = effect.expected_saving;
    let mut confidence = effect.confidence;
    let mut tuner_forced_explore = false;

    if let Some(provider) = stats {
        if let Some(agg) = provider.rule_stats(rule.name, features.format.as_str()) {
            if agg.observations >= min_observations {
                expected = agg.mean_actual_saving.clamp(0.0, 1.0);
                if agg.mean_abs_error < TUNER_GOOD_ERROR {
                    confidence = (confidence * TUNER_SCALE_UP).min(CONFIDENCE_CEILING);
                } else if agg.mean_abs_error > TUNER_BAD_ERROR {
                    confidence *= TUNER_SCALE_DOWN;
                    tuner_forced_explore = true;
                }
            }
        }
    }

    let wants_explore = confidence < confidence_threshold
        || rule.name == FALLBACK_RULE
        || tuner_forced_explore;

    let candidates = if wants_explore {
        build_exploration_candidates(&effect.params, mode)
    } else {
        Vec::new()
    };
    // A rule with nothing to perturb (stream copy) cannot explore.
    let should_explore = wants_explore && !candidates.is_empty();

    Some(Prediction {
        params: effect.params,
        expected_saving_ratio: expected,
        confidence,
        rule_name: rule.name,
        should_explore,
        exploration_candidates: if should_explore { candidates } else { Vec::new() },
    })
}

/// Build ≤3 candidates by perturbing one axis each. JXL explores the
/// distance axis in auto mode (effort axis in quality mode, where losing
/// mathematical losslessness is off the table); AVIF explores the crf axis.
/// The recommended point stays in the set, so the exploration engine always
/// covers the rule's own suggestion.
pub fn build_exploration_candidates(
    recommended: &ConversionParams,
    mode: ProcessingMode,
) -> Vec<ConversionParams> {
    let mut out: Vec<ConversionParams> = Vec::new();
    let mut push = |candidate: ConversionParams| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };
    match recommended.target {
        TargetFormat::Jxl => {
            let effort = recommended.effort.unwrap_or(7);
            if mode == ProcessingMode::Quality {
                for e in [effort, 5, 9] {
                    if recommended.lossless_jpeg_transcode {
                        push(ConversionParams::jxl_lossless_transcode(e));
                    } else {
                        push(ConversionParams::jxl_lossless(e));
                    }
                }
            } else if recommended.lossless_jpeg_transcode {
                // The repackage point first, then the lossy axis.
                push(recommended.clone());
                push(ConversionParams::jxl_lossy(0.8, effort));
                push(ConversionParams::jxl_lossy(1.2, effort));
            } else {
                for d in [0.0f64, 0.8, 1.2] {
                    push(ConversionParams::jxl_lossy(d, effort));
                }
            }
        }
        TargetFormat::Avif => {
            let crf = recommended.crf.unwrap_or(30);
            let speed = recommended.speed.unwrap_or(6);
            for c in [crf, crf.saturating_sub(5), (crf + 5).min(63)] {
                push(ConversionParams::avif(c, speed));
            }
        }
        // Stream copy has no axis to perturb.
        TargetFormat::Mov => {}
    }
    out.truncate(3);
    out
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn arb_format() -> impl Strategy<Value = MediaFormat> {
        prop_oneof![
            Just(MediaFormat::Jpeg),
            Just(MediaFormat::Png),
            Just(MediaFormat::Gif),
            Just(MediaFormat::Webp),
            Just(MediaFormat::Heif),
            Just(MediaFormat::Bmp),
            Just(MediaFormat::Tiff),
            Just(MediaFormat::Mp4),
            Just(MediaFormat::Mov),
            Just(MediaFormat::Mkv),
            Just(MediaFormat::Avi),
        ]
    }

    proptest! {
        /// Auto mode always produces a prediction, its params always
        /// validate, and candidates are nonempty exactly when exploring.
        #[test]
        fn prop_auto_mode_total_and_valid(
            format in arb_format(),
            frame_count in 1u64..200,
            size in 1u64..100_000_000,
        ) {
            let media_class = crate::features::classify(format, frame_count);
            let f = FileFeatures {
                path: PathBuf::from("/x/p"),
                size_bytes: size,
                format,
                media_class,
                width: 640,
                height: 480,
                pixel_format: "yuv420p".to_string(),
                has_alpha: false,
                frame_count,
                duration_secs: 0.0,
                video_codec: "h264".to_string(),
                has_audio: false,
                bytes_per_pixel: 0.5,
                icc_profile_present: false,
                exif_present: false,
                extension_mismatch: false,
            };
            let p = predict(&f, ProcessingMode::Auto, 0.80, 30, None)
                .expect("auto mode covers every format");
            prop_assert!(p.params.validate().is_ok());
            prop_assert!(p.confidence >= 0.0 && p.confidence <= 1.0);
            prop_assert!(p.expected_saving_ratio >= 0.0 && p.expected_saving_ratio <= 1.0);
            prop_assert_eq!(p.should_explore, !p.exploration_candidates.is_empty());
            prop_assert!(p.exploration_candidates.len() <= 3);
            for c in &p.exploration_candidates {
                prop_assert!(c.validate().is_ok());
            }
        }
    }
}
