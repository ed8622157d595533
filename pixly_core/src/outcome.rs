//! Outcome records: what one pipeline pass actually did.
//!
//! [`OptimizationOutcome`] is the in-process result handed from the encoder
//! and verifier stages to the replacer; [`ConversionRecord`] is the durable
//! form appended to the learning store (also on confirmed failure, so the
//! tuner learns from misses too).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::features::FileFeatures;
use crate::predict::Prediction;

/// Result of driving one parameter tuple through encode + verify.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub success: bool,
    /// Sealed temp output, present only on success.
    pub temp_output_path: Option<PathBuf>,
    pub original_size: u64,
    pub new_size: u64,
    pub method_tag: String,
    pub encoder_elapsed: Duration,
    pub verification_elapsed: Duration,
    pub error_kind: Option<ErrorKind>,
}

impl OptimizationOutcome {
    pub fn space_saved(&self) -> i64 {
        self.original_size as i64 - self.new_size as i64
    }

    pub fn actual_saving_ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        1.0 - self.new_size as f64 / self.original_size as f64
    }

    pub fn failed(
        original_size: u64,
        method_tag: String,
        encoder_elapsed: Duration,
        kind: ErrorKind,
    ) -> Self {
        Self {
            success: false,
            temp_output_path: None,
            original_size,
            new_size: 0,
            method_tag,
            encoder_elapsed,
            verification_elapsed: Duration::ZERO,
            error_kind: Some(kind),
        }
    }
}

/// Durable learning-store record: features + prediction + actuals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub file_hash: String,
    pub file_name: String,
    pub format: String,
    pub media_class: String,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub frame_count: u64,

    pub rule_name: String,
    pub method_tag: String,
    pub expected_saving_ratio: f64,
    pub confidence: f64,
    pub explored: bool,

    pub actual_saving_ratio: f64,
    pub encoder_elapsed_ms: u64,
    pub validation_passed: bool,
    /// Verifier metric where one applies (reserved; byte-compare passes store 1.0).
    pub validation_metric: Option<f64>,

    pub recorded_at: DateTime<Utc>,
    pub host_os: String,
}

impl ConversionRecord {
    pub fn build(
        features: &FileFeatures,
        prediction: &Prediction,
        outcome: &OptimizationOutcome,
        explored: bool,
    ) -> Self {
        Self {
            file_hash: file_identity_hash(&features.path, features.size_bytes),
            file_name: features
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            format: features.format.as_str().to_string(),
            media_class: features.media_class.as_str().to_string(),
            size_bytes: features.size_bytes,
            width: features.width,
            height: features.height,
            pixel_format: features.pixel_format.clone(),
            frame_count: features.frame_count,
            rule_name: prediction.rule_name.to_string(),
            method_tag: outcome.method_tag.clone(),
            expected_saving_ratio: prediction.expected_saving_ratio,
            confidence: prediction.confidence,
            explored,
            actual_saving_ratio: outcome.actual_saving_ratio(),
            encoder_elapsed_ms: outcome.encoder_elapsed.as_millis() as u64,
            validation_passed: outcome.success,
            validation_metric: if outcome.success { Some(1.0) } else { None },
            recorded_at: Utc::now(),
            host_os: std::env::consts::OS.to_string(),
        }
    }

    /// |expected - actual| saving; what the tuner aggregates.
    pub fn prediction_error(&self) -> f64 {
        (self.expected_saving_ratio - self.actual_saving_ratio).abs()
    }
}

/// Stable per-file key for the record table. Keyed on identity (path + size +
/// mtime), not content: hashing multi-gigabyte video content per record would
/// dominate pipeline time.
pub fn file_identity_hash(path: &Path, size_bytes: u64) -> String {
    let mtime_secs = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut hasher = blake3::Hasher::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(&size_bytes.to_le_bytes());
    hasher.update(&mtime_secs.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}
