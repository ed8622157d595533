//! The per-file optimization pipeline.
//!
//! One worker drives one file through the whole chain strictly in order:
//! probe → predict → (explore)? → encode → verify → migrate → swap → record.
//! Timestamps are captured before anything else runs. Every exit from this
//! function leaves the source either intact or atomically replaced - there
//! is no third state.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::encoder::{self, next_attempt_id, process::{encode_ceiling, ProcessLimits}};
use crate::errors::ErrorKind;
use crate::explore;
use crate::features::{self, FileFeatures};
use crate::metadata::{self, SourceTimes};
use crate::outcome::{ConversionRecord, OptimizationOutcome};
use crate::params::TargetFormat;
use crate::predict::{self, Prediction};
use crate::sniff::MediaFormat;
use crate::store::LearningStore;
use crate::swap::{atomic_swap, Destination};
use crate::verify;

/// What happened to one file.
#[derive(Debug, Clone)]
pub enum FileAction {
    Converted {
        final_path: PathBuf,
        original_size: u64,
        new_size: u64,
        rule: String,
        method: String,
    },
    /// Dry-run: the decision without the work.
    Planned {
        rule: String,
        method: String,
        expected_saving: f64,
    },
    Skipped {
        reason: String,
    },
    Failed {
        kind: ErrorKind,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    pub action: FileAction,
    pub elapsed: Duration,
}

impl FileReport {
    pub fn bytes_saved(&self) -> i64 {
        match &self.action {
            FileAction::Converted {
                original_size,
                new_size,
                ..
            } => *original_size as i64 - *new_size as i64,
            _ => 0,
        }
    }
}

/// Everything a worker needs besides the file itself. Shared read-only
/// across the pool.
pub struct PipelineContext<'a> {
    pub config: &'a EngineConfig,
    pub scratch_dir: &'a Path,
    pub destination: Destination,
    pub store: Option<&'a LearningStore>,
    /// Caps concurrently running encoder attempts below worker count. One
    /// permit covers a whole attempt, exploration included.
    pub encoder_gate: Option<&'a crate::gate::EncoderGate>,
    pub cancel: CancelToken,
}

/// Run the full pipeline for one file. Never panics on per-file trouble;
/// every failure comes back as a [`FileAction`].
pub fn process_file(ctx: &PipelineContext<'_>, path: &Path, size_bytes: u64) -> FileReport {
    let started = Instant::now();
    let action = run_pipeline(ctx, path, size_bytes);
    let elapsed = started.elapsed();

    match &action {
        FileAction::Converted {
            original_size,
            new_size,
            rule,
            ..
        } => {
            tracing::info!(
                file = %path.display(),
                rule,
                original_size,
                new_size,
                elapsed_secs = elapsed.as_secs_f64(),
                "Converted"
            );
        }
        FileAction::Planned { rule, method, .. } => {
            tracing::info!(file = %path.display(), rule, method, "Dry-run plan");
        }
        FileAction::Skipped { reason } => {
            tracing::debug!(file = %path.display(), reason, "Skipped");
        }
        FileAction::Failed { kind, detail } => {
            if *kind != ErrorKind::Cancelled {
                tracing::warn!(file = %path.display(), kind = %kind, detail, "File failed");
            }
        }
    }

    FileReport {
        path: path.to_path_buf(),
        action,
        elapsed,
    }
}

fn run_pipeline(ctx: &PipelineContext<'_>, path: &Path, size_bytes: u64) -> FileAction {
    if ctx.cancel.is_cancelled() {
        return FileAction::Failed {
            kind: ErrorKind::Cancelled,
            detail: String::new(),
        };
    }

    // Timestamps first: every later stage may touch the source's metadata.
    let times = match SourceTimes::capture(path) {
        Ok(t) => t,
        Err(e) => {
            return FileAction::Failed {
                kind: ErrorKind::CorruptedInput,
                detail: format!("cannot stat source: {}", e),
            }
        }
    };

    // ── C1: probe ────────────────────────────────────────────────────────
    let probe_timeout = Duration::from_secs(ctx.config.probe_timeout_secs);
    let features = match features::extract_features_with_timeout(path, size_bytes, probe_timeout) {
        Ok(f) => f,
        Err(e) => {
            return FileAction::Failed {
                kind: e.kind(),
                detail: e.to_string(),
            }
        }
    };

    if features.format.is_modern_target() {
        return FileAction::Skipped {
            reason: format!("already {}", features.format.as_str()),
        };
    }

    // ── C2: predict ──────────────────────────────────────────────────────
    let snapshot = ctx.store.map(|s| s.snapshot());
    let prediction = match predict::predict(
        &features,
        ctx.config.mode,
        ctx.config.confidence_threshold,
        ctx.config.min_observations,
        snapshot
            .as_ref()
            .map(|s| s as &dyn predict::StatsProvider),
    ) {
        Some(p) => p,
        None => {
            return FileAction::Skipped {
                reason: format!("no rule in {} mode", ctx.config.mode.as_str()),
            }
        }
    };

    // A video already in the target container gains nothing from a rewrap.
    if prediction.params.target == TargetFormat::Mov && features.format == MediaFormat::Mov {
        return FileAction::Skipped {
            reason: "already a MOV container".to_string(),
        };
    }

    if ctx.config.dry_run {
        return FileAction::Planned {
            rule: prediction.rule_name.to_string(),
            method: prediction.params.method_tag(),
            expected_saving: prediction.expected_saving_ratio,
        };
    }

    let limits = ProcessLimits {
        wall_clock: encode_ceiling(
            size_bytes,
            ctx.config.encoder_timeout_base_secs,
            ctx.config.encoder_timeout_per_mb_secs,
            ctx.config.encoder_timeout_cap_secs,
        ),
        stall_window: Duration::from_secs(ctx.config.encoder_stall_secs),
    };
    let min_reduction = ctx.config.effective_min_reduction();

    // ── C3/C4/C5: attempt ────────────────────────────────────────────────
    let attempt = {
        let _permit = ctx.encoder_gate.map(|g| g.acquire());
        attempt_conversion(ctx, &features, &prediction, &limits, min_reduction)
    };

    let win = match attempt {
        Ok(Some(win)) => win,
        Ok(None) => {
            record_failure(ctx, &features, &prediction, ErrorKind::NoShrinkage);
            return FileAction::Failed {
                kind: ErrorKind::NoShrinkage,
                detail: "no candidate produced a valid smaller output".to_string(),
            };
        }
        Err(e) => {
            let kind = e.kind();
            if kind != ErrorKind::Cancelled && kind != ErrorKind::EncoderMissing {
                record_failure(ctx, &features, &prediction, kind);
            }
            return FileAction::Failed {
                kind,
                detail: e.to_string(),
            };
        }
    };

    // ── C5: metadata migration (non-fatal) ───────────────────────────────
    if let Err(e) = metadata::migrate_metadata(path, &win.temp_output, &times) {
        tracing::warn!(file = %path.display(), error = %e, "Metadata migration incomplete");
        eprintln!("⚠️  [{}] metadata not fully carried over", path.display());
    }
    // Migration rewrote the temp; its size may have moved a little. Re-check
    // shrinkage on what actually lands on disk - a metadata pass must never
    // smuggle the output back above the source.
    let new_size = std::fs::metadata(&win.temp_output)
        .map(|m| m.len())
        .unwrap_or(win.new_size);
    if new_size >= features.size_bytes {
        let _ = std::fs::remove_file(&win.temp_output);
        record_failure(ctx, &features, &prediction, ErrorKind::NoShrinkage);
        return FileAction::Failed {
            kind: ErrorKind::NoShrinkage,
            detail: "metadata migration grew the output past the source".to_string(),
        };
    }

    // ── C6: swap + record ────────────────────────────────────────────────
    let attempt_id = next_attempt_id();
    let swap_result = atomic_swap(
        path,
        &win.temp_output,
        win.params.target.extension(),
        &ctx.destination,
        &attempt_id,
    );

    match swap_result {
        Ok(outcome) => {
            let opt_outcome = OptimizationOutcome {
                success: true,
                temp_output_path: None,
                original_size: features.size_bytes,
                new_size,
                method_tag: win.params.method_tag(),
                encoder_elapsed: win.encoder_elapsed,
                verification_elapsed: win.verification_elapsed,
                error_kind: None,
            };
            record_outcome(ctx, &features, &prediction, &opt_outcome, win.explored);
            FileAction::Converted {
                final_path: outcome.final_path,
                original_size: features.size_bytes,
                new_size,
                rule: prediction.rule_name.to_string(),
                method: win.params.method_tag(),
            }
        }
        Err(e) => {
            // The swap drained its undo stack; the scratch temp may remain
            // and must not.
            let _ = std::fs::remove_file(&win.temp_output);
            record_failure(ctx, &features, &prediction, ErrorKind::SwapFailed);
            FileAction::Failed {
                kind: ErrorKind::SwapFailed,
                detail: e.to_string(),
            }
        }
    }
}

/// A verified winning attempt, from either the direct path or exploration.
struct WinningAttempt {
    params: crate::params::ConversionParams,
    temp_output: PathBuf,
    new_size: u64,
    encoder_elapsed: Duration,
    verification_elapsed: Duration,
    explored: bool,
}

fn attempt_conversion(
    ctx: &PipelineContext<'_>,
    features: &FileFeatures,
    prediction: &Prediction,
    limits: &ProcessLimits,
    min_reduction: f64,
) -> crate::errors::Result<Option<WinningAttempt>> {
    let probe_timeout = Duration::from_secs(ctx.config.probe_timeout_secs);

    if !prediction.should_explore {
        // High-confidence path: one encode of the recommended tuple.
        match direct_attempt(ctx, features, prediction, limits, min_reduction, probe_timeout) {
            Ok(win) => return Ok(Some(win)),
            Err(e) if e.kind().retryable_in_exploration() => {
                tracing::debug!(
                    file = %features.path.display(),
                    error = %e,
                    "High-confidence attempt failed, falling back to exploration"
                );
            }
            Err(e) => return Err(e),
        }
    }

    // Exploration path: the predictor's candidates, or ad-hoc ones after a
    // failed high-confidence attempt.
    let candidates = if prediction.exploration_candidates.is_empty() {
        predict::build_exploration_candidates(&prediction.params, ctx.config.mode)
    } else {
        prediction.exploration_candidates.clone()
    };
    if candidates.is_empty() {
        return Ok(None);
    }

    let result = explore::explore(
        features,
        &candidates,
        prediction.expected_saving_ratio,
        ctx.scratch_dir,
        limits,
        min_reduction,
        probe_timeout,
        &ctx.cancel,
    )?;

    Ok(result.map(|w| WinningAttempt {
        params: w.params,
        temp_output: w.temp_output,
        new_size: w.new_size,
        encoder_elapsed: w.encoder_elapsed,
        verification_elapsed: w.verification_elapsed,
        explored: true,
    }))
}

fn direct_attempt(
    ctx: &PipelineContext<'_>,
    features: &FileFeatures,
    prediction: &Prediction,
    limits: &ProcessLimits,
    min_reduction: f64,
    probe_timeout: Duration,
) -> crate::errors::Result<WinningAttempt> {
    let encoded = encoder::encode(
        &features.path,
        features.size_bytes,
        &prediction.params,
        ctx.scratch_dir,
        limits,
        &ctx.cancel,
    )?;

    let verification_elapsed = verify::verify_output(
        features,
        &prediction.params,
        &encoded.temp_output,
        min_reduction,
        probe_timeout,
        &ctx.cancel,
    )?;

    let new_size = std::fs::metadata(&encoded.temp_output)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(WinningAttempt {
        params: prediction.params.clone(),
        temp_output: encoded.temp_output,
        new_size,
        encoder_elapsed: encoded.elapsed,
        verification_elapsed,
        explored: false,
    })
}

fn record_outcome(
    ctx: &PipelineContext<'_>,
    features: &FileFeatures,
    prediction: &Prediction,
    outcome: &OptimizationOutcome,
    explored: bool,
) {
    if let Some(store) = ctx.store {
        store.append(ConversionRecord::build(features, prediction, outcome, explored));
    }
}

/// Negative learning: a confirmed failure teaches the tuner as much as a
/// success.
fn record_failure(
    ctx: &PipelineContext<'_>,
    features: &FileFeatures,
    prediction: &Prediction,
    kind: ErrorKind,
) {
    let outcome = OptimizationOutcome::failed(
        features.size_bytes,
        prediction.params.method_tag(),
        Duration::ZERO,
        kind,
    );
    record_outcome(ctx, features, prediction, &outcome, prediction.should_explore);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ProcessingMode};

    fn context<'a>(
        config: &'a EngineConfig,
        scratch: &'a Path,
        store: Option<&'a LearningStore>,
    ) -> PipelineContext<'a> {
        PipelineContext {
            config,
            scratch_dir: scratch,
            destination: Destination::InPlace,
            store,
            encoder_gate: None,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_corrupted_input_skips_file_and_touches_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("broken.png");
        // PNG signature, then truncation.
        let mut data = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        data.resize(100, 0);
        std::fs::write(&file, &data).unwrap();

        let config = EngineConfig::default();
        let ctx = context(&config, scratch.path(), None);
        let report = process_file(&ctx, &file, 100);

        match report.action {
            FileAction::Failed { kind, .. } => assert_eq!(kind, ErrorKind::CorruptedInput),
            other => panic!("expected CorruptedInput, got {:?}", other),
        }
        // Source byte-identical, no temp debris anywhere.
        assert_eq!(std::fs::read(&file).unwrap(), data);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_already_modern_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("done.jxl");
        let mut data = vec![0xFF, 0x0A];
        data.resize(500, 1);
        std::fs::write(&file, &data).unwrap();

        let config = EngineConfig::default();
        let ctx = context(&config, scratch.path(), None);
        let report = process_file(&ctx, &file, 500);

        assert!(matches!(report.action, FileAction::Skipped { .. }));
        assert!(file.exists());
    }

    #[test]
    fn test_cancelled_before_work() {
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, vec![0u8; 100]).unwrap();

        let config = EngineConfig::default();
        let ctx = context(&config, scratch.path(), None);
        ctx.cancel.cancel();
        let report = process_file(&ctx, &file, 100);
        assert!(matches!(
            report.action,
            FileAction::Failed {
                kind: ErrorKind::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_dry_run_plans_without_writing() {
        if !crate::probe::is_ffprobe_available() {
            eprintln!("ffprobe not available, skipping test");
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("tiny.gif");
        // Valid single-frame 1x1 GIF.
        let gif: &[u8] = &[
            0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00,
            0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
            0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
        ];
        std::fs::write(&file, gif).unwrap();
        let before = std::fs::read(&file).unwrap();

        let mut config = EngineConfig::default();
        config.dry_run = true;
        config.mode = ProcessingMode::Auto;
        let ctx = context(&config, scratch.path(), None);
        let report = process_file(&ctx, &file, gif.len() as u64);

        match report.action {
            FileAction::Planned { rule, .. } => assert_eq!(rule, "gif.static"),
            other => panic!("expected a plan, got {:?}", other),
        }
        assert_eq!(std::fs::read(&file).unwrap(), before);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_quality_mode_skips_animated_gif() {
        if !crate::probe::is_ffprobe_available() {
            eprintln!("ffprobe not available, skipping test");
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("anim.gif");
        // Two-frame 1x1 GIF.
        let mut gif = vec![
            0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00,
            0x00, 0x00, 0xFF, 0xFF, 0xFF,
        ];
        for _ in 0..2 {
            gif.extend_from_slice(&[
                0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44,
                0x01, 0x00,
            ]);
        }
        gif.push(0x3B);
        std::fs::write(&file, &gif).unwrap();

        let mut config = EngineConfig::default();
        config.mode = ProcessingMode::Quality;
        let ctx = context(&config, scratch.path(), None);
        let report = process_file(&ctx, &file, gif.len() as u64);

        match report.action {
            FileAction::Skipped { reason } => assert!(reason.contains("quality")),
            other => panic!("expected mode skip, got {:?}", other),
        }
    }
}
