//! Exploration engine (pipeline stage 3).
//!
//! When the predictor is unsure, up to three candidate parameter tuples are
//! trialed with at most two encoders in flight - the file workers are already
//! parallel, a wider fan-out here just thrashes. Every candidate runs the
//! full encode+verify path; losers are deleted on the spot. The winner is
//! the smallest passing output, ties broken by candidate order, and a
//! candidate that reaches 80% of the predicted saving short-circuits the
//! rest.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::encoder::{self, process::ProcessLimits};
use crate::errors::{PixlyError, Result};
use crate::features::FileFeatures;
use crate::params::ConversionParams;
use crate::verify;

/// In-flight encoder cap inside one file's exploration.
const EXPLORE_CONCURRENCY: usize = 2;
/// Fraction of the predicted saving that ends the search early.
const EARLY_STOP_FRACTION: f64 = 0.80;

#[derive(Debug)]
pub struct ExplorationWin {
    pub candidate_index: usize,
    pub params: ConversionParams,
    pub temp_output: PathBuf,
    pub new_size: u64,
    pub encoder_elapsed: Duration,
    pub verification_elapsed: Duration,
}

struct CandidateOutcome {
    index: usize,
    params: ConversionParams,
    temp_output: PathBuf,
    new_size: u64,
    encoder_elapsed: Duration,
    verification_elapsed: Duration,
}

/// Trial the candidates and return the best passing one, or `None` when no
/// candidate produced a valid smaller output. `Err(Cancelled)` only for
/// run-level cancellation; an early stop is a success path.
#[allow(clippy::too_many_arguments)]
pub fn explore(
    features: &FileFeatures,
    candidates: &[ConversionParams],
    expected_saving: f64,
    scratch_dir: &Path,
    limits: &ProcessLimits,
    min_reduction: f64,
    probe_timeout: Duration,
    cancel: &CancelToken,
) -> Result<Option<ExplorationWin>> {
    if candidates.is_empty() {
        return Ok(None);
    }

    let local = cancel.child();
    let next_index = AtomicUsize::new(0);
    let outcomes: Mutex<Vec<CandidateOutcome>> = Mutex::new(Vec::new());

    let worker_count = EXPLORE_CONCURRENCY.min(candidates.len());
    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| {
                loop {
                    if local.is_cancelled() {
                        return;
                    }
                    let index = next_index.fetch_add(1, Ordering::SeqCst);
                    let Some(params) = candidates.get(index) else {
                        return;
                    };

                    match trial_candidate(
                        features,
                        index,
                        params,
                        scratch_dir,
                        limits,
                        min_reduction,
                        probe_timeout,
                        &local,
                    ) {
                        Ok(outcome) => {
                            let saving =
                                1.0 - outcome.new_size as f64 / features.size_bytes as f64;
                            let early_stop = expected_saving > 0.0
                                && saving >= expected_saving * EARLY_STOP_FRACTION;

                            outcomes
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(outcome);

                            if early_stop {
                                tracing::debug!(
                                    file = %features.path.display(),
                                    candidate = index,
                                    saving = format!("{:.1}%", saving * 100.0),
                                    "Early stop: candidate reached the expected saving"
                                );
                                local.cancel();
                                return;
                            }
                        }
                        Err(PixlyError::Cancelled) => return,
                        Err(e) => {
                            tracing::debug!(
                                file = %features.path.display(),
                                candidate = index,
                                error = %e,
                                "Exploration candidate lost"
                            );
                        }
                    }
                }
            });
        }
    });

    // Run-level cancellation trumps any result; delete everything we made.
    if cancel.is_cancelled() {
        for outcome in outcomes.into_inner().unwrap_or_else(|e| e.into_inner()) {
            let _ = std::fs::remove_file(&outcome.temp_output);
        }
        return Err(PixlyError::Cancelled);
    }

    let mut finished = outcomes.into_inner().unwrap_or_else(|e| e.into_inner());
    // Smallest output wins; equal sizes fall back to candidate order.
    finished.sort_by_key(|o| (o.new_size, o.index));

    let mut iter = finished.into_iter();
    let winner = iter.next();
    for loser in iter {
        let _ = std::fs::remove_file(&loser.temp_output);
    }

    Ok(winner.map(|w| ExplorationWin {
        candidate_index: w.index,
        params: w.params,
        temp_output: w.temp_output,
        new_size: w.new_size,
        encoder_elapsed: w.encoder_elapsed,
        verification_elapsed: w.verification_elapsed,
    }))
}

#[allow(clippy::too_many_arguments)]
fn trial_candidate(
    features: &FileFeatures,
    index: usize,
    params: &ConversionParams,
    scratch_dir: &Path,
    limits: &ProcessLimits,
    min_reduction: f64,
    probe_timeout: Duration,
    cancel: &CancelToken,
) -> Result<CandidateOutcome> {
    let encoded = encoder::encode(
        &features.path,
        features.size_bytes,
        params,
        scratch_dir,
        limits,
        cancel,
    )?;

    let verification_elapsed = verify::verify_output(
        features,
        params,
        &encoded.temp_output,
        min_reduction,
        probe_timeout,
        cancel,
    )?;

    let new_size = std::fs::metadata(&encoded.temp_output)
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(CandidateOutcome {
        index,
        params: params.clone(),
        temp_output: encoded.temp_output,
        new_size,
        encoder_elapsed: encoded.elapsed,
        verification_elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::MediaClass;
    use crate::sniff::MediaFormat;

    fn features(path: PathBuf, size: u64) -> FileFeatures {
        FileFeatures {
            path,
            size_bytes: size,
            format: MediaFormat::Webp,
            media_class: MediaClass::StillImage,
            width: 100,
            height: 100,
            pixel_format: "yuv420p".to_string(),
            has_alpha: false,
            frame_count: 1,
            duration_secs: 0.0,
            video_codec: "webp".to_string(),
            has_audio: false,
            bytes_per_pixel: 0.1,
            icc_profile_present: false,
            exif_present: false,
            extension_mismatch: false,
        }
    }

    fn limits() -> ProcessLimits {
        ProcessLimits {
            wall_clock: Duration::from_secs(30),
            stall_window: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("a.webp");
        std::fs::write(&src, vec![0u8; 1000]).unwrap();
        let f = features(src, 1000);
        let result = explore(
            &f,
            &[],
            0.2,
            dir.path(),
            &limits(),
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_all_candidates_fail_without_encoder() {
        // cjxl on a garbage webp either fails to exist or fails to encode;
        // both ways no candidate can win and no temp file may remain.
        let dir = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("a.webp");
        std::fs::write(&src, vec![0x42u8; 1000]).unwrap();
        let f = features(src, 1000);
        let candidates = vec![
            ConversionParams::jxl_lossy(0.0, 1),
            ConversionParams::jxl_lossy(0.8, 1),
        ];
        let result = explore(
            &f,
            &candidates,
            0.2,
            scratch.path(),
            &limits(),
            0.0,
            Duration::from_secs(5),
            &CancelToken::new(),
        );
        match result {
            Ok(None) | Err(_) => {}
            Ok(Some(win)) => panic!("garbage input cannot produce a winner: {:?}", win),
        }
        let stray = std::fs::read_dir(scratch.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(stray, 0, "losing candidates must not leave artifacts");
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("a.webp");
        std::fs::write(&src, vec![0u8; 1000]).unwrap();
        let f = features(src, 1000);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = explore(
            &f,
            &[ConversionParams::jxl_lossy(0.8, 7)],
            0.2,
            dir.path(),
            &limits(),
            0.0,
            Duration::from_secs(5),
            &cancel,
        );
        assert!(matches!(result, Err(PixlyError::Cancelled)));
    }
}
