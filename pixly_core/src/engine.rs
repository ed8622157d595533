//! Run orchestration.
//!
//! A scanner thread feeds one FIFO channel; a bounded pool of workers pulls
//! from it, each driving the full pipeline for one file at a time. Workers
//! share only the learning store, the config, and the progress bar. On
//! cancellation no new files are pulled, in-flight encoders are terminated,
//! and the store is flushed before the summary prints.

use std::path::Path;
use std::sync::mpsc::sync_channel;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::gate::EncoderGate;
use crate::pipeline::{self, FileAction, PipelineContext};
use crate::pressure;
use crate::progress::{self, create_progress_bar, format_bytes};
use crate::report::RunSummary;
use crate::safety;
use crate::scan::{self, Candidate};
use crate::store::LearningStore;
use crate::swap::Destination;
use crate::tools::ToolInventory;

/// Scanner-to-worker channel depth. Bounded so a million-file tree does not
/// balloon memory before the first conversion finishes.
const CHANNEL_DEPTH: usize = 256;

/// Startup failures, split by exit-code class.
#[derive(Debug)]
pub enum RunError {
    /// Operator mistake: bad directory, bad config. Exit 1.
    User(String),
    /// Broken environment: missing tools, unusable store. Exit 2.
    Environment(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::User(msg) | RunError::Environment(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for RunError {}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::User(_) => 1,
            RunError::Environment(_) => 2,
        }
    }
}

pub struct RunResult {
    pub summary: RunSummary,
    pub elapsed: Duration,
}

/// Execute one `convert` run over `target_dir`.
pub fn run_conversion(
    config: &EngineConfig,
    target_dir: &Path,
    cancel: CancelToken,
) -> Result<RunResult, RunError> {
    let started = Instant::now();

    // Everything that can refuse the run happens before any file is touched.
    config.validate().map_err(RunError::User)?;
    if !target_dir.is_dir() {
        return Err(RunError::User(format!(
            "target is not a directory: {}",
            target_dir.display()
        )));
    }
    safety::check_dangerous_directory(target_dir).map_err(RunError::User)?;
    if let Some(output_root) = &config.output_dir {
        safety::check_dangerous_directory(output_root).map_err(RunError::User)?;
    }

    let inventory = ToolInventory::detect();
    inventory
        .preflight()
        .map_err(|e| RunError::Environment(e.to_string()))?;

    let store = if config.no_store {
        None
    } else {
        let path = config.resolved_store_path();
        match LearningStore::open(&path) {
            Ok(store) => Some(store),
            Err(e) => {
                return Err(RunError::Environment(format!(
                    "cannot open learning store {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    };

    // Scratch directory for encoder temp outputs; removed on drop, so even a
    // cancelled run leaves nothing behind.
    let scratch = tempfile::Builder::new()
        .prefix("pixly-scratch-")
        .tempdir()
        .map_err(|e| RunError::Environment(format!("cannot create scratch directory: {}", e)))?;

    let destination = match &config.output_dir {
        Some(output_root) => Destination::Mirror {
            input_root: target_dir.to_path_buf(),
            output_root: output_root.clone(),
        },
        None => Destination::InPlace,
    };

    let workers = config.effective_workers();
    let max_encoders = config.effective_encoder_cap();
    let gate = std::sync::Arc::new(EncoderGate::new(max_encoders));

    // Pressure monitor: widens/narrows the gate with system headroom. Its
    // stop token fires on run cancellation or normal completion.
    let pressure_stop = cancel.child();
    let pressure_thread = {
        let gate = std::sync::Arc::clone(&gate);
        let stop = pressure_stop.clone();
        std::thread::Builder::new()
            .name("pixly-pressure".to_string())
            .spawn(move || pressure::monitor_pressure(&gate, max_encoders, &stop))
            .ok()
    };

    tracing::info!(
        dir = %target_dir.display(),
        mode = config.mode.as_str(),
        workers,
        dry_run = config.dry_run,
        "Starting run"
    );

    let (tx, rx) = sync_channel::<Candidate>(CHANNEL_DEPTH);
    let shared_rx = Mutex::new(rx);
    let reports: Mutex<Vec<pipeline::FileReport>> = Mutex::new(Vec::new());
    let bar = create_progress_bar(0);
    bar.set_message("scanning…");

    std::thread::scope(|scope| {
        // Scanner: streams candidates in stable order, stops on cancel.
        let scanner_cancel = cancel.clone();
        let scanner_bar = bar.clone();
        scope.spawn(move || {
            let mut emitted = 0u64;
            'walk: for candidate in scan::candidate_iter(target_dir) {
                if scanner_cancel.is_cancelled() {
                    break;
                }
                emitted += 1;
                scanner_bar.set_length(emitted);
                // try_send so a cancelled pool (nobody draining) can never
                // wedge the scanner on a full channel.
                let mut pending = candidate;
                loop {
                    match tx.try_send(pending) {
                        Ok(()) => break,
                        Err(std::sync::mpsc::TrySendError::Full(back)) => {
                            if scanner_cancel.is_cancelled() {
                                break 'walk;
                            }
                            pending = back;
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        Err(std::sync::mpsc::TrySendError::Disconnected(_)) => break 'walk,
                    }
                }
            }
            scanner_bar.set_message("");
            // tx drops here; workers drain the queue then exit.
        });

        for _ in 0..workers {
            let ctx = PipelineContext {
                config,
                scratch_dir: scratch.path(),
                destination: destination.clone(),
                store: store.as_ref(),
                encoder_gate: Some(gate.as_ref()),
                cancel: cancel.clone(),
            };
            let shared_rx = &shared_rx;
            let reports = &reports;
            let bar = bar.clone();
            scope.spawn(move || {
                loop {
                    if ctx.cancel.is_cancelled() {
                        return;
                    }
                    let candidate = {
                        let guard = shared_rx.lock().unwrap_or_else(|e| e.into_inner());
                        guard.recv()
                    };
                    let Ok(candidate) = candidate else {
                        return; // scanner done and queue drained
                    };

                    let name = candidate
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    progress::set_log_context(&name);
                    let _guard = progress::LogContextGuard;

                    let report =
                        pipeline::process_file(&ctx, &candidate.path, candidate.size_bytes);
                    announce(&bar, &report);
                    bar.inc(1);
                    reports
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(report);
                }
            });
        }
    });

    bar.finish_and_clear();
    pressure_stop.cancel();
    if let Some(handle) = pressure_thread {
        let _ = handle.join();
    }

    // Shutdown order matters: the store flushes before the summary prints,
    // so records are durable even when the printing path misbehaves.
    if let Some(store) = store {
        store.close();
    }
    drop(scratch);

    let mut summary = RunSummary::default();
    for report in reports.into_inner().unwrap_or_else(|e| e.into_inner()) {
        summary.absorb(&report);
    }

    let elapsed = started.elapsed();
    if cancel.is_cancelled() {
        eprintln!("🛑 Cancelled - partial results below");
    }
    Ok(RunResult { summary, elapsed })
}

/// One status line per file, printed through the bar so nothing tears.
fn announce(bar: &indicatif::ProgressBar, report: &pipeline::FileReport) {
    use console::style;

    let name = short_name(&report.path);
    match &report.action {
        FileAction::Converted {
            original_size,
            new_size,
            method,
            ..
        } => {
            let saving = 100.0 * (1.0 - *new_size as f64 / (*original_size).max(1) as f64);
            bar.println(format!(
                "✅ {} → {} ({} → {}, {})",
                name,
                style(method).cyan(),
                format_bytes(*original_size),
                format_bytes(*new_size),
                style(format!("-{:.1}%", saving)).green().bold()
            ));
        }
        FileAction::Planned {
            rule,
            method,
            expected_saving,
        } => {
            bar.println(format!(
                "📝 {} would use {} [{}], expect ~{:.0}% saving",
                name,
                method,
                rule,
                expected_saving * 100.0
            ));
        }
        FileAction::Skipped { reason } => {
            bar.println(format!("⏭️  {} skipped: {}", name, reason));
        }
        FileAction::Failed { kind, detail } => match kind {
            crate::errors::ErrorKind::Cancelled => {}
            crate::errors::ErrorKind::NoShrinkage => {
                bar.println(format!("⏭️  {} skipped, no benefit", name));
            }
            _ => {
                bar.println(format!("❌ {} failed ({}): {}", name, kind, detail));
            }
        },
    }
}

fn short_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingMode;

    #[test]
    fn test_rejects_missing_target() {
        let config = EngineConfig::default();
        let r = run_conversion(&config, Path::new("/nonexistent/dir"), CancelToken::new());
        match r {
            Err(RunError::User(_)) => {}
            other => panic!("expected user error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_dangerous_target() {
        let config = EngineConfig::default();
        let r = run_conversion(&config, Path::new("/tmp"), CancelToken::new());
        match r {
            Err(RunError::User(msg)) => assert!(msg.contains("BLOCKED")),
            other => panic!("expected user error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.confidence_threshold = 7.0;
        let dir = tempfile::TempDir::new().unwrap();
        let r = run_conversion(&config, dir.path(), CancelToken::new());
        assert!(matches!(r, Err(RunError::User(_))));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunError::User("x".to_string()).exit_code(), 1);
        assert_eq!(RunError::Environment("x".to_string()).exit_code(), 2);
    }

    #[test]
    fn test_empty_directory_runs_clean() {
        let inventory = ToolInventory::detect();
        if inventory.preflight().is_err() {
            eprintln!("required tools missing, skipping test");
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.no_store = true;
        config.mode = ProcessingMode::Auto;
        let result = run_conversion(&config, dir.path(), CancelToken::new()).unwrap();
        assert_eq!(result.summary.total, 0);
        assert_eq!(result.summary.exit_code(), 0);
    }

    #[test]
    fn test_dry_run_leaves_tree_untouched() {
        let inventory = ToolInventory::detect();
        if inventory.preflight().is_err() {
            eprintln!("required tools missing, skipping test");
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        // A corrupted png and a text file: neither may change on disk.
        let png = dir.path().join("broken.png");
        let mut data = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        data.resize(100, 0);
        std::fs::write(&png, &data).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let mut config = EngineConfig::default();
        config.dry_run = true;
        config.no_store = true;
        let result = run_conversion(&config, dir.path(), CancelToken::new()).unwrap();

        assert_eq!(std::fs::read(&png).unwrap(), data);
        assert_eq!(result.summary.total, 1); // only the png was a candidate
    }
}
