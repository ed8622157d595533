//! Run summary.
//!
//! Aggregates every per-file report into the final boxed summary: totals,
//! per-error-kind counters, net bytes saved, and a bounded failure list. The
//! end user never sees a backtrace; diagnostics live in the log file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::pipeline::{FileAction, FileReport};
use crate::progress::{format_bytes, format_duration, format_signed_bytes};

/// Failure list cap in the printed summary.
const MAX_LISTED_FAILURES: usize = 20;

#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub converted: usize,
    pub planned: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub error_counts: HashMap<ErrorKind, usize>,
    pub failures: Vec<(PathBuf, String)>,
}

impl RunSummary {
    pub fn absorb(&mut self, report: &FileReport) {
        self.total += 1;
        match &report.action {
            FileAction::Converted {
                original_size,
                new_size,
                ..
            } => {
                self.converted += 1;
                self.input_bytes += original_size;
                self.output_bytes += new_size;
            }
            FileAction::Planned { .. } => self.planned += 1,
            FileAction::Skipped { .. } => self.skipped += 1,
            FileAction::Failed { kind, detail } => {
                *self.error_counts.entry(*kind).or_default() += 1;
                match kind {
                    ErrorKind::Cancelled => self.cancelled += 1,
                    // "No benefit" is a safe skip, not a failure, for both
                    // the summary and the exit code.
                    ErrorKind::NoShrinkage => self.skipped += 1,
                    _ => {
                        self.failed += 1;
                        if self.failures.len() < MAX_LISTED_FAILURES {
                            self.failures.push((report.path.clone(), detail.clone()));
                        }
                    }
                }
            }
        }
    }

    pub fn net_saved(&self) -> i64 {
        self.input_bytes as i64 - self.output_bytes as i64
    }

    /// Exit code contract: per-file failures stay 0; only startup-level
    /// problems (handled before a summary exists) yield 1/2.
    pub fn exit_code(&self) -> i32 {
        0
    }

    pub fn print(&self, elapsed: Duration) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║                    📊 Conversion Summary                     ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║  📁 Files examined:   {:>10}                             ║", self.total);
        println!("║  ✅ Converted:        {:>10}                             ║", self.converted);
        if self.planned > 0 {
            println!("║  📝 Planned (dry):    {:>10}                             ║", self.planned);
        }
        println!("║  ⏭️  Skipped:          {:>10}                             ║", self.skipped);
        println!("║  ❌ Failed:           {:>10}                             ║", self.failed);
        if self.cancelled > 0 {
            println!("║  🛑 Cancelled:        {:>10}                             ║", self.cancelled);
        }
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!(
            "║  💾 Input bytes:      {:>10}                             ║",
            format_bytes(self.input_bytes)
        );
        println!(
            "║  💾 Output bytes:     {:>10}                             ║",
            format_bytes(self.output_bytes)
        );
        println!(
            "║  📉 Net saved:        {:>10}                             ║",
            format_signed_bytes(self.net_saved())
        );
        println!(
            "║  ⏱️  Elapsed:          {:>10}                             ║",
            format_duration(elapsed)
        );
        println!("╚══════════════════════════════════════════════════════════════╝");

        if !self.error_counts.is_empty() {
            println!();
            println!("Per-kind counters:");
            let mut kinds: Vec<_> = self.error_counts.iter().collect();
            kinds.sort_by_key(|(k, _)| k.tag());
            for (kind, count) in kinds {
                let label = match kind {
                    ErrorKind::NoShrinkage => "skipped, no benefit",
                    other => other.tag(),
                };
                println!("   {:<28} {}", label, count);
            }
        }

        if !self.failures.is_empty() {
            println!();
            println!("❌ Failures (first {}):", MAX_LISTED_FAILURES);
            for (path, detail) in &self.failures {
                println!("   {} → {}", path.display(), detail);
            }
        }
    }
}
