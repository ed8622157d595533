//! Encoder driver (pipeline stage 4).
//!
//! Dispatches a [`ConversionParams`] to the one external tool that realizes
//! it: `cjxl` for JXL, `ffmpeg` for AVIF encodes and MOV stream copies. The
//! set is closed - dispatch is a match, not a plugin registry. Temp outputs
//! land in the scratch directory under a per-attempt unique name.

pub mod process;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::errors::{PixlyError, Result};
use crate::params::{ConversionParams, TargetFormat};
use process::{run_tool, ProcessLimits};

static ATTEMPT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique attempt id: collision-free scratch names under concurrency.
pub fn next_attempt_id() -> String {
    let n = ATTEMPT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", std::process::id(), n)
}

/// The binary a parameter tuple needs.
pub fn required_tool(target: TargetFormat) -> &'static str {
    match target {
        TargetFormat::Jxl => "cjxl",
        TargetFormat::Avif | TargetFormat::Mov => "ffmpeg",
    }
}

#[derive(Debug)]
pub struct EncodeSuccess {
    pub temp_output: PathBuf,
    pub elapsed: Duration,
}

/// Scratch file name for one attempt: `<stem>.<attempt_id>.<ext>`.
pub fn scratch_output_path(
    scratch_dir: &Path,
    input: &Path,
    target: TargetFormat,
    attempt_id: &str,
) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    scratch_dir.join(format!("{}.{}.{}", stem, attempt_id, target.extension()))
}

/// Build the exact child command for one attempt.
fn build_command(params: &ConversionParams, input: &Path, output: &Path) -> Command {
    match params.target {
        TargetFormat::Jxl => {
            let mut cmd = Command::new("cjxl");
            if params.lossless_jpeg_transcode {
                cmd.arg("--lossless_jpeg=1");
            }
            cmd.arg(input).arg(output);
            cmd.arg("-d")
                .arg(format!("{}", params.distance.unwrap_or(0.0)));
            cmd.arg("-e").arg(params.effort.unwrap_or(7).to_string());
            cmd
        }
        TargetFormat::Avif => {
            let mut cmd = Command::new("ffmpeg");
            cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
                .arg(input);
            cmd.args(["-c:v", "libaom-av1"]);
            cmd.arg("-crf").arg(params.crf.unwrap_or(30).to_string());
            cmd.arg("-cpu-used")
                .arg(params.speed.unwrap_or(6).to_string());
            // libaom requires even dimensions in yuv420p; round down, never up.
            cmd.args(["-vf", "scale=trunc(iw/2)*2:trunc(ih/2)*2"]);
            cmd.args(["-pix_fmt", "yuv420p"]);
            cmd.args(["-f", "avif"]).arg(output);
            cmd
        }
        TargetFormat::Mov => {
            let mut cmd = Command::new("ffmpeg");
            cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
                .arg(input);
            cmd.args(["-c", "copy", "-f", "mov"]).arg(output);
            cmd
        }
    }
}

/// Drive one encode attempt to a sealed temp file.
///
/// On success the temp file exists with nonzero size; on any failure the
/// partial output is removed before the error propagates.
pub fn encode(
    input: &Path,
    input_size: u64,
    params: &ConversionParams,
    scratch_dir: &Path,
    limits: &ProcessLimits,
    cancel: &CancelToken,
) -> Result<EncodeSuccess> {
    params
        .validate()
        .map_err(|reason| PixlyError::VerificationRejected { reason })?;

    let tool = required_tool(params.target);
    let attempt_id = next_attempt_id();
    let output = scratch_output_path(scratch_dir, input, params.target, &attempt_id);

    tracing::debug!(
        input = %input.display(),
        output = %output.display(),
        method = %params.method_tag(),
        input_mb = input_size / (1024 * 1024),
        "Encode attempt"
    );

    let command = build_command(params, input, &output);
    let result = run_tool(tool, command, &output, limits, cancel);

    let tool_output = match result {
        Ok(out) => out,
        Err(e) => {
            let _ = std::fs::remove_file(&output);
            return Err(e);
        }
    };

    if !tool_output.status.success() {
        let _ = std::fs::remove_file(&output);
        return Err(PixlyError::EncoderFailed {
            tool: tool.to_string(),
            exit_code: tool_output.status.code(),
            stderr_tail: tool_output.stderr_tail,
        });
    }

    let out_size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
    if out_size == 0 {
        let _ = std::fs::remove_file(&output);
        return Err(PixlyError::EncoderFailed {
            tool: tool.to_string(),
            exit_code: tool_output.status.code(),
            stderr_tail: format!(
                "exit 0 but produced no output; stderr tail: {}",
                tool_output.stderr_tail
            ),
        });
    }

    Ok(EncodeSuccess {
        temp_output: output,
        elapsed: tool_output.elapsed,
    })
}
