//! FFprobe wrapper.
//!
//! Supplies the fields magic-byte sniffing cannot: dimensions, pixel format,
//! frame count, duration, stream codecs. Every probe runs under a fixed
//! wall-clock ceiling; a probe that hangs marks the file corrupted rather
//! than stalling a worker.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::errors::{PixlyError, Result};

/// Poll interval while waiting on a probe process.
const PROBE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub format_name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub frame_count: u64,
    pub duration_secs: f64,
    pub video_codec: String,
    pub has_audio: bool,
    pub audio_codec: Option<String>,
}

pub fn is_ffprobe_available() -> bool {
    which::which("ffprobe").is_ok()
}

/// Probe a media file with `ffprobe -print_format json`, killing the process
/// when `timeout` elapses.
pub fn probe_media(path: &Path, timeout: Duration) -> Result<ProbeResult> {
    let path_str = path.to_str().ok_or_else(|| PixlyError::CorruptedInput {
        path: path.to_path_buf(),
        detail: "path is not valid UTF-8".to_string(),
    })?;

    let started = Instant::now();
    let mut child = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "--",
            path_str,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PixlyError::EncoderMissing {
                    tool: "ffprobe".to_string(),
                    hint: "install ffmpeg (provides ffprobe)".to_string(),
                }
            } else {
                PixlyError::Io(e)
            }
        })?;

    // Drain both pipes off-thread so a chatty probe cannot deadlock on a full
    // pipe buffer while we poll for exit.
    let stdout_thread = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = std::io::Read::read_to_string(&mut out, &mut buf);
            buf
        })
    });
    let stderr_thread = child.stderr.take().map(|mut err| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = std::io::Read::read_to_string(&mut err, &mut buf);
            buf
        })
    });

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(
                        path = %path.display(),
                        timeout_secs = timeout.as_secs(),
                        "ffprobe exceeded ceiling, killed"
                    );
                    return Err(PixlyError::CorruptedInput {
                        path: path.to_path_buf(),
                        detail: format!("probe exceeded {}s ceiling", timeout.as_secs()),
                    });
                }
                std::thread::sleep(PROBE_POLL);
            }
            Err(e) => {
                let _ = child.kill();
                return Err(PixlyError::Io(e));
            }
        }
    };

    let stdout = stdout_thread
        .and_then(|t| t.join().ok())
        .unwrap_or_default();
    let stderr = stderr_thread
        .and_then(|t| t.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: if stderr.trim().is_empty() {
                format!("ffprobe exit code {:?}", status.code())
            } else {
                stderr.trim().to_string()
            },
        });
    }

    parse_probe_json(path, &stdout)
}

fn parse_probe_json(path: &Path, json_str: &str) -> Result<ProbeResult> {
    let json: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: format!("unparseable probe output: {}", e),
        })?;

    let format = &json["format"];
    let format_name = format["format_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let duration_secs = format["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let streams = json["streams"]
        .as_array()
        .ok_or_else(|| PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: "no streams in probe output".to_string(),
        })?;

    let video_stream = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| PixlyError::CorruptedInput {
            path: path.to_path_buf(),
            detail: "no video/image stream found".to_string(),
        })?;

    let width = video_stream["width"].as_u64().unwrap_or(0) as u32;
    let height = video_stream["height"].as_u64().unwrap_or(0) as u32;
    let pixel_format = video_stream["pix_fmt"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let video_codec = video_stream["codec_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    let frame_rate = parse_frame_rate(video_stream["r_frame_rate"].as_str().unwrap_or("0/1"));
    let frame_count = video_stream["nb_frames"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or_else(|| {
            if duration_secs > 0.0 && frame_rate > 0.0 {
                (duration_secs * frame_rate).round() as u64
            } else {
                1
            }
        })
        .max(1);

    let audio_stream = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("audio"));

    Ok(ProbeResult {
        format_name,
        width,
        height,
        pixel_format,
        frame_count,
        duration_secs,
        video_codec,
        has_audio: audio_stream.is_some(),
        audio_codec: audio_stream
            .and_then(|s| s["codec_name"].as_str())
            .map(|s| s.to_string()),
    })
}

/// Parse "num/den" frame rates as emitted by ffprobe.
pub fn parse_frame_rate(s: &str) -> f64 {
    let mut parts = s.split('/');
    let num: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0.0);
    let den: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1.0);
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// True when the pixel format carries an alpha channel (rgba, yuva420p, pal8
/// with transparency is handled at the sniff layer).
pub fn pixel_format_has_alpha(pix_fmt: &str) -> bool {
    pix_fmt.contains("rgba")
        || pix_fmt.contains("bgra")
        || pix_fmt.contains("argb")
        || pix_fmt.contains("abgr")
        || pix_fmt.starts_with("yuva")
        || pix_fmt == "ya8"
        || pix_fmt == "ya16be"
        || pix_fmt == "ya16le"
}
