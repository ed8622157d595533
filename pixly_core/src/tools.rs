//! External tool preflight.
//!
//! Every capability is a child-process contract: `cjxl` (and `djxl` for the
//! bit-exact check) for JXL, `ffmpeg` for AVIF encodes and MOV rewraps,
//! `ffprobe` for probing, `exiftool` for embedded metadata. Absence of a
//! required tool is one actionable startup error, never per-file spam.

use std::process::Command;

use crate::errors::{PixlyError, Result};

#[derive(Debug, Clone)]
pub struct ToolInventory {
    pub cjxl: bool,
    pub djxl: bool,
    pub jxlinfo: bool,
    pub ffmpeg: bool,
    pub ffprobe: bool,
    pub exiftool: bool,
}

impl ToolInventory {
    pub fn detect() -> Self {
        Self {
            cjxl: which::which("cjxl").is_ok(),
            djxl: which::which("djxl").is_ok(),
            jxlinfo: which::which("jxlinfo").is_ok(),
            ffmpeg: which::which("ffmpeg").is_ok(),
            ffprobe: which::which("ffprobe").is_ok(),
            exiftool: which::which("exiftool").is_ok(),
        }
    }

    /// Verify the hard requirements and warn about the soft ones.
    pub fn preflight(&self) -> Result<()> {
        if !self.ffprobe {
            return Err(PixlyError::EncoderMissing {
                tool: "ffprobe".to_string(),
                hint: "install ffmpeg (provides ffprobe), e.g. `brew install ffmpeg` or `apt install ffmpeg`".to_string(),
            });
        }
        if !self.ffmpeg {
            return Err(PixlyError::EncoderMissing {
                tool: "ffmpeg".to_string(),
                hint: "install ffmpeg, e.g. `brew install ffmpeg` or `apt install ffmpeg`"
                    .to_string(),
            });
        }
        if !self.cjxl {
            return Err(PixlyError::EncoderMissing {
                tool: "cjxl".to_string(),
                hint: "install libjxl tools, e.g. `brew install jpeg-xl` or `apt install libjxl-tools`".to_string(),
            });
        }

        if !self.djxl {
            tracing::warn!(
                "djxl not found; JPEG→JXL transcodes cannot be proven bit-exact and will be rejected"
            );
            eprintln!("⚠️  djxl not found - JPEG lossless transcodes will be skipped");
        }
        if !self.exiftool {
            tracing::warn!("exiftool not found; embedded metadata will not be preserved");
        }

        for (name, present) in [
            ("cjxl", self.cjxl),
            ("djxl", self.djxl),
            ("ffmpeg", self.ffmpeg),
            ("ffprobe", self.ffprobe),
            ("exiftool", self.exiftool),
        ] {
            if present {
                tracing::info!(tool = name, version = %tool_version(name), "Tool available");
            }
        }

        Ok(())
    }
}

/// First line of `<tool> --version` / `-version`, best-effort.
pub fn tool_version(tool: &str) -> String {
    for flag in ["--version", "-version", "-ver"] {
        if let Ok(output) = Command::new(tool).arg(flag).output() {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Some(line) = text.lines().next() {
                    if !line.trim().is_empty() {
                        return line.trim().to_string();
                    }
                }
            }
        }
    }
    "unknown".to_string()
}
