//! Logging setup.
//!
//! tracing 统一日志：daily-rolling file in the system temp directory plus a
//! message-only stderr layer. The file writer strips ANSI escapes so log
//! files stay plain text, and old log files are pruned beyond a configured
//! count. Diagnostics belong here - the user-facing stream only ever sees
//! the progress bar and the summary.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Strip ANSI escape sequences (e.g. `\x1b[92m`) so log files are plain text.
fn strip_ansi_bytes(buf: &[u8]) -> Vec<u8> {
    let s = match std::str::from_utf8(buf) {
        Ok(s) => s,
        Err(_) => return buf.to_vec(),
    };
    let mut result = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c == 'm' || c.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result.into_bytes()
}

/// Line-buffering writer that strips ANSI before the bytes hit the file.
struct StripAnsiWriter<W: Write + Send> {
    buffer: Vec<u8>,
    inner: W,
}

impl<W: Write + Send> StripAnsiWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            buffer: Vec::new(),
            inner,
        }
    }
}

impl<W: Write + Send> Write for StripAnsiWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=i).collect();
            self.inner.write_all(&strip_ansi_bytes(&line))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let rest: Vec<u8> = self.buffer.drain(..).collect();
            self.inner.write_all(&strip_ansi_bytes(&rest))?;
        }
        self.inner.flush()
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub max_files: usize,
    pub level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
            max_files: 5,
            level: Level::INFO,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_max_files(mut self, count: usize) -> Self {
        self.max_files = count;
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

pub fn init_logging(program_name: &str, config: LogConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", config.log_dir))?;

    let log_file_name = format!("{}.log", program_name);
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &log_file_name);
    let file_writer = Mutex::new(StripAnsiWriter::new(file_appender));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},pixly_core={}",
            program_name, config.level, config.level
        ))
    });

    // File: stable prefix width (no thread ids / line numbers) so message
    // bodies align.
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_line_number(false);

    // Stderr: warnings and errors only, message-first.
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .with_line_number(false)
        .without_time()
        .with_filter(filter_fn(|meta| *meta.level() <= Level::WARN));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {}", e))?;

    tracing::info!(
        program = program_name,
        log_dir = ?config.log_dir,
        level = ?config.level,
        "Logging initialized"
    );

    cleanup_old_logs(&config.log_dir, program_name, config.max_files)?;
    Ok(())
}

fn cleanup_old_logs(log_dir: &Path, program_name: &str, max_files: usize) -> Result<()> {
    let entries = std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory: {:?}", log_dir))?;

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(program_name) && name.contains(".log") {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    if log_files.len() > max_files {
        log_files.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in log_files.iter().skip(max_files) {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = ?path, error = %e, "Failed to remove old log file");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_strip_ansi() {
        let colored = b"\x1b[92mgreen\x1b[0m plain";
        assert_eq!(strip_ansi_bytes(colored), b"green plain");
        assert_eq!(strip_ansi_bytes(b"no escapes"), b"no escapes");
    }

    #[test]
    fn test_strip_ansi_writer_line_buffered() {
        let mut out: Vec<u8> = Vec::new();
        {
            let mut w = StripAnsiWriter::new(&mut out);
            w.write_all(b"\x1b[1mpartial").unwrap();
            w.write_all(b" line\x1b[0m\nnext").unwrap();
            w.flush().unwrap();
        }
        assert_eq!(out, b"partial line\nnext");
    }

    #[test]
    fn test_log_config_builder() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LogConfig::new()
            .with_log_dir(dir.path())
            .with_max_files(3)
            .with_level(Level::DEBUG);
        assert_eq!(config.log_dir, dir.path());
        assert_eq!(config.max_files, 3);
        assert_eq!(config.level, Level::DEBUG);
    }

    #[test]
    fn test_cleanup_old_logs_keeps_newest() {
        let dir = tempfile::TempDir::new().unwrap();
        for i in 0..8 {
            let path = dir.path().join(format!("pixly.log.2026-01-0{}", i + 1));
            fs::write(&path, "log").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        cleanup_old_logs(dir.path(), "pixly", 3).unwrap();
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 3);
    }
}
