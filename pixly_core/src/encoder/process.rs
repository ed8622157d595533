//! Child process control for external encoders.
//!
//! Every encoder runs under two clocks: a wall-clock ceiling scaled by input
//! size, and a stall watchdog that kills a process whose output file stops
//! growing mid-write. stdout/stderr are drained concurrently into bounded
//! ring buffers - an encoder that floods a 64KB pipe buffer must never
//! deadlock a worker, and only the tail is ever surfaced.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::errors::{PixlyError, Result};

/// Keep at most this many trailing lines of tool chatter.
const RING_LINES: usize = 64;
/// And at most this many bytes of them.
const RING_BYTES: usize = 8 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace between terminate and kill.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Wall-clock ceiling for one encoder process: base + 1s/MB, hard-capped.
pub fn encode_ceiling(
    input_size: u64,
    base_secs: u64,
    per_mb_secs: u64,
    cap_secs: u64,
) -> Duration {
    let mb = input_size / (1024 * 1024);
    Duration::from_secs((base_secs + mb.saturating_mul(per_mb_secs)).min(cap_secs))
}

#[derive(Debug, Clone)]
pub struct ProcessLimits {
    pub wall_clock: Duration,
    /// Kill once the output stops growing for this long (only armed after
    /// the first byte lands - encoders legitimately compute before writing).
    pub stall_window: Duration,
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stderr_tail: String,
    pub elapsed: Duration,
}

/// Bounded tail collector for one pipe.
fn drain_tail<R: Read + Send + 'static>(pipe: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut ring: VecDeque<String> = VecDeque::with_capacity(RING_LINES);
        let mut bytes = 0usize;
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(std::result::Result::ok) {
            bytes += line.len() + 1;
            ring.push_back(line);
            while ring.len() > RING_LINES || bytes > RING_BYTES {
                if let Some(dropped) = ring.pop_front() {
                    bytes = bytes.saturating_sub(dropped.len() + 1);
                } else {
                    break;
                }
            }
        }
        ring.into_iter().collect::<Vec<_>>().join("\n")
    })
}

/// Terminate politely, wait a short grace, then kill.
fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Run one external tool to completion under the given limits.
///
/// `watched_output` is the file the stall watchdog samples; pass the temp
/// output path the tool is expected to write.
pub fn run_tool(
    tool: &str,
    mut command: Command,
    watched_output: &Path,
    limits: &ProcessLimits,
    cancel: &CancelToken,
) -> Result<ToolOutput> {
    tracing::info!(tool, command = ?command, "Spawning external tool");

    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PixlyError::EncoderMissing {
                    tool: tool.to_string(),
                    hint: format!("install {} and make sure it is on PATH", tool),
                }
            } else {
                PixlyError::Io(e)
            }
        })?;

    let stdout_thread = child.stdout.take().map(drain_tail);
    let stderr_thread = child.stderr.take().map(drain_tail);

    let mut watchdog = StallWatchdog::new(watched_output.to_path_buf(), limits.stall_window);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                terminate_child(&mut child);
                join_tails(stdout_thread, stderr_thread);
                return Err(PixlyError::Io(e));
            }
        }

        if cancel.is_cancelled() {
            tracing::info!(tool, "Cancellation requested, terminating encoder");
            terminate_child(&mut child);
            join_tails(stdout_thread, stderr_thread);
            return Err(PixlyError::Cancelled);
        }

        if started.elapsed() > limits.wall_clock {
            tracing::warn!(
                tool,
                limit_secs = limits.wall_clock.as_secs(),
                "Encoder exceeded wall-clock ceiling, killing"
            );
            terminate_child(&mut child);
            join_tails(stdout_thread, stderr_thread);
            return Err(PixlyError::EncoderTimeout {
                tool: tool.to_string(),
                limit_secs: limits.wall_clock.as_secs(),
            });
        }

        if watchdog.stalled() {
            tracing::warn!(
                tool,
                stall_secs = limits.stall_window.as_secs(),
                "Encoder output stopped growing, killing"
            );
            terminate_child(&mut child);
            join_tails(stdout_thread, stderr_thread);
            return Err(PixlyError::EncoderTimeout {
                tool: tool.to_string(),
                limit_secs: limits.stall_window.as_secs(),
            });
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    let elapsed = started.elapsed();
    let (_, stderr_tail) = join_tails(stdout_thread, stderr_thread);

    if status.success() {
        tracing::info!(
            tool,
            elapsed_secs = elapsed.as_secs_f64(),
            exit_code = status.code(),
            "External tool completed"
        );
    } else {
        tracing::error!(
            tool,
            elapsed_secs = elapsed.as_secs_f64(),
            exit_code = status.code(),
            stderr_tail = %stderr_tail,
            "External tool failed"
        );
    }

    Ok(ToolOutput {
        status,
        stderr_tail,
        elapsed,
    })
}

fn join_tails(
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
) -> (String, String) {
    let out = stdout.and_then(|t| t.join().ok()).unwrap_or_default();
    let err = stderr.and_then(|t| t.join().ok()).unwrap_or_default();
    (out, err)
}

/// Samples an output file; fires once the size has been flat for the window
/// after writing began.
struct StallWatchdog {
    path: PathBuf,
    window: Duration,
    last_size: u64,
    last_change: Instant,
    writing_started: bool,
}

impl StallWatchdog {
    fn new(path: PathBuf, window: Duration) -> Self {
        Self {
            path,
            window,
            last_size: 0,
            last_change: Instant::now(),
            writing_started: false,
        }
    }

    fn stalled(&mut self) -> bool {
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size != self.last_size {
            self.last_size = size;
            self.last_change = Instant::now();
            if size > 0 {
                self.writing_started = true;
            }
            return false;
        }
        self.writing_started && self.last_change.elapsed() > self.window
    }
}
