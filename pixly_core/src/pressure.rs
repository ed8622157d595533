//! System pressure sampling.
//!
//! Drives the optional encoder-gate adjustment: observe load and free memory
//! on an interval, widen the gate when there is headroom, narrow it when the
//! box is struggling. Adjustment only changes future grants - in-flight
//! encoders always run to completion.

use std::time::Duration;

use crate::cancel::CancelToken;
use crate::gate::EncoderGate;

/// Sampling cadence for the monitor loop.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Below this much free memory the gate narrows regardless of load.
const LOW_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct PressureSample {
    /// 1-minute load average normalized by core count (1.0 = fully busy).
    pub normalized_load: f64,
    pub available_memory: Option<u64>,
}

impl PressureSample {
    pub fn take() -> Self {
        Self {
            normalized_load: normalized_load(),
            available_memory: available_memory(),
        }
    }

    /// The encoder slots this sample argues for, between 1 and `max`.
    pub fn recommended_capacity(&self, max: usize) -> usize {
        if let Some(avail) = self.available_memory {
            if avail < LOW_MEMORY_BYTES {
                return 1;
            }
        }
        if self.normalized_load > 1.5 {
            return (max / 4).max(1);
        }
        if self.normalized_load > 1.0 {
            return (max / 2).max(1);
        }
        max
    }
}

fn normalized_load() -> f64 {
    let cores = num_cpus::get().max(1) as f64;
    load_average_1m().map(|l| l / cores).unwrap_or(0.0)
}

#[cfg(unix)]
fn load_average_1m() -> Option<f64> {
    let mut loads = [0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n >= 1 {
        Some(loads[0])
    } else {
        None
    }
}

#[cfg(not(unix))]
fn load_average_1m() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn available_memory() -> Option<u64> {
    // Free page count via sysctl; coarse but enough for a headroom check.
    let mut pages: u64 = 0;
    let mut size = std::mem::size_of::<u64>();
    let name = std::ffi::CString::new("vm.page_free_count").ok()?;
    let rc = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            &mut pages as *mut u64 as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == 0 {
        Some(pages * 4096)
    } else {
        None
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn available_memory() -> Option<u64> {
    None
}

/// Monitor loop body: sample, retarget the gate, sleep, until cancelled.
/// Runs on its own thread for the lifetime of a run.
pub fn monitor_pressure(gate: &EncoderGate, max_capacity: usize, cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        let sample = PressureSample::take();
        let target = sample.recommended_capacity(max_capacity);
        if target != gate.capacity() {
            tracing::debug!(
                load = format!("{:.2}", sample.normalized_load),
                available_mb = sample.available_memory.map(|b| b / (1024 * 1024)),
                target,
                "Pressure sample"
            );
        }
        gate.set_capacity(target);

        // Sleep in short slices so cancellation is prompt.
        let deadline = std::time::Instant::now() + SAMPLE_INTERVAL;
        while std::time::Instant::now() < deadline {
            if cancel.is_cancelled() {
                return;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_never_panics() {
        let sample = PressureSample::take();
        assert!(sample.normalized_load >= 0.0);
    }

    #[test]
    fn test_recommendation_under_low_memory() {
        let sample = PressureSample {
            normalized_load: 0.1,
            available_memory: Some(100 * 1024 * 1024),
        };
        assert_eq!(sample.recommended_capacity(8), 1);
    }

    #[test]
    fn test_recommendation_by_load() {
        let relaxed = PressureSample {
            normalized_load: 0.3,
            available_memory: Some(8 * 1024 * 1024 * 1024),
        };
        assert_eq!(relaxed.recommended_capacity(8), 8);

        let busy = PressureSample {
            normalized_load: 1.2,
            available_memory: Some(8 * 1024 * 1024 * 1024),
        };
        assert_eq!(busy.recommended_capacity(8), 4);

        let thrashing = PressureSample {
            normalized_load: 2.5,
            available_memory: Some(8 * 1024 * 1024 * 1024),
        };
        assert_eq!(thrashing.recommended_capacity(8), 2);
    }

    #[test]
    fn test_recommendation_floor_is_one() {
        let thrashing = PressureSample {
            normalized_load: 5.0,
            available_memory: None,
        };
        assert_eq!(thrashing.recommended_capacity(1), 1);
    }

    #[test]
    fn test_monitor_stops_on_cancel() {
        let gate = EncoderGate::new(4);
        let cancel = CancelToken::new();
        cancel.cancel();
        // Returns immediately; a hang here would wedge the whole test run.
        monitor_pressure(&gate, 4, &cancel);
    }
}
