//! Counting gate for encoder processes.
//!
//! A secondary cap below worker count: workers can keep probing and
//! predicting while encoder slots are saturated. Capacity is adjustable at
//! runtime (the pressure monitor grows it when the system has headroom,
//! shrinks it when not) - shrinking never cancels in-flight work, it only
//! delays the next grant.

use std::sync::{Condvar, Mutex};

struct GateState {
    capacity: usize,
    in_flight: usize,
}

pub struct EncoderGate {
    state: Mutex<GateState>,
    available: Condvar,
}

impl EncoderGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                capacity: capacity.max(1),
                in_flight: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Block until a slot is free. The guard returns it on drop.
    pub fn acquire(&self) -> EncoderPermit<'_> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.in_flight >= state.capacity {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.in_flight += 1;
        EncoderPermit { gate: self }
    }

    /// Retarget the capacity. Growing wakes waiters immediately; shrinking
    /// lets in-flight work finish and simply stops granting new slots until
    /// the count falls below the new cap.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = capacity.max(1);
        if capacity != state.capacity {
            tracing::info!(
                old = state.capacity,
                new = capacity,
                in_flight = state.in_flight,
                "Encoder gate capacity adjusted"
            );
            state.capacity = capacity;
            self.available.notify_all();
        }
    }

    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .capacity
    }

    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight = state.in_flight.saturating_sub(1);
        self.available.notify_one();
    }
}

pub struct EncoderPermit<'a> {
    gate: &'a EncoderGate,
}

impl Drop for EncoderPermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_gate_bounds_concurrency() {
        let gate = Arc::new(EncoderGate::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                let _permit = gate.acquire();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_capacity_clamped_to_one() {
        let gate = EncoderGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let _permit = gate.acquire();
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn test_grow_unblocks_waiter() {
        let gate = Arc::new(EncoderGate::new(1));
        let first = gate.acquire();

        let gate2 = Arc::clone(&gate);
        let waiter = std::thread::spawn(move || {
            let _permit = gate2.acquire();
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        gate.set_capacity(2);
        waiter.join().unwrap();
        drop(first);
    }

    #[test]
    fn test_shrink_does_not_revoke_in_flight() {
        let gate = EncoderGate::new(4);
        let a = gate.acquire();
        let b = gate.acquire();
        gate.set_capacity(1);
        // Both permits stay valid; the count just drains over the new cap.
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.capacity(), 1);
    }
}
