// src/clock.rs
//
// Millisecond tick source and rollover-safe deadline checks. The tick counter
// is a u32 that wraps, so every comparison goes through deadline_reached()
// instead of plain ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Poll interval used by wait().
const WAIT_POLL_MS: u64 = 10;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start, truncated to u32 (wraps every ~49.7 days).
pub fn now_ms() -> u32 {
    PROCESS_START.elapsed().as_millis() as u32
}

/// Host wall clock as (unix seconds, microseconds within the second).
pub fn unix_time() -> (u64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_micros()),
        // Pre-epoch clocks only happen on badly misconfigured hosts; a zero
        // timebase is still a usable capture.
        Err(_) => (0, 0),
    }
}

/// Whether `timeout_ms` has elapsed since `start`, given the current tick.
///
/// The deadline point may wrap past u32::MAX, so the check is an explicit
/// case analysis on whether the deadline is numerically before or after the
/// start point.
pub fn deadline_reached(start: u32, timeout_ms: u32, now: u32) -> bool {
    let deadline = start.wrapping_add(timeout_ms);
    if deadline >= start {
        now >= deadline || now < start
    } else {
        // Deadline wrapped: the window [start, u32::MAX] is still inside the
        // budget, [deadline, start) is past it.
        now >= deadline && now < start
    }
}

/// Cooperative sleep: returns early (true) when the cancel flag is raised,
/// false after `time_ms` elapsed.
pub fn wait(time_ms: u32, cancel: &Arc<AtomicBool>) -> bool {
    let start = now_ms();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return true;
        }
        if deadline_reached(start, time_ms, now_ms()) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(WAIT_POLL_MS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_without_wrap() {
        assert!(!deadline_reached(100, 50, 120));
        assert!(deadline_reached(100, 50, 150));
        assert!(deadline_reached(100, 50, 151));
    }

    #[test]
    fn deadline_when_counter_wrapped_past_start() {
        // now wrapped below start: budget is over no matter what.
        assert!(deadline_reached(100, 50, 10));
    }

    #[test]
    fn deadline_wraps_past_u32_max() {
        let start = u32::MAX - 10;
        // deadline = start + 50 wraps to 39
        assert!(!deadline_reached(start, 50, u32::MAX - 5));
        assert!(!deadline_reached(start, 50, 20));
        assert!(deadline_reached(start, 50, 39));
        assert!(deadline_reached(start, 50, 100));
    }

    #[test]
    fn wait_exits_early_on_cancel() {
        let cancel = Arc::new(AtomicBool::new(true));
        let start = std::time::Instant::now();
        assert!(wait(5_000, &cancel));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn wait_times_out() {
        let cancel = Arc::new(AtomicBool::new(false));
        assert!(!wait(20, &cancel));
    }
}
