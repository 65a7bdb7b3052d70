use std::time::{Duration, Instant};

use super::{Board, Timer};

/// Board backed by the host's monotonic clock.
///
/// Serial enable/disable are no-ops: hosts using it drive `transfer` from a single
/// task and need no interrupt masking.
#[derive(Debug, Clone)]
pub struct StdClock {
    latches: [Instant; Timer::COUNT],
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            latches: [Instant::now(); Timer::COUNT],
        }
    }

    pub fn elapsed(&self, timer: Timer) -> Duration {
        self.latches[timer.index()].elapsed()
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for StdClock {
    fn time_latch(&mut self, timer: Timer) {
        self.latches[timer.index()] = Instant::now();
    }

    fn time_check_ms(&self, timer: Timer, ms: u32) -> bool {
        self.elapsed(timer) > Duration::from_millis(ms as u64)
    }
}
