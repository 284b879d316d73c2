//! Flood detection: a rolling one-second receive counter per connection.

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Counts receive events in a lazily reset one-second window.
///
/// Owned by a single receive path; no synchronisation needed.
#[derive(Debug)]
pub struct ConnectionMonitor {
    max_per_second: u32,
    window_start: Instant,
    count: u32,
}

impl ConnectionMonitor {
    /// `max_per_second == 0` disables the check.
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Count one receive event now. Returns `false` once the ceiling is crossed.
    pub fn record_receive(&mut self) -> bool {
        self.record_receive_at(Instant::now())
    }

    /// Count one receive event at `now`.
    pub fn record_receive_at(&mut self, now: Instant) -> bool {
        if self.max_per_second == 0 {
            return true;
        }
        if now.saturating_duration_since(self.window_start) > WINDOW {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.max_per_second
    }

    /// Events counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max_per_second(&self) -> u32 {
        self.max_per_second
    }
}
