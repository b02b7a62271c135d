// Small numeric and timing helpers shared by both crates
use std::time::Instant;

use log::debug;

/// Relative float comparison: `|a - b| <= rel_tol * max(|a|, |b|)`.
/// Exactly equal values (including both zero) always compare equal.
pub fn rel_eq(a: f64, b: f64, rel_tol: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= rel_tol * a.abs().max(b.abs())
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        debug!("{msg}: {diff:.3} ms");
        diff
    }
}
