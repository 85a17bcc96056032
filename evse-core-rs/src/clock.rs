//! Monotonic time source for the control loop
//!
//! The engine never reads the system clock directly. Timeouts, retry
//! intervals and status debouncing are all computed from [`Clock::time_ms`],
//! so an embedded port only has to supply a millisecond tick counter.
//!
//! ```ignore
//! struct BoardClock;
//!
//! impl Clock for BoardClock {
//!     fn time_ms(&self) -> TimeMs {
//!         // Read hardware timer
//!     }
//! }
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Timestamp in milliseconds
pub type TimeMs = u64;

/// Millisecond tick source
pub trait Clock {
    /// Get current time in milliseconds
    ///
    /// Must be monotonically increasing.
    fn time_ms(&self) -> TimeMs;
}

/// Clock backed by `std::time::Instant`, counting from construction
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn time_ms(&self) -> TimeMs {
        self.origin.elapsed().as_millis() as TimeMs
    }
}

/// Manually advanced clock for tests and simulations
///
/// Clones share the same counter, so a test can keep one handle while the
/// charge point owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<TimeMs>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `ms`
    pub fn advance(&self, ms: TimeMs) {
        self.now.set(self.now.get().saturating_add(ms));
    }

    /// Jump to an absolute time (never backwards)
    pub fn set(&self, ms: TimeMs) {
        if ms >= self.now.get() {
            self.now.set(ms);
        }
    }
}

impl Clock for ManualClock {
    fn time_ms(&self) -> TimeMs {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new();
        let handle = clock.clone();

        handle.advance(1500);
        assert_eq!(clock.time_ms(), 1500);

        handle.set(1000);
        assert_eq!(clock.time_ms(), 1500);

        handle.set(4000);
        assert_eq!(clock.time_ms(), 4000);
    }
}
