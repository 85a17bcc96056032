//! Timeout policy for outstanding operations
//!
//! A [`Timeout`] is a plain value. It holds no timers of its own; the engine
//! records when an operation was last sent and when it first observed a
//! provisional signal, and asks the policy whether the wait is over.

use std::time::Duration;

use crate::clock::TimeMs;

/// Default wait for a reply to an ordinary request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Expiry rule for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Expires once the duration has passed since the last (re)send
    Fixed(Duration),
    /// Never expires
    Suppressed,
    /// Never expires before a provisional signal; afterwards behaves like
    /// `Fixed`, counted from the later of the signal and the last send
    Hybrid(Duration),
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Fixed(DEFAULT_TIMEOUT)
    }
}

impl Timeout {
    /// Whether the wait is over at `now`
    pub fn is_exceeded(&self, now: TimeMs, sent_at: TimeMs, signaled_at: Option<TimeMs>) -> bool {
        match *self {
            Timeout::Fixed(limit) => now.saturating_sub(sent_at) >= as_ms(limit),
            Timeout::Suppressed => false,
            Timeout::Hybrid(limit) => match signaled_at {
                Some(signal) => now.saturating_sub(signal.max(sent_at)) >= as_ms(limit),
                None => false,
            },
        }
    }

    /// Whether this policy can ever expire
    pub fn can_expire(&self) -> bool {
        !matches!(self, Timeout::Suppressed)
    }
}

fn as_ms(d: Duration) -> TimeMs {
    d.as_millis().min(TimeMs::MAX as u128) as TimeMs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_expires_after_duration() {
        let t = Timeout::Fixed(Duration::from_millis(500));
        assert!(!t.is_exceeded(1_000, 1_000, None));
        assert!(!t.is_exceeded(1_499, 1_000, None));
        assert!(t.is_exceeded(1_500, 1_000, None));
    }

    #[test]
    fn test_suppressed_never_expires() {
        let t = Timeout::Suppressed;
        assert!(!t.is_exceeded(u64::MAX, 0, Some(0)));
        assert!(!t.can_expire());
    }

    #[test]
    fn test_hybrid_waits_for_signal() {
        let t = Timeout::Hybrid(Duration::from_secs(1));

        // Unbounded while no signal arrived
        assert!(!t.is_exceeded(60_000, 0, None));

        // Counted from the signal
        assert!(!t.is_exceeded(60_500, 0, Some(60_000)));
        assert!(t.is_exceeded(61_000, 0, Some(60_000)));

        // A resend after the signal restarts the count
        assert!(!t.is_exceeded(61_000, 60_800, Some(60_000)));
        assert!(t.is_exceeded(61_800, 60_800, Some(60_000)));
    }

    #[test]
    fn test_clock_going_backwards_does_not_expire() {
        let t = Timeout::Fixed(Duration::from_millis(10));
        assert!(!t.is_exceeded(5, 100, None));
    }
}
