//! Reconnect backoff for the serial device.
//!
//! Pure state: each failed open grows the next delay linearly until a cap;
//! one successful open resets it. The delay returned for a failure is the
//! pre-growth value, so the very first retry waits the initial delay.

use std::time::Duration;

pub const INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const STEP: Duration = Duration::from_millis(500);
pub const MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    step: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(INITIAL_DELAY, STEP, MAX_DELAY)
    }
}

impl Backoff {
    pub fn new(initial: Duration, step: Duration, max: Duration) -> Self {
        Backoff {
            current: initial,
            initial,
            step,
            max,
        }
    }

    /// Record a failed open. Returns the delay to sleep before the next
    /// attempt, then grows the delay for the attempt after that.
    pub fn delay_before_retry(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.step).min(self.max);
        delay
    }

    /// Record a successful open.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
