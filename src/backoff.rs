/// Poll-failure backoff.
///
/// While the backend is healthy the worker sleeps for the poll interval
/// between cycles. Each consecutive failed cycle doubles the delay, up
/// to `max_delay`. A successful cycle calls `reset()` and the cadence
/// returns to the poll interval.
use std::time::Duration;

pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    /// Consecutive failed cycles (resets on `reset()`).
    pub failures: u32,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let max_delay = max_delay.max(base_delay);
        Self {
            base_delay,
            max_delay,
            current_delay: base_delay,
            failures: 0,
        }
    }

    /// Records a failed cycle and returns how long to wait before the next one.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current_delay;
        self.failures = self.failures.saturating_add(1);
        self.current_delay = self.current_delay.saturating_mul(2).min(self.max_delay);
        delay
    }

    /// Records a healthy cycle and returns the regular poll delay.
    pub fn on_success(&mut self) -> Duration {
        self.reset();
        self.base_delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.base_delay;
        self.failures = 0;
    }
}
