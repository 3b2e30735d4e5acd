use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Bounded polling used while waiting for a web page or cookie store to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

impl PollPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn attempts(&self) -> std::ops::Range<u32> {
        0..self.max_attempts.max(1)
    }

    /// Sleep for the configured delay, except before the first attempt.
    pub async fn pause_before(&self, attempt: u32) {
        if attempt > 0 {
            sleep(self.delay).await;
        }
    }

    /// Run `probe` until it yields a value or the attempts run out. The probe receives the
    /// zero-based attempt number; there is no delay before the first attempt.
    pub async fn run<T, F, Fut>(&self, mut probe: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in self.attempts() {
            self.pause_before(attempt).await;
            if let Some(value) = probe(attempt).await {
                return Some(value);
            }
        }
        None
    }
}
