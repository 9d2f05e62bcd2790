// Backoff between broker reconnect attempts: 1s, doubling, capped at 60s.
// Optionally bounded by a number of attempts.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_MULTIPLIER: u32 = 2;

/// What happened to one `wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// The delay elapsed; try again.
    Ready,
    /// All allowed attempts have been used.
    Exhausted,
    /// Shutdown started while waiting.
    Cancelled,
}

pub struct ErrorThrottler {
    current_delay: Duration,
    attempts: u32,
    /// `None` keeps retrying forever.
    max_attempts: Option<u32>,
}

impl ErrorThrottler {
    pub fn new() -> Self {
        Self {
            current_delay: MIN_BACKOFF,
            attempts: 0,
            max_attempts: None,
        }
    }

    /// Bound the number of attempts; 0 means unbounded.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            ..Self::new()
        }
    }

    /// Back to the minimum delay with a fresh attempt budget.
    pub fn reset(&mut self) {
        self.current_delay = MIN_BACKOFF;
        self.attempts = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Attempts started since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }

    /// Sleep for the current delay, then count one attempt and grow the delay.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Throttle {
        if self.is_exhausted() {
            return Throttle::Exhausted;
        }

        let delay = self.current_delay;
        tracing::warn!(
            "Reconnect attempt {} in {:.1}s",
            self.attempts + 1,
            delay.as_secs_f64()
        );

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        };
        if !completed {
            return Throttle::Cancelled;
        }

        self.attempts += 1;
        self.increment();
        Throttle::Ready
    }

    fn increment(&mut self) {
        self.current_delay = self
            .current_delay
            .saturating_mul(BACKOFF_MULTIPLIER)
            .min(MAX_BACKOFF);
    }
}

impl Default for ErrorThrottler {
    fn default() -> Self {
        Self::new()
    }
}
