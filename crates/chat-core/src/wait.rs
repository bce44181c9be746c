use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition held before the deadline.
    Ready,
    /// The deadline passed first.
    TimedOut,
    /// The caller cancelled the wait.
    Cancelled,
}

/// Cancellable poll-until-true with a fixed upper bound.
#[derive(Debug, Clone, Copy)]
pub struct BoundedWait {
    poll_interval: Duration,
    max_wait: Duration,
}

impl BoundedWait {
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            max_wait,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Poll `ready` until it returns `true`, the deadline passes, or `cancel` fires.
    ///
    /// The condition is checked once more at the deadline before giving up.
    pub async fn wait_until<F>(&self, cancel: &CancellationToken, mut ready: F) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + self.max_wait;
        loop {
            if ready() {
                return WaitOutcome::Ready;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

impl Default for BoundedWait {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}
