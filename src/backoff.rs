//! Exponential backoff for reconnect loops

use std::time::Duration;

/// A retry delay sequence that doubles on each attempt up to a cap,
/// with a small jitter so that replicas do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    base: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    /// Construct a backoff starting at `base` and capped at `max_delay`.
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            current: base,
            base,
            max_delay,
        }
    }

    /// The next delay to wait for.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max_delay);
        self.current = self.current.saturating_mul(2).min(self.max_delay);
        delay + jitter(delay)
    }

    /// Reset the sequence after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Sleep for the next delay.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

/// Up to 25% of the delay, derived from the clock's sub-second noise.
fn jitter(delay: Duration) -> Duration {
    let span = (delay / 4).as_millis().max(1) as u64;
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % span)
}
