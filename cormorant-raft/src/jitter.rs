//! Randomized election timeouts.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Rolls jittered election timeouts in `[base, 2 * base)`.
///
/// Each group gets its own jitter so that simultaneous timer fires across
/// groups (and across nodes of one group) are improbable.
#[derive(Debug, Clone)]
pub struct TimeoutJitter {
    base: Duration,
}

impl TimeoutJitter {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// The un-jittered base timeout.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Roll a fresh timeout.
    pub fn next_duration(&self) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..base_ms.max(1));
        self.base + Duration::from_millis(jitter_ms)
    }

    /// The deadline a timer armed now would fire at.
    pub fn next_deadline(&self) -> Instant {
        Instant::now() + self.next_duration()
    }
}
