//! Jittered periodic interval for the watcher's full-resync timer (§4.9,
//! §6 `ResyncIntervalSecs`).
//!
//! A fleet of agents configured with the same resync interval would
//! otherwise all wake and re-read the same keys in lockstep; each tick is
//! jittered independently by up to ±20% so load spreads out over time.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

// Layer 3: Internal module imports
// (none)

const JITTER_FRACTION: f64 = 0.20;

/// A periodic timer whose tick interval is jittered ±20% around a base
/// duration, reseeded on every tick rather than computed once up front.
pub struct JitteredInterval {
    base: Duration,
    rng: SmallRng,
}

impl JitteredInterval {
    /// Create a new jittered interval around `base`.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Sleep for one jittered tick.
    pub async fn tick(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    /// Compute (without sleeping) the delay for the next tick, jittered
    /// uniformly within ±20% of the base duration. Exposed separately
    /// from [`tick`](Self::tick) so tests can assert on the distribution
    /// without actually waiting.
    pub fn next_delay(&mut self) -> Duration {
        let base_secs = self.base.as_secs_f64();
        let jitter = self.rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered_secs = (base_secs * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_secs(60);
        let mut interval = JitteredInterval::new(base);

        for _ in 0..200 {
            let delay = interval.next_delay();
            assert!(delay >= Duration::from_secs_f64(48.0));
            assert!(delay <= Duration::from_secs_f64(72.0));
        }
    }
}
