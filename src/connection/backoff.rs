//! Reconnection backoff.

use std::time::{Duration, Instant};

use super::config::BackoffConfig;

/// Tracks a backoff episode: the run of consecutive failures since the last
/// successful connection.
#[derive(Debug, Clone)]
pub struct ReconnectionBackoff {
    config: BackoffConfig,
    consecutive_failures: u32,
    first_failure: Option<Instant>,
}

impl ReconnectionBackoff {
    /// Create a backoff with no failures recorded.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            first_failure: None,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay to wait after `consecutive_failures` failures.
    ///
    /// Zero failures means no wait. Otherwise the delay grows from
    /// `initial` by `multiplier` per failure, capped at `max`. With a
    /// mandatory stop, a delay that would overshoot
    /// `first_failure + mandatory_stop` is shortened to land on it (never
    /// below `initial`); once the stop has passed, no clamping applies.
    pub fn next_delay(
        &self,
        consecutive_failures: u32,
        first_failure: Option<Instant>,
        now: Instant,
    ) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (consecutive_failures - 1).min(i32::MAX as u32) as i32;
        let delay_ms = self.config.initial.as_millis() as f64 * self.config.multiplier.powi(exponent);
        let delay = if delay_ms.is_finite() {
            Duration::from_millis(delay_ms.min(self.config.max.as_millis() as f64) as u64)
        } else {
            self.config.max
        };

        match (self.config.mandatory_stop, first_failure) {
            (Some(stop), Some(first)) => {
                let elapsed = now.saturating_duration_since(first);
                if elapsed < stop && elapsed + delay > stop {
                    (stop - elapsed).max(self.config.initial)
                } else {
                    delay
                }
            }
            _ => delay,
        }
    }

    /// Record a failure and get the delay before the next attempt.
    pub fn next(&mut self) -> Duration {
        let now = Instant::now();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let first_failure = *self.first_failure.get_or_insert(now);
        self.next_delay(self.consecutive_failures, Some(first_failure), now)
    }

    /// The delay the current episode prescribes, without recording a failure.
    pub fn current_delay(&self) -> Duration {
        self.next_delay(self.consecutive_failures, self.first_failure, Instant::now())
    }

    /// End the episode.
    pub fn mark_success(&mut self) {
        self.consecutive_failures = 0;
        self.first_failure = None;
    }

    /// Failures in the current episode.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Start of the current episode.
    pub fn first_failure(&self) -> Option<Instant> {
        self.first_failure
    }
}

impl Default for ReconnectionBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(initial_ms: u64, max_ms: u64) -> ReconnectionBackoff {
        ReconnectionBackoff::new(BackoffConfig::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        ))
    }

    #[test]
    fn test_exponential_sequence() {
        let b = backoff(100, 1_000);
        let now = Instant::now();
        assert_eq!(b.next_delay(0, None, now), Duration::ZERO);
        assert_eq!(b.next_delay(1, Some(now), now), Duration::from_millis(100));
        assert_eq!(b.next_delay(2, Some(now), now), Duration::from_millis(200));
        assert_eq!(b.next_delay(3, Some(now), now), Duration::from_millis(400));
        assert_eq!(b.next_delay(10, Some(now), now), Duration::from_millis(1_000)); // Capped at max
        assert_eq!(b.next_delay(u32::MAX, Some(now), now), Duration::from_millis(1_000));
    }

    #[test]
    fn test_non_decreasing_up_to_cap() {
        let b = backoff(50, 30_000);
        let now = Instant::now();
        let mut previous = Duration::ZERO;
        for failures in 0..64 {
            let delay = b.next_delay(failures, Some(now), now);
            assert!(delay >= previous, "delay shrank at {failures} failures");
            assert!(delay <= Duration::from_millis(30_000));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(30_000));
    }

    #[test]
    fn test_mark_success_resets_episode() {
        let mut b = backoff(100, 10_000);
        assert_eq!(b.next(), Duration::from_millis(100));
        assert_eq!(b.next(), Duration::from_millis(200));
        assert_eq!(b.consecutive_failures(), 2);
        assert!(b.first_failure().is_some());

        b.mark_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert!(b.first_failure().is_none());
        assert_eq!(b.current_delay(), Duration::ZERO);
        assert_eq!(b.next(), Duration::from_millis(100));
    }

    #[test]
    fn test_mandatory_stop_clamps_delay() {
        let b = ReconnectionBackoff::new(
            BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(60))
                .with_mandatory_stop(Duration::from_millis(1_000)),
        );
        let first = Instant::now();
        let now = first + Duration::from_millis(700);

        // 800ms would overshoot the stop at 1000ms; land on it instead.
        assert_eq!(b.next_delay(4, Some(first), now), Duration::from_millis(300));

        // Never below the initial delay.
        let late = first + Duration::from_millis(950);
        assert_eq!(b.next_delay(4, Some(first), late), Duration::from_millis(100));

        // Past the stop, plain exponential growth.
        let after = first + Duration::from_millis(1_500);
        assert_eq!(b.next_delay(4, Some(first), after), Duration::from_millis(800));
    }
}
