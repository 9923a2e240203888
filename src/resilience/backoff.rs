//! Exponential backoff with jitter.
//!
//! Time is measured with `tokio::time`, so a paused test clock drives both the
//! delays and the elapsed-time cap.

use std::time::Duration;
use rand::Rng;
use tokio::time::Instant;

use crate::config::BackoffConfig;

/// Exponential backoff policy.
///
/// Each call to [`next_backoff`](Self::next_backoff) yields the current
/// interval with jitter applied, then grows the interval by `multiplier`
/// up to `max_interval`. With `max_elapsed_time` set, the policy gives up once
/// the cap, measured from creation or the last [`reset`](Self::reset), has
/// elapsed.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_elapsed_time: Option<Duration>,
    current_interval: Duration,
    started_at: Instant,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_elapsed_time: None,
            current_interval: initial_interval,
            started_at: Instant::now(),
        }
    }

    /// Stop retrying once `limit` has elapsed. `None` retries forever.
    pub fn with_max_elapsed_time(mut self, limit: Option<Duration>) -> Self {
        self.max_elapsed_time = limit;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    /// Restart the interval sequence and the elapsed-time clock.
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.started_at = Instant::now();
    }

    /// Time since creation or the last reset.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Delay before the next attempt, or `None` when the policy gives up.
    ///
    /// The last delay is shortened so that the final attempt happens right at
    /// `max_elapsed_time`.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let mut delay = jitter(self.current_interval, self.randomization_factor);

        if let Some(limit) = self.max_elapsed_time {
            let elapsed = self.elapsed();
            if elapsed >= limit {
                return None;
            }
            delay = delay.min(limit - elapsed);
        }

        let grown = self.current_interval.as_secs_f64() * self.multiplier;
        self.current_interval = if grown >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };

        Some(delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for ExponentialBackoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_interval_ms),
            Duration::from_millis(config.max_interval_ms),
        )
        .with_multiplier(config.multiplier)
        .with_randomization_factor(config.randomization_factor)
    }
}

/// Spread `interval` uniformly over `[interval * (1 - factor), interval * (1 + factor)]`.
fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }

    let base = interval.as_secs_f64();
    let delta = base * factor.min(1.0);
    let secs = rand::thread_rng().gen_range((base - delta)..=(base + delta));
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
    }

    #[test]
    fn test_backoff_grows_until_max() {
        let mut backoff = fixed(100, 1000);

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(800)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_secs(10))
            .with_randomization_factor(0.5);

        let delay = backoff.next_backoff().unwrap();
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_elapsed_time_stops_retries() {
        let mut backoff = fixed(100, 100).with_max_elapsed_time(Some(Duration::from_millis(350)));

        let mut attempts = 0;
        while let Some(delay) = backoff.next_backoff() {
            tokio::time::sleep(delay).await;
            attempts += 1;
        }

        assert_eq!(attempts, 4);
        assert!(backoff.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_delay_lands_on_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(20), Duration::from_secs(60))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(Some(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(45)).await;
        let delay = backoff.next_backoff().unwrap();
        assert!(delay <= Duration::from_secs(15));
        assert!(delay > Duration::from_secs(14));

        tokio::time::sleep(delay).await;
        assert_eq!(backoff.next_backoff(), None);
        assert!(backoff.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_clock() {
        let mut backoff = fixed(100, 100).with_max_elapsed_time(Some(Duration::from_millis(150)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }
}
