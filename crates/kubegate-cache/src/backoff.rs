//! Refresh interval policy
//!
//! A linear backoff generator plus the online/offline rules the schema
//! refresh loop applies on top of it.

use std::time::Duration;

use rand::Rng;

use kubegate_k8s::{Error, Result};

/// Refresh period while a cluster is healthy
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Backoff increment while a cluster is offline
pub const BACKOFF_REFRESH_STEP: Duration = Duration::from_secs(10);

/// Linear interval generator: `first + attempt * step`, capped at `max`
#[derive(Clone, Debug)]
pub struct Linear {
    first: Duration,
    step: Duration,
    max: Duration,
    attempt: u32,
}

impl Linear {
    pub fn new(first: Duration, step: Duration, max: Duration) -> Result<Self> {
        if step.is_zero() {
            return Err(Error::bad_parameter("backoff step must be positive"));
        }
        if max < first {
            return Err(Error::bad_parameter(format!(
                "backoff max {:?} is below the first interval {:?}",
                max, first
            )));
        }
        Ok(Self {
            first,
            step,
            max,
            attempt: 0,
        })
    }

    pub fn duration(&self) -> Duration {
        self.step
            .checked_mul(self.attempt)
            .and_then(|inc| self.first.checked_add(inc))
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn inc(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Add up to a seventh of `interval` as random jitter
pub fn seventh_jitter(interval: Duration) -> Duration {
    let max_jitter = u64::try_from(interval.as_nanos() / 7).unwrap_or(u64::MAX);
    if max_jitter == 0 {
        return interval;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    interval.saturating_add(Duration::from_nanos(jitter))
}

/// Interval policy of the schema refresh loop.
///
/// Healthy clusters are checked every `baseline`. The first failure after a
/// healthy period drops the interval to `step` so recovery is noticed
/// quickly; every further failure adds `step`, up to `baseline` again. A
/// success restores `baseline`.
#[derive(Clone, Debug)]
pub struct RefreshBackoff {
    linear: Linear,
    baseline: Duration,
    step: Duration,
}

impl RefreshBackoff {
    pub fn new(baseline: Duration, step: Duration) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(baseline, step, baseline)?,
            baseline,
            step,
        })
    }

    /// Current interval before jitter
    pub fn interval(&self) -> Duration {
        self.linear.duration()
    }

    /// Jittered wait before the next attempt
    pub fn next_delay(&self) -> Duration {
        seventh_jitter(self.interval())
    }

    pub fn on_failure(&mut self) {
        // Only a transition out of the healthy baseline restarts the ramp.
        if self.linear.first == self.baseline {
            self.linear.first = self.step;
            self.linear.reset();
        } else {
            self.linear.inc();
        }
    }

    pub fn on_success(&mut self) {
        self.linear.first = self.baseline;
        self.linear.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_caps_at_max() {
        let mut linear = Linear::new(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_secs(25),
        )
        .unwrap();
        assert_eq!(linear.duration(), Duration::from_secs(10));
        linear.inc();
        assert_eq!(linear.duration(), Duration::from_secs(20));
        linear.inc();
        assert_eq!(linear.duration(), Duration::from_secs(25));
        linear.reset();
        assert_eq!(linear.duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_linear_rejects_zero_step() {
        assert!(Linear::new(Duration::from_secs(1), Duration::ZERO, Duration::from_secs(5)).is_err());
        assert!(
            Linear::new(Duration::from_secs(10), Duration::from_secs(1), Duration::from_secs(5))
                .is_err()
        );
    }

    #[test]
    fn test_seventh_jitter_bounds() {
        let interval = Duration::from_secs(70);
        for _ in 0..200 {
            let d = seventh_jitter(interval);
            assert!(d >= interval);
            assert!(d <= interval + Duration::from_secs(10));
        }
        assert_eq!(seventh_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_refresh_backoff_ramp_while_offline() {
        let mut backoff = RefreshBackoff::new(DEFAULT_REFRESH_PERIOD, BACKOFF_REFRESH_STEP).unwrap();
        assert_eq!(backoff.interval(), DEFAULT_REFRESH_PERIOD);

        backoff.on_failure();
        assert_eq!(backoff.interval(), BACKOFF_REFRESH_STEP);

        let mut previous = backoff.interval();
        for _ in 0..50 {
            backoff.on_failure();
            let current = backoff.interval();
            assert!(current >= previous);
            assert!(current <= DEFAULT_REFRESH_PERIOD);
            previous = current;
        }
        assert_eq!(previous, DEFAULT_REFRESH_PERIOD);
    }

    #[test]
    fn test_refresh_backoff_second_failure_adds_step() {
        let mut backoff = RefreshBackoff::new(DEFAULT_REFRESH_PERIOD, BACKOFF_REFRESH_STEP).unwrap();
        backoff.on_failure();
        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_secs(20));
        backoff.on_failure();
        assert_eq!(backoff.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_refresh_backoff_recovery_restores_baseline() {
        let mut backoff = RefreshBackoff::new(DEFAULT_REFRESH_PERIOD, BACKOFF_REFRESH_STEP).unwrap();
        backoff.on_failure();
        backoff.on_failure();
        backoff.on_success();
        assert_eq!(backoff.interval(), DEFAULT_REFRESH_PERIOD);

        // a fresh outage starts from the short step again
        backoff.on_failure();
        assert_eq!(backoff.interval(), BACKOFF_REFRESH_STEP);
    }
}
