//! Decorrelated-jitter exponential backoff. Each wait is drawn uniformly
//! from `[min, previous * multiplier]` and clamped to `[min, max]`, which
//! keeps retries from synchronizing across clients.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub(crate) struct BackoffPolicy {
    min: Duration,
    max: Duration,
    multiplier: f64,
    max_retries: u32,
    current: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            1.5,
            10,
        )
    }
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration, multiplier: f64, max_retries: u32) -> Self {
        BackoffPolicy {
            min,
            max,
            multiplier,
            max_retries,
            current: min,
        }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        BackoffPolicy {
            max_retries,
            ..BackoffPolicy::default()
        }
    }

    /// Draw the next wait interval and advance the policy state.
    pub fn next_interval(&mut self) -> Duration {
        let lower = self.min.as_secs_f64();
        let upper = (self.current.as_secs_f64() * self.multiplier).max(lower);
        let candidate = rand::thread_rng().gen_range(lower..=upper);
        let clamped = candidate.clamp(lower, self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(clamped);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// `true` while another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.min, Duration::from_millis(100));
        assert_eq!(policy.max, Duration::from_secs(10));
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.current, policy.min);
    }

    #[test]
    fn intervals_stay_within_bounds() {
        let mut policy = BackoffPolicy::default();
        for _ in 0..100 {
            let interval = policy.next_interval();
            assert!(interval >= Duration::from_millis(100), "{interval:?}");
            assert!(interval <= Duration::from_secs(10), "{interval:?}");
        }
    }

    #[test]
    fn candidate_never_exceeds_current_times_multiplier() {
        let mut policy = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            1.5,
            10,
        );
        let mut previous = Duration::from_millis(100);
        for _ in 0..50 {
            let interval = policy.next_interval();
            let ceiling = previous.as_secs_f64() * 1.5 + 1e-9;
            assert!(interval.as_secs_f64() <= ceiling);
            previous = interval;
        }
    }

    #[test]
    fn average_interval_is_non_decreasing_early() {
        // With multiplier 1.5 the expected interval grows until the cap is
        // reached; average over many independent sequences to smooth the
        // jitter.
        let samples = 400;
        let steps = 5;
        let mut sums = vec![0f64; steps];
        for _ in 0..samples {
            let mut policy = BackoffPolicy::default();
            for sum in sums.iter_mut() {
                *sum += policy.next_interval().as_secs_f64();
            }
        }
        for pair in sums.windows(2) {
            assert!(
                pair[1] >= pair[0] * 0.95,
                "average backoff decreased: {sums:?}"
            );
        }
    }

    #[test]
    fn reset_returns_to_min() {
        let mut policy = BackoffPolicy::default();
        for _ in 0..10 {
            policy.next_interval();
        }
        policy.reset();
        assert_eq!(policy.current, Duration::from_millis(100));
    }

    #[test]
    fn retry_budget() {
        let policy = BackoffPolicy::with_max_retries(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
