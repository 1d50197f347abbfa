use std::time::Duration;

use rand::Rng;

/// Exponential restart delay with jitter.
///
/// - min: delay before the first restart
/// - max: cap for the computed delay, before jitter
/// - random_factor: the delay is stretched by up to this fraction at random
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    pub min: Duration,
    pub max: Duration,
    pub random_factor: f64,
    attempt: u32,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(30), 0.2)
    }
}

impl RestartBackoff {
    pub fn new(min: Duration, max: Duration, random_factor: f64) -> Self {
        Self {
            min,
            max: max.max(min),
            random_factor: random_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Restarts handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for `attempt` without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // Anything past 2^32 is capped anyway
        let pow = 2f64.powi(attempt.min(32) as i32);
        self.min.mul_f64(pow).min(self.max)
    }

    /// Delay before the next restart. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.random_factor == 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.random_factor);
        base.mul_f64(1.0 + jitter)
    }

    /// Start over after a pipeline ran long enough to count as healthy
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_progression_and_cap() {
        let backoff = RestartBackoff::default();
        let cases = vec![(0, 3), (1, 6), (2, 12), (3, 24), (4, 30), (40, 30)];
        for (attempt, expected_secs) in cases {
            assert_eq!(backoff.base_delay(attempt).as_secs(), expected_secs, "attempt {attempt}");
        }
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let mut backoff = RestartBackoff::default();
        for attempt in 0..6 {
            let base = backoff.base_delay(attempt);
            let delay = backoff.next_delay();
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            assert!(delay <= base.mul_f64(1.2), "attempt {attempt}: {delay:?} too long");
        }
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
