//! Bounded exponential backoff shared by mailbox, delivery and classifier calls.

use std::time::Duration;

use rand::Rng;

/// How many times to try an operation and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Random extra delay added to each wait, up to this much.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Start a fresh backoff sequence for one operation.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 1,
        }
    }

    /// Delay after the given failed attempt (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Iterator over the waits between attempts. Yields `None` once the
/// attempt budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Number of the attempt about to be made (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts.max(1) {
            return None;
        }
        let mut delay = self.policy.delay_for(self.attempt);
        if !self.policy.jitter.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=self.policy.jitter.as_millis() as u64);
            delay += Duration::from_millis(extra);
        }
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::default().with_jitter(Duration::ZERO)
    }

    #[test]
    fn default_allows_two_retries() {
        let delays: Vec<_> = no_jitter().backoff().collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            jitter: Duration::ZERO,
        };
        let delays: Vec<_> = policy.backoff().collect();
        assert_eq!(delays.len(), 9);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(3)));
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(3));
    }

    #[test]
    fn one_and_zero_never_retry() {
        assert_eq!(no_jitter().with_attempts(1).backoff().next(), None);
        assert_eq!(no_jitter().with_attempts(0).backoff().next(), None);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::default().with_jitter(Duration::from_millis(50));
        for _ in 0..20 {
            let d = policy.backoff().next().unwrap();
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn attempt_counter_advances() {
        let mut backoff = no_jitter().backoff();
        assert_eq!(backoff.attempt(), 1);
        backoff.next();
        assert_eq!(backoff.attempt(), 2);
    }
}
