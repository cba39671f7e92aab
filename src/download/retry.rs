//! Bounded exponential backoff for transient network failures

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

/// How many attempts a download gets and how long to wait between them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::new(RetryStrategy::Linear, 1, Duration::ZERO)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31);
                let factor = 1u128 << shift;
                let scaled = self.base_delay.as_millis().saturating_mul(factor);
                Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64)
            }
        };
        match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        }
    }
}

/// Per-call retry state
#[derive(Debug)]
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    /// Retries consumed so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_and_caps() {
        let policy = RetryPolicy::exponential(6, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        let mut handle = policy.handle();
        let delays: Vec<u64> = std::iter::from_fn(|| handle.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(handle.attempts(), 5);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert!(RetryPolicy::none().handle().next_delay().is_none());
        assert!(RetryPolicy::exponential(0, Duration::from_secs(1))
            .handle()
            .next_delay()
            .is_none());
    }

    #[test]
    fn test_linear() {
        let mut handle = RetryPolicy::linear(3, Duration::from_millis(10)).handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), None);
    }
}
