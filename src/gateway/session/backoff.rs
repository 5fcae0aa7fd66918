use std::time::Duration;

use crate::configs::BackoffConfig;

/// Exponential reconnect delay: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms.max(config.base_ms)),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    pub fn next(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 1u32 << (self.attempt - 1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts
            .is_some_and(|max| self.attempt >= max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let mut b = Backoff::new(&BackoffConfig {
            base_ms: 1_000,
            max_ms: 5_000,
            max_attempts: Some(5),
        });
        let delays: Vec<u64> = (0..5).map(|_| b.next().as_millis() as u64).collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 5_000, 5_000]);
        assert!(b.is_exhausted());

        b.reset();
        assert!(!b.is_exhausted());
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn unbounded_by_default() {
        let mut b = Backoff::new(&BackoffConfig::default());
        for _ in 0..100 {
            b.next();
        }
        assert!(!b.is_exhausted());
        assert_eq!(b.next(), Duration::from_secs(60));
    }
}
