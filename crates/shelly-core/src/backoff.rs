// ── Reconnect backoff ──

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponent cap; `2^16` seconds already dwarfs any sane `max_delay`.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff with jitter across consecutive failed attempts.
///
/// `delay = min(initial * 2^attempt * (1 + jitter), max)`, where jitter is
/// in `[0, 0.25]` and derived from the attempt number. Successive delays
/// never decrease until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
    floor: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            floor: Duration::ZERO,
        }
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `true` once `max_retries` attempts have been used up.
    pub fn exhausted(&self) -> bool {
        self.config
            .max_retries
            .is_some_and(|max| self.attempt >= max)
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt.min(MAX_EXPONENT)).unwrap_or(0);
        let max = self.config.max_delay.as_secs_f64();
        let base = (self.config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent)).min(max);

        // Deterministic jitter seeded from the attempt number, always
        // non-negative so the sequence cannot dip.
        let jitter = 0.25 * (f64::from(self.attempt) * 7.3).sin().abs();
        let delay = Duration::from_secs_f64((base * (1.0 + jitter)).min(max).max(0.0));

        let delay = delay.max(self.floor);
        self.floor = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the minimum delay, after the session reached `Ready`.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.floor = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retries: None,
        }
    }

    #[test]
    fn delays_never_decrease() {
        let mut backoff = Backoff::new(config());
        let mut prev = Duration::ZERO;
        for _ in 0..40 {
            let d = backoff.next_delay();
            assert!(d >= prev, "{d:?} < {prev:?}");
            prev = d;
        }
    }

    #[test]
    fn delays_are_capped() {
        let mut backoff = Backoff::new(config());
        for _ in 0..40 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[test]
    fn first_delay_starts_at_initial() {
        let mut backoff = Backoff::new(config());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert!(backoff.next_delay() >= Duration::from_millis(200));
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = Backoff::new(config());
        for _ in 0..6 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 6);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn exhausted_after_max_retries() {
        let mut backoff = Backoff::new(ReconnectConfig {
            max_retries: Some(2),
            ..config()
        });
        assert!(!backoff.exhausted());
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.exhausted());
    }
}
