use serde::Deserialize;
use std::time::Duration;

/// Retry budget and exponential backoff for aborted transactions.
///
/// Carried by value inside `DriverConfig`; there is no process-wide default
/// beyond `RetryPolicy::default()`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of restarts after an abort (0 = never retry)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

const fn default_max_retries() -> u32 { 10 }
const fn default_initial_backoff_ms() -> u64 { 20 }
const fn default_max_backoff_ms() -> u64 { 32_000 }
const fn default_multiplier() -> f64 { 1.3 }
const fn default_jitter() -> bool { true }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Retries without waiting; used by tests and the shell.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter: false,
            ..Default::default()
        }
    }

    /// Delay before restart number `retry` (1-based).
    ///
    /// `initial * multiplier^(retry-1)`, capped at `max_backoff_ms`. With
    /// jitter the delay is drawn uniformly from `[d/2, d]`.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64);
        let scaled = (self.initial_backoff_ms as f64) * self.multiplier.max(1.0).powi(exponent as i32);
        let capped = if scaled.is_finite() {
            (scaled as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        };
        let millis = if self.jitter && capped > 1 {
            let half = capped / 2;
            half + fastrand::u64(0..=capped - half)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Whether another restart is allowed after `retries` restarts so far.
    #[must_use]
    pub const fn allows(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_without_jitter_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            multiplier: 2.0,
            jitter: false,
        };
        let delays: Vec<u64> = (1..=6).map(|r| policy.backoff(r).as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            multiplier: 1.0,
            jitter: true,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = policy.backoff(3).as_millis();
            assert!((50..=100).contains(&d), "{d}");
        }
    }

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::immediate(2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        assert!(!RetryPolicy::no_retry().allows(0));
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }
}
