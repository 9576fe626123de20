//! Bridge configuration, read once from the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

/// Exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Store attempts per intent before it is marked failed.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_backoff: Duration::from_millis(50), max_backoff: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_backoff.saturating_mul(1u32 << shift).min(self.max_backoff)
    }

    /// Sum of every delay an intent can wait before it is marked failed.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|a| self.delay(a)).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
    /// Terminal statuses retained per identity.
    pub status_history: usize,
    /// How long a deleted, idle identity keeps its ledger slot.
    pub slot_retention: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            status_history: 64,
            slot_retention: Duration::from_secs(600),
        }
    }
}

impl BridgeConfig {
    /// `INTENT_SWEEP_MS`, `INTENT_RETRY_MAX`, `INTENT_BACKOFF_BASE_MS`,
    /// `INTENT_BACKOFF_MAX_MS`, `INTENT_STATUS_HISTORY`, `INTENT_SLOT_RETENTION_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sweep_interval: Duration::from_millis(env_u64("INTENT_SWEEP_MS", d.sweep_interval.as_millis() as u64).max(1)),
            retry: RetryPolicy {
                max_attempts: env_u64("INTENT_RETRY_MAX", d.retry.max_attempts as u64).clamp(1, u32::MAX as u64) as u32,
                base_backoff: Duration::from_millis(env_u64("INTENT_BACKOFF_BASE_MS", d.retry.base_backoff.as_millis() as u64)),
                max_backoff: Duration::from_millis(env_u64("INTENT_BACKOFF_MAX_MS", d.retry.max_backoff.as_millis() as u64)),
            },
            status_history: env_u64("INTENT_STATUS_HISTORY", d.status_history as u64).max(1) as usize,
            slot_retention: Duration::from_millis(env_u64("INTENT_SLOT_RETENTION_MS", d.slot_retention.as_millis() as u64)),
        }
    }

    /// Upper bound between an accepted intent and its effect being observable
    /// in the store, assuming the store recovers: the intent's own retries plus
    /// one sweep per attempt for the sweep-driven retries that follow.
    pub fn convergence_bound(&self) -> Duration {
        self.retry.total_backoff() + self.sweep_interval.saturating_mul(self.retry.max_attempts.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy { max_attempts: 6, base_backoff: Duration::from_millis(100), max_backoff: Duration::from_millis(500) };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(500));
        assert_eq!(p.delay(60), Duration::from_millis(500));
        assert_eq!(p.total_backoff(), Duration::from_millis(100 + 200 + 400 + 500 + 500));
    }

    #[test]
    fn convergence_bound_covers_retries_and_sweeps() {
        let c = BridgeConfig {
            sweep_interval: Duration::from_millis(100),
            retry: RetryPolicy { max_attempts: 2, base_backoff: Duration::from_millis(10), max_backoff: Duration::from_millis(10) },
            status_history: 8,
            slot_retention: Duration::from_secs(1),
        };
        assert_eq!(c.convergence_bound(), Duration::from_millis(10 + 200));
    }
}
