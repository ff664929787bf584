//! Configuration for a replication.

use rand::Rng;
use std::time::Duration;

/// Configuration for one fork/master replication.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Identifier; keys checkpoints and meta documents, tags writes.
    pub identifier: String,
    /// Maximum number of documents fetched from master per page.
    pub pull_batch_size: usize,
    /// Maximum number of documents pushed to master per bulk write.
    pub push_batch_size: usize,
    /// Keep following both change streams after the initial drain.
    pub live: bool,
    /// How long the pusher collects fork changes before pushing.
    pub push_debounce: Duration,
    /// Resolution attempts per document before declaring a conflict storm.
    pub conflict_retry_budget: u32,
    /// How often a denied leadership gate is asked again.
    pub leader_poll_interval: Duration,
    /// Retry configuration for transient store failures.
    pub retry: RetryConfig,
}

impl ReplicationConfig {
    /// Creates a new live replication configuration.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            pull_batch_size: 100,
            push_batch_size: 100,
            live: true,
            push_debounce: Duration::from_millis(10),
            conflict_retry_budget: 5,
            leader_poll_interval: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: usize) -> Self {
        self.pull_batch_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets live mode.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets the push debounce window.
    pub fn with_push_debounce(mut self, debounce: Duration) -> Self {
        self.push_debounce = debounce;
        self
    }

    /// Sets the per-document conflict retry budget.
    pub fn with_conflict_retry_budget(mut self, budget: u32) -> Self {
        self.conflict_retry_budget = budget.max(1);
        self
    }

    /// Sets the leadership poll interval.
    pub fn with_leader_poll_interval(mut self, interval: Duration) -> Self {
        self.leader_poll_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Backoff for store calls that fail with a retryable error.
///
/// Each store operation is called at most `max_attempts` times. The pause
/// before retry `n` is `base_delay * 2^(n - 1)`, capped at `max_delay`.
/// Errors that are not retryable are returned on the first failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Calls per store operation, the first one included.
    pub max_attempts: u32,
    /// Pause before the first retry.
    pub base_delay: Duration,
    /// Upper bound on a single pause.
    pub max_delay: Duration,
    /// Stretch each pause by up to a quarter at random.
    pub jitter: bool,
}

impl RetryConfig {
    /// Retries up to `max_attempts - 1` times with the default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    /// Fails on the first store error.
    pub fn never() -> Self {
        Self::new(1)
    }

    /// Millisecond pauses, for tests that inject store failures.
    pub fn testing() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            jitter: false,
        }
    }

    /// Sets the pause before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Caps every pause.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables the random stretch.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns true once `attempts` calls have been made.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Pause before retry number `retry`, counted from 1.
    pub fn pause_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        let pause = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter {
            pause + pause.mul_f64(0.25 * rand::thread_rng().gen::<f64>())
        } else {
            pause
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_config_builder() {
        let config = ReplicationConfig::new("users-sync")
            .with_pull_batch_size(50)
            .with_push_batch_size(25)
            .with_live(false)
            .with_conflict_retry_budget(3);

        assert_eq!(config.identifier, "users-sync");
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.push_batch_size, 25);
        assert!(!config.live);
        assert_eq!(config.conflict_retry_budget, 3);
    }

    #[test]
    fn batch_sizes_are_never_zero() {
        let config = ReplicationConfig::new("r")
            .with_pull_batch_size(0)
            .with_push_batch_size(0)
            .with_conflict_retry_budget(0);
        assert_eq!(config.pull_batch_size, 1);
        assert_eq!(config.push_batch_size, 1);
        assert_eq!(config.conflict_retry_budget, 1);
    }

    #[test]
    fn never_allows_a_single_call() {
        let retry = RetryConfig::never();
        assert!(!retry.is_exhausted(0));
        assert!(retry.is_exhausted(1));
        assert_eq!(RetryConfig::new(0), retry);
    }

    #[test]
    fn pauses_double_until_capped() {
        let retry = RetryConfig::new(10)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(false);
        let pauses: Vec<u64> = (1..=5)
            .map(|n| retry.pause_before(n).as_millis() as u64)
            .collect();
        assert_eq!(pauses, vec![10, 20, 40, 50, 50]);
        // Shifts past the width of u32 still land on the cap.
        assert_eq!(retry.pause_before(64), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stretches_by_at_most_a_quarter() {
        let retry = RetryConfig::new(3).with_base_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let pause = retry.pause_before(1);
            assert!(pause >= Duration::from_millis(100));
            assert!(pause <= Duration::from_millis(125));
        }
    }

    #[test]
    fn testing_backoff_gives_up_within_a_tenth_of_a_second() {
        let retry = RetryConfig::testing();
        let total: Duration = (1..retry.max_attempts).map(|n| retry.pause_before(n)).sum();
        assert!(total < Duration::from_millis(100));
        assert!(retry.is_exhausted(retry.max_attempts));
    }
}
