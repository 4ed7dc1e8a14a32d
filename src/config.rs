//! Configuration for the shared memory core.
//!
//! Everything has a sensible default; `SharedMemory::start()` is the
//! zero-configuration entry point and `SharedMemory::with_config` takes one
//! of these when a caller needs different budgets or windows.
use std::time::Duration;

/// Tunables for per-key lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum acquisition attempts before giving up
    pub max_attempts: u32,
    /// Base backoff delay, doubled per attempt
    pub base_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
    /// A lock held longer than this is considered abandoned and may be
    /// stolen by the next acquirer
    pub watchdog_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            watchdog_ttl: Duration::from_secs(5),
        }
    }
}

/// Retry budget for `atomic_update`.
///
/// Each retry repeats the whole read-modify-write cycle, including lock
/// acquisition. Delays are jittered exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of full cycles to attempt
    pub max_retries: u32,
    /// Base delay between cycles, doubled per retry
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(25),
        }
    }
}

/// Time windows for advisory conflict detection.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Two writes by different agents to the same key within this window are
    /// flagged as concurrent
    pub concurrent_write_window: Duration,
    /// A read this long after the most recent prior write is flagged stale
    pub stale_read_threshold: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            concurrent_write_window: Duration::from_millis(1000),
            stale_read_threshold: Duration::from_millis(30_000),
        }
    }
}

/// Top-level configuration for [`crate::SharedMemory`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum versions retained per key (newest kept)
    pub max_history: usize,
    /// Maximum audit log records retained (oldest dropped)
    pub audit_log_cap: usize,
    /// Lock acquisition tunables
    pub lock: LockConfig,
    /// Default retry budget for atomic updates
    pub retry: RetryConfig,
    /// Conflict detection windows
    pub conflict: ConflictConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: 50,
            audit_log_cap: 10_000,
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            conflict: ConflictConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Set the maximum number of versions retained per key.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Set the audit log cap.
    pub fn with_audit_log_cap(mut self, cap: usize) -> Self {
        self.audit_log_cap = cap;
        self
    }

    /// Replace the lock tunables.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Replace the atomic-update retry budget.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the conflict detection windows.
    pub fn with_conflict(mut self, conflict: ConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_budgets() {
        let config = MemoryConfig::default();

        assert_eq!(config.max_history, 50);
        assert_eq!(config.lock.max_attempts, 10);
        assert_eq!(config.lock.max_delay, Duration::from_millis(200));
        assert_eq!(config.lock.watchdog_ttl, Duration::from_secs(5));
        assert_eq!(
            config.conflict.concurrent_write_window,
            Duration::from_millis(1000)
        );
        assert_eq!(
            config.conflict.stale_read_threshold,
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn test_builder_overrides() {
        let config = MemoryConfig::default()
            .with_max_history(5)
            .with_lock(LockConfig {
                max_attempts: 2,
                ..LockConfig::default()
            });

        assert_eq!(config.max_history, 5);
        assert_eq!(config.lock.max_attempts, 2);
        // Unrelated defaults untouched
        assert_eq!(config.retry.max_retries, 3);
    }
}
