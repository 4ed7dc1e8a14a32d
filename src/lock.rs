//! Cooperative per-key locks for the shared memory write path.
//!
//! Writes to a single key are serialized by acquiring its lock before the
//! critical section. Acquisition is optimistic: try, and on contention back
//! off with jittered exponential delays for a bounded number of attempts.
//!
//! Two properties matter here:
//!
//! - Acquisition goes through the `DashMap` entry API, so the check and the
//!   set are one atomic step. There is no check-then-set window even under
//!   true parallelism.
//! - A lock held longer than the watchdog TTL is treated as abandoned and
//!   stolen by the next acquirer, so a stuck holder can never deadlock a key
//!   permanently.
//!
//! Release is RAII: the guard removes the lock on drop, success or failure.
use crate::config::LockConfig;
use crate::error::{MemoryError, MemoryResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State recorded for a held lock.
#[derive(Debug)]
struct Holder {
    /// The agent that acquired the lock, for diagnostics
    agent_id: String,
    /// When the lock was acquired, for the watchdog
    acquired_at: Instant,
    /// Unique token for this acquisition; release only removes the lock if
    /// the token still matches, so a stolen-and-reacquired lock is never
    /// released by the original holder's guard
    token: u64,
}

/// Registry of per-key locks.
#[derive(Debug)]
pub struct KeyLocks {
    held: Arc<DashMap<String, Holder>>,
    next_token: AtomicU64,
    config: LockConfig,
}

impl KeyLocks {
    /// Create a new lock registry.
    pub fn new(config: LockConfig) -> Self {
        Self {
            held: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
            config,
        }
    }

    /// Acquire the lock for a key, retrying with jittered backoff.
    ///
    /// Returns a guard that releases the lock on drop, or
    /// [`MemoryError::LockTimeout`] once the attempt budget is spent.
    pub async fn acquire(&self, full_key: &str, agent_id: &str) -> MemoryResult<LockGuard> {
        for attempt in 0..self.config.max_attempts {
            if let Some(guard) = self.try_acquire(full_key, agent_id) {
                return Ok(guard);
            }

            if attempt + 1 < self.config.max_attempts {
                let delay = self.backoff_delay(attempt);
                tracing::debug!(
                    full_key,
                    agent_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "lock contended, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(MemoryError::LockTimeout {
            full_key: full_key.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Try to acquire the lock without waiting.
    ///
    /// Steals the lock if the current holder has exceeded the watchdog TTL.
    pub fn try_acquire(&self, full_key: &str, agent_id: &str) -> Option<LockGuard> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let holder = Holder {
            agent_id: agent_id.to_string(),
            acquired_at: Instant::now(),
            token,
        };

        match self.held.entry(full_key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.acquired_at.elapsed() < self.config.watchdog_ttl {
                    return None;
                }
                tracing::warn!(
                    full_key,
                    stale_holder = %current.agent_id,
                    held_ms = current.acquired_at.elapsed().as_millis() as u64,
                    new_holder = agent_id,
                    "watchdog force-released stale lock"
                );
                occupied.insert(holder);
            }
        }

        Some(LockGuard {
            held: Arc::clone(&self.held),
            full_key: full_key.to_string(),
            token,
        })
    }

    /// Whether the key is currently locked.
    pub fn is_locked(&self, full_key: &str) -> bool {
        self.held.contains_key(full_key)
    }

    /// Number of locks currently held.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Exponential backoff with jitter, capped at the configured maximum.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as u64;
        let cap_ms = self.config.max_delay.as_millis() as u64;
        let exp_ms = base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(cap_ms.max(1));
        let jitter_ms = rand::thread_rng().gen_range(0..=exp_ms / 2);
        Duration::from_millis(exp_ms + jitter_ms)
    }
}

/// RAII guard for a held per-key lock.
///
/// Dropping the guard releases the lock. If the watchdog stole the lock in
/// the meantime, the drop is a no-op.
#[derive(Debug)]
pub struct LockGuard {
    held: Arc<DashMap<String, Holder>>,
    full_key: String,
    token: u64,
}

impl LockGuard {
    /// The canonical key this guard protects.
    pub fn full_key(&self) -> &str {
        &self.full_key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held
            .remove_if(&self.full_key, |_, holder| holder.token == self.token);
    }
}
