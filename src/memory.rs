//! The shared memory facade.
//!
//! This module provides the main user-facing API for Agora's memory core.
//! It wires the storage layer, the per-key locks, and the subscription
//! manager into a single handle that agents share.
//!
//! # Design
//!
//! - **Writes are serialized per key**: every write, delete, revert, and
//!   atomic update runs its critical section under the key's cooperative
//!   lock, so two in-flight writes to one key never observe each other's
//!   intermediate state.
//! - **Reads are lock-free**: a read may land before or after a concurrent
//!   write, by design. The audit log plus the conflict detector exist to
//!   surface exactly those races after the fact.
//! - **Cheap to share**: `SharedMemory` is `Clone` and internally `Arc`ed,
//!   so every agent holds the same store.
//!
//! # Example
//!
//! ```ignore
//! use agora::SharedMemory;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let memory = SharedMemory::start();
//!
//!     memory.write("profiles", "user:1", json!({"name": "A"}), "agent-1").await?;
//!     let value = memory.read("profiles", "user:1", "agent-1").await?;
//!     assert_eq!(value, Some(json!({"name": "A"})));
//!
//!     Ok(())
//! }
//! ```
use crate::config::{MemoryConfig, RetryConfig};
use crate::conflict::{self, ConflictKind, MemoryConflict};
use crate::error::{MemoryError, MemoryResult};
use crate::lock::KeyLocks;
use crate::query::{MemoryQuery, QueryExecutor, QueryResult};
use crate::store::MemoryStore;
use crate::subscriptions::{
    MemoryEvent, MemoryEventKind, SubscriptionId, SubscriptionInfo, SubscriptionManager,
    SubscriptionScope,
};
use crate::types::{
    FullKey, MemoryEntry, Operation, OperationKind, VersionRecord,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Shared memory handle for multi-agent coordination.
#[derive(Clone)]
pub struct SharedMemory {
    store: Arc<MemoryStore>,
    locks: Arc<KeyLocks>,
    subscriptions: Arc<SubscriptionManager>,
    config: Arc<MemoryConfig>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("entries", &self.store.entry_count())
            .field("subscriptions", &self.subscriptions.count())
            .finish()
    }
}

impl SharedMemory {
    /// Start a new shared memory instance with default configuration.
    pub fn start() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Start a shared memory instance with explicit configuration.
    pub fn with_config(config: MemoryConfig) -> Self {
        let store = Arc::new(MemoryStore::new(config.max_history, config.audit_log_cap));
        let locks = Arc::new(KeyLocks::new(config.lock.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new());

        Self {
            store,
            locks,
            subscriptions,
            config: Arc::new(config),
        }
    }

    /// Rebuild an instance from restored storage (snapshot loading).
    pub(crate) fn from_store(store: MemoryStore, config: MemoryConfig) -> Self {
        Self {
            store: Arc::new(store),
            locks: Arc::new(KeyLocks::new(config.lock.clone())),
            subscriptions: Arc::new(SubscriptionManager::new()),
            config: Arc::new(config),
        }
    }

    /// Access the underlying store (snapshot persistence).
    pub(crate) fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The active configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Write a value.
    ///
    /// Acquires the per-key lock (bounded, jittered backoff), prepends a
    /// version record, appends a WRITE audit operation, and notifies
    /// subscribers. Fails with [`MemoryError::EmptyKey`] for an empty key or
    /// [`MemoryError::LockTimeout`] when the retry budget is spent.
    pub async fn write<T: Serialize>(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: T,
        agent_id: impl Into<String>,
    ) -> MemoryResult<VersionRecord> {
        self.write_with(namespace, key, value, agent_id, Map::new())
            .await
    }

    /// Write a value with caller-supplied metadata attached to the version.
    pub async fn write_with<T: Serialize>(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: T,
        agent_id: impl Into<String>,
        metadata: Map<String, JsonValue>,
    ) -> MemoryResult<VersionRecord> {
        let full_key = validated_key(namespace, key)?;
        let agent_id = agent_id.into();
        let value = serde_json::to_value(value)?;

        let _guard = self
            .locks
            .acquire(&full_key.to_canonical_string(), &agent_id)
            .await?;

        let (record, previous) =
            self.store
                .apply_write(&full_key, value, &agent_id, OperationKind::Write, metadata);

        self.store.record_operation(Operation::new(
            OperationKind::Write,
            &full_key.namespace,
            &full_key.key,
            &agent_id,
            Some(record.value().clone()),
        ));
        self.notify(
            MemoryEventKind::Write,
            &full_key,
            Some(record.value().clone()),
            previous,
            &agent_id,
            record.timestamp,
        );

        Ok(record)
    }

    /// Read the current value for a key.
    ///
    /// Returns `None` for unknown keys and for placeholder entries that have
    /// never been written. Lock-free: a read concurrent with a write may
    /// observe either the pre- or post-write value. Every read is recorded
    /// in the audit log for stale-read detection.
    pub async fn read(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> MemoryResult<Option<JsonValue>> {
        let full_key = validated_key(namespace, key)?;
        let value = self.store.read(&full_key);

        self.store.record_operation(Operation::new(
            OperationKind::Read,
            &full_key.namespace,
            &full_key.key,
            agent_id.into(),
            None,
        ));

        Ok(value)
    }

    /// Get a full snapshot of an entry, including versions and subscribers.
    pub async fn entry(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
    ) -> Option<MemoryEntry> {
        self.store.entry(&FullKey::new(namespace, key))
    }

    /// Delete an entry.
    ///
    /// Runs under the per-key lock. Returns `true` if an entry existed.
    pub async fn delete(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> MemoryResult<bool> {
        let full_key = validated_key(namespace, key)?;
        let agent_id = agent_id.into();

        let _guard = self
            .locks
            .acquire(&full_key.to_canonical_string(), &agent_id)
            .await?;

        let previous = self.store.remove(&full_key);
        let existed = previous.is_some();

        self.store.record_operation(Operation::new(
            OperationKind::Delete,
            &full_key.namespace,
            &full_key.key,
            &agent_id,
            None,
        ));
        if existed {
            self.notify(
                MemoryEventKind::Delete,
                &full_key,
                None,
                previous,
                &agent_id,
                Utc::now(),
            );
        }

        Ok(existed)
    }

    /// Get the version history for a key, newest first.
    pub async fn history(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        limit: Option<usize>,
    ) -> MemoryResult<Vec<VersionRecord>> {
        self.store.history(&FullKey::new(namespace, key), limit)
    }

    /// Restore the newest version at or before `timestamp` as the current
    /// value.
    ///
    /// This is a new write, not a rollback: the version list stays
    /// monotonic, the operation is recorded as a REVERT, and the new
    /// version's metadata names the version id it restored.
    pub async fn revert_to(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        timestamp: DateTime<Utc>,
        agent_id: impl Into<String>,
    ) -> MemoryResult<VersionRecord> {
        let full_key = validated_key(namespace, key)?;
        let agent_id = agent_id.into();

        // One lock acquisition covers both the lookup and the re-write, so
        // no other writer can slip a version in between.
        let _guard = self
            .locks
            .acquire(&full_key.to_canonical_string(), &agent_id)
            .await?;

        let target = self.store.version_at(&full_key, timestamp)?;

        let mut metadata = Map::new();
        metadata.insert("reverted_to_version".into(), json!(target.version_id));
        metadata.insert(
            "reverted_to_timestamp".into(),
            json!(target.timestamp.to_rfc3339()),
        );

        let (record, previous) = self.store.apply_write(
            &full_key,
            target.value().clone(),
            &agent_id,
            OperationKind::Revert,
            metadata,
        );

        self.store.record_operation(Operation::new(
            OperationKind::Revert,
            &full_key.namespace,
            &full_key.key,
            &agent_id,
            Some(record.value().clone()),
        ));
        self.notify(
            MemoryEventKind::Revert,
            &full_key,
            Some(record.value().clone()),
            previous,
            &agent_id,
            record.timestamp,
        );

        Ok(record)
    }

    /// Atomically read-modify-write a key.
    ///
    /// The whole cycle (lock, read, apply `f`, write) is retried with
    /// jittered exponential backoff when the lock cannot be acquired, up to
    /// the configured budget. `f` receives the current value (or `None`)
    /// and returns the value to store. It may run more than once, so it
    /// should be pure.
    ///
    /// This is compare-and-retry, not a transaction: lock-free readers can
    /// still observe the value mid-cycle.
    pub async fn atomic_update<F>(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
        mut f: F,
    ) -> MemoryResult<JsonValue>
    where
        F: FnMut(Option<&JsonValue>) -> JsonValue,
    {
        let retry = self.config.retry.clone();
        self.atomic_update_with(namespace, key, agent_id, &mut f, retry)
            .await
    }

    /// Atomic update with an explicit retry budget.
    pub async fn atomic_update_with<F>(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
        f: &mut F,
        retry: RetryConfig,
    ) -> MemoryResult<JsonValue>
    where
        F: FnMut(Option<&JsonValue>) -> JsonValue,
    {
        let full_key = validated_key(namespace, key)?;
        let agent_id = agent_id.into();
        let canonical = full_key.to_canonical_string();
        let attempts = retry.max_retries.max(1);

        for attempt in 0..attempts {
            let guard = match self.locks.acquire(&canonical, &agent_id).await {
                Ok(guard) => guard,
                Err(MemoryError::LockTimeout { .. }) if attempt + 1 < attempts => {
                    let delay = retry_delay(&retry, attempt);
                    tracing::debug!(
                        full_key = %canonical,
                        agent_id = %agent_id,
                        attempt,
                        "atomic update cycle failed to lock, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let current = self.store.read(&full_key);
            let next = f(current.as_ref());

            let (record, previous) = self.store.apply_write(
                &full_key,
                next,
                &agent_id,
                OperationKind::Write,
                Map::new(),
            );

            self.store.record_operation(Operation::new(
                OperationKind::Write,
                &full_key.namespace,
                &full_key.key,
                &agent_id,
                Some(record.value().clone()),
            ));
            self.notify(
                MemoryEventKind::Write,
                &full_key,
                Some(record.value().clone()),
                previous,
                &agent_id,
                record.timestamp,
            );

            drop(guard);
            return Ok(record.value().clone());
        }

        Err(MemoryError::UpdateRetriesExhausted {
            full_key: canonical,
            attempts,
        })
    }

    /// Run a query over all entries.
    pub async fn query(&self, query: MemoryQuery) -> MemoryResult<QueryResult> {
        let operations = if query.include_operations {
            self.store.operations()
        } else {
            Vec::new()
        };
        QueryExecutor::execute(&query, self.store.scan_all(), &operations)
    }

    /// Subscribe an agent to changes on a single key.
    ///
    /// Creates a placeholder entry if none exists, so the subscription has
    /// somewhere to attach before the first write. Returns the subscription
    /// id and a receiver of [`MemoryEvent`]s.
    pub async fn subscribe(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> MemoryResult<(SubscriptionId, broadcast::Receiver<MemoryEvent>)> {
        let full_key = validated_key(namespace, key)?;
        let agent_id = agent_id.into();

        self.store.add_subscriber(&full_key, &agent_id);

        Ok(self.subscriptions.subscribe(
            agent_id,
            SubscriptionScope::Key {
                namespace: full_key.namespace,
                key: full_key.key,
            },
        ))
    }

    /// Subscribe an agent to every change in a namespace.
    pub async fn subscribe_namespace(
        &self,
        namespace: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> (SubscriptionId, broadcast::Receiver<MemoryEvent>) {
        self.subscriptions.subscribe(
            agent_id,
            SubscriptionScope::Namespace {
                namespace: namespace.into(),
            },
        )
    }

    /// Remove a subscription by id.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> MemoryResult<()> {
        let info = self.subscriptions.unsubscribe(id)?;
        if let SubscriptionScope::Key { namespace, key } = &info.scope {
            let full_key = FullKey::new(namespace.clone(), key.clone());
            // Only clear the entry's subscriber list when this was the
            // agent's last subscription on the key.
            if self
                .subscriptions
                .find_key_subscriptions(&info.agent_id, &full_key)
                .is_empty()
            {
                self.store.remove_subscriber(&full_key, &info.agent_id);
            }
        }
        Ok(())
    }

    /// Remove all of an agent's subscriptions on a key.
    ///
    /// Returns the number of subscriptions removed.
    pub async fn unsubscribe_key(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> MemoryResult<usize> {
        let full_key = validated_key(namespace, key)?;
        let agent_id = agent_id.into();

        let ids = self.subscriptions.find_key_subscriptions(&agent_id, &full_key);
        let removed = ids.len();
        for id in ids {
            self.subscriptions.unsubscribe(id)?;
        }
        self.store.remove_subscriber(&full_key, &agent_id);

        Ok(removed)
    }

    /// List all active subscriptions.
    pub async fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions.list()
    }

    /// Scan the audit log for conflicts (advisory only).
    pub async fn detect_conflicts(&self) -> Vec<MemoryConflict> {
        conflict::detect(&self.store.operations(), &self.config.conflict)
    }

    /// Scan a caller-supplied slice of operations for conflicts.
    pub fn detect_conflicts_in(&self, operations: &[Operation]) -> Vec<MemoryConflict> {
        conflict::detect(operations, &self.config.conflict)
    }

    /// Resolve a detected conflict by writing a reconciliation value.
    ///
    /// This is an ordinary write whose version metadata records the
    /// conflict it resolves. It provides no guarantee beyond the write
    /// itself.
    pub async fn resolve_conflict(
        &self,
        conflict: &MemoryConflict,
        resolution: JsonValue,
        agent_id: impl Into<String>,
    ) -> MemoryResult<VersionRecord> {
        let mut metadata = Map::new();
        metadata.insert("conflict_resolution".into(), json!(true));
        metadata.insert(
            "conflict_kind".into(),
            json!(match conflict.kind {
                ConflictKind::ConcurrentWrite => "concurrent_write",
                ConflictKind::StaleRead => "stale_read",
            }),
        );
        metadata.insert("conflict_agents".into(), json!(conflict.agent_ids));

        self.write_with(
            conflict.namespace.clone(),
            conflict.key.clone(),
            resolution,
            agent_id,
            metadata,
        )
        .await
    }

    /// The full audit log, oldest first.
    pub async fn operations(&self) -> Vec<Operation> {
        self.store.operations()
    }

    /// Memory statistics for monitoring.
    pub async fn stats(&self) -> MemoryStats {
        MemoryStats {
            entry_count: self.store.entry_count(),
            total_versions: self.store.total_version_count(),
            unique_values: self.store.unique_value_count(),
            namespace_count: self.store.list_namespaces().len(),
            operation_count: self.store.operation_count(),
            subscription_count: self.subscriptions.count(),
            held_locks: self.locks.held_count(),
        }
    }

    /// All namespaces currently in use, sorted.
    pub async fn list_namespaces(&self) -> Vec<String> {
        self.store.list_namespaces()
    }

    /// All keys in a namespace, sorted.
    pub async fn list_keys(&self, namespace: &str) -> Vec<String> {
        self.store.list_keys(namespace)
    }

    fn notify(
        &self,
        kind: MemoryEventKind,
        full_key: &FullKey,
        value: Option<JsonValue>,
        previous: Option<JsonValue>,
        agent_id: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.subscriptions.notify(MemoryEvent {
            kind,
            namespace: full_key.namespace.clone(),
            key: full_key.key.clone(),
            value,
            previous,
            agent_id: agent_id.to_string(),
            timestamp,
        });
    }
}

/// Memory statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Entries, including subscribe-created placeholders
    pub entry_count: usize,
    /// Versions retained across all keys
    pub total_versions: usize,
    /// Unique values in the deduplicated store
    pub unique_values: usize,
    /// Namespaces in use
    pub namespace_count: usize,
    /// Audit records retained
    pub operation_count: usize,
    /// Active subscriptions
    pub subscription_count: usize,
    /// Locks currently held
    pub held_locks: usize,
}

fn validated_key(
    namespace: impl Into<String>,
    key: impl Into<String>,
) -> MemoryResult<FullKey> {
    let key = key.into();
    if key.is_empty() {
        return Err(MemoryError::EmptyKey);
    }
    Ok(FullKey::new(namespace, key))
}

fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = retry.retry_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter_ms = rand::thread_rng().gen_range(0..=exp_ms / 2);
    Duration::from_millis(exp_ms + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let memory = SharedMemory::start();

        memory
            .write("profiles", "user:1", json!({"name": "A"}), "agent-1")
            .await
            .unwrap();

        let value = memory.read("profiles", "user:1", "agent-1").await.unwrap();
        assert_eq!(value, Some(json!({"name": "A"})));
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let memory = SharedMemory::start();
        let value = memory.read("profiles", "nope", "agent-1").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let memory = SharedMemory::start();

        let result = memory.write("profiles", "", json!(1), "agent-1").await;
        assert!(matches!(result, Err(MemoryError::EmptyKey)));

        let result = memory.read("profiles", "", "agent-1").await;
        assert!(matches!(result, Err(MemoryError::EmptyKey)));
    }

    #[tokio::test]
    async fn test_profile_scenario_history_order() {
        let memory = SharedMemory::start();

        memory
            .write("profile", "user:1", json!({"name": "A"}), "agent-1")
            .await
            .unwrap();
        memory
            .write("profile", "user:1", json!({"name": "B"}), "agent-1")
            .await
            .unwrap();

        let value = memory.read("profile", "user:1", "agent-1").await.unwrap();
        assert_eq!(value, Some(json!({"name": "B"})));

        let history = memory.history("profile", "user:1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value(), &json!({"name": "B"}));
        assert_eq!(history[1].value(), &json!({"name": "A"}));
    }

    #[tokio::test]
    async fn test_delete() {
        let memory = SharedMemory::start();

        memory.write("ns", "k", json!(1), "agent-1").await.unwrap();
        assert!(memory.delete("ns", "k", "agent-1").await.unwrap());
        assert!(!memory.delete("ns", "k", "agent-1").await.unwrap());
        assert_eq!(memory.read("ns", "k", "agent-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_revert_to_creates_new_version() {
        let memory = SharedMemory::start();

        let v1 = memory
            .write("docs", "readme", json!({"v": 1}), "agent-1")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        memory
            .write("docs", "readme", json!({"v": 2}), "agent-1")
            .await
            .unwrap();

        let reverted = memory
            .revert_to("docs", "readme", v1.timestamp, "agent-2")
            .await
            .unwrap();

        assert_eq!(reverted.value(), &json!({"v": 1}));
        assert_eq!(reverted.operation, OperationKind::Revert);
        assert_eq!(
            reverted.metadata.get("reverted_to_version"),
            Some(&json!(v1.version_id))
        );

        // Revert is a new version, so the log keeps growing.
        let history = memory.history("docs", "readme", None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value(), &json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_revert_before_first_version() {
        let memory = SharedMemory::start();
        memory.write("docs", "x", json!(1), "agent-1").await.unwrap();

        let long_ago = Utc::now() - chrono::Duration::days(1);
        let result = memory.revert_to("docs", "x", long_ago, "agent-1").await;
        assert!(matches!(
            result,
            Err(MemoryError::NoVersionAtTimestamp { .. })
        ));
    }

    #[tokio::test]
    async fn test_atomic_update_counter() {
        let memory = SharedMemory::start();

        for _ in 0..10 {
            memory
                .atomic_update("counters", "hits", "agent-1", |current| {
                    let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                    json!(n + 1)
                })
                .await
                .unwrap();
        }

        let value = memory.read("counters", "hits", "agent-1").await.unwrap();
        assert_eq!(value, Some(json!(10)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_atomic_update_concurrent_increments() {
        let memory = SharedMemory::start();
        let mut handles = Vec::new();

        for i in 0..20 {
            let memory = memory.clone();
            handles.push(tokio::spawn(async move {
                memory
                    .atomic_update("counters", "hits", format!("agent-{i}"), |current| {
                        let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
                        json!(n + 1)
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let value = memory.read("counters", "hits", "agent-0").await.unwrap();
        assert_eq!(value, Some(json!(20)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_lose_nothing() {
        let memory = SharedMemory::start();
        let mut handles = Vec::new();

        for i in 0..10 {
            let memory = memory.clone();
            handles.push(tokio::spawn(async move {
                memory
                    .write("race", "key", json!(i), format!("agent-{i}"))
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = memory.history("race", "key", None).await.unwrap();
        assert_eq!(history.len(), 10);
    }

    #[tokio::test]
    async fn test_subscribe_receives_each_write_once() {
        let memory = SharedMemory::start();

        let (_id, mut rx) = memory
            .subscribe("profiles", "user:1", "watcher")
            .await
            .unwrap();

        memory
            .write("profiles", "user:1", json!(1), "agent-1")
            .await
            .unwrap();
        memory
            .write("profiles", "user:1", json!(2), "agent-1")
            .await
            .unwrap();

        let e1 = rx.try_recv().unwrap();
        let e2 = rx.try_recv().unwrap();
        assert_eq!(e1.value, Some(json!(1)));
        assert_eq!(e2.value, Some(json!(2)));
        assert_eq!(e2.previous, Some(json!(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_creates_placeholder_entry() {
        let memory = SharedMemory::start();

        memory
            .subscribe("profiles", "user:1", "watcher")
            .await
            .unwrap();

        let entry = memory.entry("profiles", "user:1").await.unwrap();
        assert!(entry.current_value.is_none());
        assert_eq!(entry.subscribers, vec!["watcher"]);

        // A read of the placeholder still reports absence.
        let value = memory.read("profiles", "user:1", "watcher").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_events() {
        let memory = SharedMemory::start();

        let (id, mut rx) = memory
            .subscribe("profiles", "user:1", "watcher")
            .await
            .unwrap();
        memory.unsubscribe(id).await.unwrap();

        memory
            .write("profiles", "user:1", json!(1), "agent-1")
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        let entry = memory.entry("profiles", "user:1").await.unwrap();
        assert!(entry.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_subscription() {
        let memory = SharedMemory::start();

        let (_id, mut rx) = memory.subscribe_namespace("profiles", "watcher").await;

        memory
            .write("profiles", "user:1", json!(1), "agent-1")
            .await
            .unwrap();
        memory
            .write("other", "user:1", json!(2), "agent-1")
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.namespace, "profiles");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_notifies_subscribers() {
        let memory = SharedMemory::start();

        memory.write("ns", "k", json!(1), "agent-1").await.unwrap();
        let (_id, mut rx) = memory.subscribe("ns", "k", "watcher").await.unwrap();

        memory.delete("ns", "k", "agent-1").await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, MemoryEventKind::Delete);
        assert_eq!(event.previous, Some(json!(1)));
        assert_eq!(event.value, None);
    }

    #[tokio::test]
    async fn test_detect_and_resolve_conflict() {
        let memory = SharedMemory::start();

        memory
            .write("ns", "shared", json!("from-a"), "agent-a")
            .await
            .unwrap();
        memory
            .write("ns", "shared", json!("from-b"), "agent-b")
            .await
            .unwrap();

        let conflicts = memory.detect_conflicts().await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::ConcurrentWrite);

        let resolved = memory
            .resolve_conflict(&conflicts[0], json!("merged"), "moderator")
            .await
            .unwrap();
        assert_eq!(resolved.metadata.get("conflict_resolution"), Some(&json!(true)));
        assert_eq!(
            memory.read("ns", "shared", "moderator").await.unwrap(),
            Some(json!("merged"))
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let memory = SharedMemory::start();

        memory.write("a", "x", json!(1), "agent-1").await.unwrap();
        memory.write("a", "x", json!(2), "agent-1").await.unwrap();
        memory.write("b", "y", json!(1), "agent-1").await.unwrap();

        let stats = memory.stats().await;
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.total_versions, 3);
        assert_eq!(stats.namespace_count, 2);
        assert_eq!(stats.operation_count, 3);
        assert_eq!(stats.held_locks, 0);
    }

    #[tokio::test]
    async fn test_stats_drop_evicted_values() {
        let memory = SharedMemory::with_config(MemoryConfig::default().with_max_history(1));

        for i in 0..20 {
            memory.write("ns", "k", json!(i), "agent-1").await.unwrap();
        }
        assert_eq!(memory.stats().await.unique_values, 1);

        memory.delete("ns", "k", "agent-1").await.unwrap();
        assert_eq!(memory.stats().await.unique_values, 0);
    }

    #[tokio::test]
    async fn test_history_respects_max() {
        let memory = SharedMemory::with_config(MemoryConfig::default().with_max_history(3));

        for i in 0..8 {
            memory.write("ns", "k", json!(i), "agent-1").await.unwrap();
        }

        let history = memory.history("ns", "k", None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value(), &json!(7));
    }

    #[tokio::test]
    async fn test_atomic_update_retries_exhausted_under_held_lock() {
        let memory = SharedMemory::with_config(MemoryConfig::default().with_lock(LockConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            watchdog_ttl: Duration::from_secs(60),
        }));

        // Hold the lock directly so every cycle times out.
        let _guard = memory.locks.try_acquire("ns:k", "blocker").unwrap();

        let result = memory
            .atomic_update_with(
                "ns",
                "k",
                "agent-1",
                &mut |_| json!(1),
                RetryConfig {
                    max_retries: 2,
                    retry_delay: Duration::from_millis(1),
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(MemoryError::UpdateRetriesExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_query_through_facade() {
        let memory = SharedMemory::start();

        memory
            .write("transcripts", "meeting-1", json!({"lines": 3}), "agent-1")
            .await
            .unwrap();
        memory
            .write("meeting_state", "meeting-1", json!("active"), "agent-1")
            .await
            .unwrap();

        let result = memory
            .query(MemoryQuery::new().in_namespace("transcripts").with_operations())
            .await
            .unwrap();

        assert_eq!(result.entries.len(), 1);
        let ops = result.operations.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].namespace, "transcripts");
    }
}
