//! Storage layer for the shared memory core.
//!
//! This module owns the entry map, the per-key version lists, and the
//! append-only audit log. It performs no locking of its own: callers on the
//! write path hold the per-key lock from [`crate::lock::KeyLocks`] before
//! mutating an entry, and reads are deliberately lock-free.
//!
//! ## Value deduplication
//!
//! Values are `Arc`-wrapped and keyed by their content-addressed version id
//! in a shared value store. Writing the same JSON value N times costs one
//! allocation, which matters for status values rewritten on every heartbeat.
//! A value is evicted once the last version referencing it is trimmed or
//! removed, so the value store stays bounded by the live version set.
use crate::error::{MemoryError, MemoryResult};
use crate::types::{
    version_id_for, FullKey, MemoryEntry, Operation, OperationKind, ValueKind, VersionRecord,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Mutable state for one entry.
#[derive(Debug, Clone)]
struct EntryState {
    /// Version history, newest first, trimmed to `max_history`
    versions: Vec<VersionRecord>,
    /// When the entry appeared (first write or first subscribe)
    created: DateTime<Utc>,
    /// When the entry was last written
    last_updated: DateTime<Utc>,
    /// Agents subscribed to this entry
    subscribers: Vec<String>,
}

impl EntryState {
    fn placeholder(now: DateTime<Utc>) -> Self {
        Self {
            versions: Vec::new(),
            created: now,
            last_updated: now,
            subscribers: Vec::new(),
        }
    }

    fn to_entry(&self, full_key: &FullKey) -> MemoryEntry {
        let current = self.versions.first();
        MemoryEntry {
            namespace: full_key.namespace.clone(),
            key: full_key.key.clone(),
            current_value: current.map(|v| v.value().clone()),
            kind: current.map(|v| v.kind),
            created: self.created,
            last_updated: self.last_updated,
            subscribers: self.subscribers.clone(),
            versions: self.versions.clone(),
        }
    }
}

/// In-memory store for entries, versions, and the audit log.
#[derive(Debug)]
pub struct MemoryStore {
    /// All entries, including subscribe-created placeholders
    entries: DashMap<FullKey, EntryState>,
    /// Deduplicated value storage keyed by version id
    value_store: DashMap<String, Arc<JsonValue>>,
    /// Append-only audit log, oldest first, capped
    audit: RwLock<VecDeque<Operation>>,
    /// Maximum versions retained per key
    max_history: usize,
    /// Maximum audit records retained
    audit_log_cap: usize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(max_history: usize, audit_log_cap: usize) -> Self {
        Self {
            entries: DashMap::new(),
            value_store: DashMap::new(),
            audit: RwLock::new(VecDeque::new()),
            max_history,
            audit_log_cap,
        }
    }

    /// Apply a write to an entry, creating it if needed.
    ///
    /// Must be called with the per-key lock held. Prepends a version record,
    /// trims history to `max_history`, and returns the new record along with
    /// the previous current value (if any). Values referenced only by the
    /// trimmed versions are dropped from the value store.
    pub fn apply_write(
        &self,
        full_key: &FullKey,
        value: JsonValue,
        agent_id: &str,
        operation: OperationKind,
        metadata: Map<String, JsonValue>,
    ) -> (VersionRecord, Option<JsonValue>) {
        let now = Utc::now();
        let version_id = version_id_for(&value);

        // Reuse the allocation if this exact value was stored before.
        let shared_value = self
            .value_store
            .entry(version_id.clone())
            .or_insert_with(|| Arc::new(value))
            .clone();

        let kind = ValueKind::of(&shared_value);
        let record = VersionRecord {
            value: shared_value,
            kind,
            timestamp: now,
            agent_id: agent_id.to_string(),
            operation,
            version_id,
            metadata,
        };

        let mut state = self
            .entries
            .entry(full_key.clone())
            .or_insert_with(|| EntryState::placeholder(now));

        let previous = state.versions.first().map(|v| v.value().clone());
        state.versions.insert(0, record.clone());
        let cap = self.max_history.max(1);
        let trimmed = if state.versions.len() > cap {
            state.versions.split_off(cap)
        } else {
            Vec::new()
        };
        state.last_updated = now;
        drop(state);

        let trimmed_ids: Vec<String> = trimmed.iter().map(|v| v.version_id.clone()).collect();
        drop(trimmed);
        for id in &trimmed_ids {
            self.evict_value(id);
        }

        (record, previous)
    }

    /// Drop a value from the deduplication store if no version references it.
    ///
    /// A strong count of 1 means the value store holds the only remaining
    /// `Arc`. `remove_if` holds the shard lock across the check, so a
    /// concurrent write deduplicating onto the same id cannot race it.
    fn evict_value(&self, version_id: &str) {
        self.value_store
            .remove_if(version_id, |_, value| Arc::strong_count(value) == 1);
    }

    /// Get the current value for a key, if any.
    ///
    /// Placeholder entries (created by subscribe, never written) read as
    /// absent.
    pub fn read(&self, full_key: &FullKey) -> Option<JsonValue> {
        self.entries
            .get(full_key)
            .and_then(|state| state.versions.first().map(|v| v.value().clone()))
    }

    /// Get a point-in-time snapshot of an entry.
    pub fn entry(&self, full_key: &FullKey) -> Option<MemoryEntry> {
        self.entries
            .get(full_key)
            .map(|state| state.to_entry(full_key))
    }

    /// Remove an entry entirely.
    ///
    /// Must be called with the per-key lock held. Returns the current value
    /// at the time of removal, if the entry had ever been written. Values
    /// referenced only by the removed versions are dropped from the value
    /// store.
    pub fn remove(&self, full_key: &FullKey) -> Option<JsonValue> {
        let (_, state) = self.entries.remove(full_key)?;
        let latest = state.versions.first().map(|v| v.value().clone());
        let ids: Vec<String> = state
            .versions
            .iter()
            .map(|v| v.version_id.clone())
            .collect();
        drop(state);
        for id in &ids {
            self.evict_value(id);
        }
        latest
    }

    /// Get the version history for a key, newest first.
    pub fn history(
        &self,
        full_key: &FullKey,
        limit: Option<usize>,
    ) -> MemoryResult<Vec<VersionRecord>> {
        let state = self
            .entries
            .get(full_key)
            .ok_or_else(|| MemoryError::KeyNotFound {
                namespace: full_key.namespace.clone(),
                key: full_key.key.clone(),
            })?;

        let mut versions = state.versions.clone();
        if let Some(limit) = limit {
            versions.truncate(limit);
        }
        Ok(versions)
    }

    /// Find the newest version at or before the given timestamp.
    pub fn version_at(
        &self,
        full_key: &FullKey,
        timestamp: DateTime<Utc>,
    ) -> MemoryResult<VersionRecord> {
        let state = self
            .entries
            .get(full_key)
            .ok_or_else(|| MemoryError::KeyNotFound {
                namespace: full_key.namespace.clone(),
                key: full_key.key.clone(),
            })?;

        // Versions are newest first, so the first match is the newest one
        // at or before the target.
        state
            .versions
            .iter()
            .find(|v| v.timestamp <= timestamp)
            .cloned()
            .ok_or_else(|| MemoryError::NoVersionAtTimestamp {
                namespace: full_key.namespace.clone(),
                key: full_key.key.clone(),
                timestamp: timestamp.timestamp(),
            })
    }

    /// Create a placeholder entry if none exists, so a subscription has
    /// somewhere to attach before the first write.
    pub fn ensure_entry(&self, full_key: &FullKey) {
        self.entries
            .entry(full_key.clone())
            .or_insert_with(|| EntryState::placeholder(Utc::now()));
    }

    /// Register an agent on an entry's subscriber list.
    pub fn add_subscriber(&self, full_key: &FullKey, agent_id: &str) {
        self.ensure_entry(full_key);
        if let Some(mut state) = self.entries.get_mut(full_key) {
            if !state.subscribers.iter().any(|s| s == agent_id) {
                state.subscribers.push(agent_id.to_string());
            }
        }
    }

    /// Remove an agent from an entry's subscriber list.
    pub fn remove_subscriber(&self, full_key: &FullKey, agent_id: &str) {
        if let Some(mut state) = self.entries.get_mut(full_key) {
            state.subscribers.retain(|s| s != agent_id);
        }
    }

    /// Append an audit record, dropping the oldest past the cap.
    pub fn record_operation(&self, operation: Operation) {
        let mut audit = self.audit.write().unwrap_or_else(|e| e.into_inner());
        audit.push_back(operation);
        while audit.len() > self.audit_log_cap {
            audit.pop_front();
        }
    }

    /// Clone the audit log, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        let audit = self.audit.read().unwrap_or_else(|e| e.into_inner());
        audit.iter().cloned().collect()
    }

    /// Number of audit records currently retained.
    pub fn operation_count(&self) -> usize {
        let audit = self.audit.read().unwrap_or_else(|e| e.into_inner());
        audit.len()
    }

    /// Snapshot every entry in the store.
    pub fn scan_all(&self) -> Vec<MemoryEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().to_entry(entry.key()))
            .collect()
    }

    /// Number of entries (including placeholders).
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Total versions retained across all keys.
    pub fn total_version_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.value().versions.len())
            .sum()
    }

    /// Number of unique values in the deduplicated value store.
    pub fn unique_value_count(&self) -> usize {
        self.value_store.len()
    }

    /// All namespaces currently in use, sorted.
    pub fn list_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// All keys in a namespace, sorted.
    pub fn list_keys(&self, namespace: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().namespace == namespace)
            .map(|entry| entry.key().key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Rebuild a store from exported entries and audit records.
    ///
    /// Used by the snapshot loader. Version lists are truncated to
    /// `max_history`, so a snapshot saved under a larger cap loads within
    /// the current one. Values are re-deduplicated through the value store
    /// as they are inserted.
    pub fn restore(
        entries: Vec<MemoryEntry>,
        operations: Vec<Operation>,
        max_history: usize,
        audit_log_cap: usize,
    ) -> Self {
        let store = Self::new(max_history, audit_log_cap);

        for entry in entries {
            let full_key = FullKey::new(entry.namespace, entry.key);
            let mut saved = entry.versions;
            saved.truncate(max_history.max(1));
            let versions = saved
                .into_iter()
                .map(|record| {
                    let shared = store
                        .value_store
                        .entry(record.version_id.clone())
                        .or_insert_with(|| Arc::clone(&record.value))
                        .clone();
                    VersionRecord {
                        value: shared,
                        ..record
                    }
                })
                .collect();

            store.entries.insert(
                full_key,
                EntryState {
                    versions,
                    created: entry.created,
                    last_updated: entry.last_updated,
                    subscribers: entry.subscribers,
                },
            );
        }

        {
            let mut audit = store.audit.write().unwrap_or_else(|e| e.into_inner());
            audit.extend(operations);
            while audit.len() > audit_log_cap {
                audit.pop_front();
            }
        }

        store
    }
}
