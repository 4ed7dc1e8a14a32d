//! Change notifications for the shared memory core.
//!
//! Subscriptions are registered per agent, either on a single key or on a
//! whole namespace. Every write, delete, and revert fans out a
//! [`MemoryEvent`] to matching subscriptions over tokio broadcast channels.
//!
//! Fan-out is isolated per subscriber: a lagging receiver drops its own
//! events and a closed receiver is skipped, so one misbehaving subscriber
//! can never block the write path or its peers. Send failures are logged at
//! debug level and otherwise ignored.
use crate::error::{MemoryError, MemoryResult};
use crate::types::FullKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default channel capacity for subscription broadcasts.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// The kind of memory change that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind {
    /// A value was written
    Write,
    /// An entry was deleted
    Delete,
    /// A historical value was restored as the current value
    Revert,
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// What happened
    pub kind: MemoryEventKind,
    /// The namespace affected
    pub namespace: String,
    /// The key affected
    pub key: String,
    /// The new value (None for deletes)
    pub value: Option<JsonValue>,
    /// The previous value (None for first writes)
    pub previous: Option<JsonValue>,
    /// The agent that performed the change
    pub agent_id: String,
    /// When the change completed
    pub timestamp: DateTime<Utc>,
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionScope {
    /// A single key within a namespace
    Key {
        /// The namespace
        namespace: String,
        /// The key
        key: String,
    },
    /// Every key in a namespace
    Namespace {
        /// The namespace
        namespace: String,
    },
}

impl SubscriptionScope {
    /// Check whether an event falls inside this scope.
    pub fn matches(&self, event: &MemoryEvent) -> bool {
        match self {
            Self::Key { namespace, key } => &event.namespace == namespace && &event.key == key,
            Self::Namespace { namespace } => &event.namespace == namespace,
        }
    }
}

/// Information about an active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// The subscription id
    pub id: SubscriptionId,
    /// The subscribing agent
    pub agent_id: String,
    /// What the subscription listens to
    pub scope: SubscriptionScope,
    /// When the subscription was created
    pub created_at: DateTime<Utc>,
    /// Number of events delivered so far
    pub events_delivered: u64,
}

/// Internal subscription state.
struct SubscriptionState {
    agent_id: String,
    scope: SubscriptionScope,
    sender: broadcast::Sender<MemoryEvent>,
    created_at: DateTime<Utc>,
    events_delivered: AtomicU64,
}

/// Manager for memory-change subscriptions.
pub struct SubscriptionManager {
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
    next_id: AtomicU64,
    channel_capacity: usize,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a manager with a custom broadcast channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            channel_capacity: capacity,
        }
    }

    /// Register a subscription for an agent.
    ///
    /// Returns the subscription id and a receiver for events.
    pub fn subscribe(
        &self,
        agent_id: impl Into<String>,
        scope: SubscriptionScope,
    ) -> (SubscriptionId, broadcast::Receiver<MemoryEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = broadcast::channel(self.channel_capacity);

        self.subscriptions.insert(
            id,
            SubscriptionState {
                agent_id: agent_id.into(),
                scope,
                sender,
                created_at: Utc::now(),
                events_delivered: AtomicU64::new(0),
            },
        );

        (id, receiver)
    }

    /// Get a new receiver for an existing subscription.
    pub fn receiver(&self, id: SubscriptionId) -> Option<broadcast::Receiver<MemoryEvent>> {
        self.subscriptions
            .get(&id)
            .map(|state| state.sender.subscribe())
    }

    /// Remove a subscription.
    ///
    /// Returns its info so the caller can deregister the agent from the
    /// entry's subscriber list.
    pub fn unsubscribe(&self, id: SubscriptionId) -> MemoryResult<SubscriptionInfo> {
        let (_, state) = self
            .subscriptions
            .remove(&id)
            .ok_or(MemoryError::SubscriptionNotFound(id.0))?;

        Ok(SubscriptionInfo {
            id,
            agent_id: state.agent_id,
            scope: state.scope,
            created_at: state.created_at,
            events_delivered: state.events_delivered.load(Ordering::Relaxed),
        })
    }

    /// Find subscription ids for an agent on a specific key.
    pub fn find_key_subscriptions(&self, agent_id: &str, full_key: &FullKey) -> Vec<SubscriptionId> {
        self.subscriptions
            .iter()
            .filter(|entry| {
                let state = entry.value();
                state.agent_id == agent_id
                    && state.scope
                        == SubscriptionScope::Key {
                            namespace: full_key.namespace.clone(),
                            key: full_key.key.clone(),
                        }
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// List all active subscriptions.
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                id: *entry.key(),
                agent_id: entry.value().agent_id.clone(),
                scope: entry.value().scope.clone(),
                created_at: entry.value().created_at,
                events_delivered: entry.value().events_delivered.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Number of active subscriptions.
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Fan an event out to every matching subscription.
    pub fn notify(&self, event: MemoryEvent) {
        for entry in self.subscriptions.iter() {
            let state = entry.value();
            if !state.scope.matches(&event) {
                continue;
            }
            match state.sender.send(event.clone()) {
                Ok(_) => {
                    state.events_delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    // Receiver dropped. Harmless: the subscription will be
                    // cleaned up when the owner unsubscribes.
                    tracing::debug!(
                        subscription = %entry.key(),
                        agent_id = %state.agent_id,
                        "subscriber receiver dropped, event discarded"
                    );
                }
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
