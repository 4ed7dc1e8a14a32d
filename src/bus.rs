//! In-process message bus for agent-to-agent communication.
//!
//! The bus is a peer of the shared memory core, not a layer on it: memory
//! carries shared state, the bus carries transient messages. Four routing
//! modes are supported:
//!
//! - **Direct**: one registered agent to another, over a per-agent mpsc
//!   mailbox.
//! - **Broadcast**: one agent to every other registered agent.
//! - **Channel**: named membership groups; a send reaches every current
//!   member except the sender.
//! - **Topic**: anonymous pub/sub over tokio broadcast channels; publishing
//!   with no subscribers is not an error.
//!
//! Every direct, broadcast, and channel message gets a delivery-status
//! record (Pending, Delivered, Read, Failed). Messages may carry a TTL;
//! expired messages are rejected on send, and a background sweep fails and
//! prunes stale status records.
use crate::error::{BusError, BusResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Maximum length of an agent, channel, or topic id.
const MAX_ID_LENGTH: usize = 128;

/// Validated identifier for an agent on the bus.
///
/// Non-empty, no whitespace, at most 128 characters, restricted to
/// alphanumerics plus `.`, `_`, and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Create a validated agent id.
    pub fn new(id: impl Into<String>) -> BusResult<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = BusError;

    fn try_from(value: String) -> BusResult<Self> {
        Self::new(value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// Validated name for a pub/sub topic or a channel.
///
/// Same rules as [`AgentId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Create a validated topic name.
    pub fn new(name: impl Into<String>) -> BusResult<Self> {
        let name = name.into();
        validate_id(&name)?;
        Ok(Self(name))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = BusError;

    fn try_from(value: String) -> BusResult<Self> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

fn validate_id(id: &str) -> BusResult<()> {
    if id.is_empty() {
        return Err(BusError::InvalidId {
            id: id.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(BusError::InvalidId {
            id: id.to_string(),
            reason: format!("must be at most {MAX_ID_LENGTH} characters"),
        });
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
    {
        return Err(BusError::InvalidId {
            id: id.to_string(),
            reason: format!("contains invalid character '{bad}'"),
        });
    }
    Ok(())
}

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a message was routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Route {
    /// One agent to another
    Direct {
        /// The sender
        from: AgentId,
        /// The recipient
        to: AgentId,
    },
    /// One agent to every other registered agent
    Broadcast {
        /// The sender
        from: AgentId,
    },
    /// One member of a channel to the other members
    Channel {
        /// The sender
        from: AgentId,
        /// The channel name
        channel: Topic,
    },
    /// Anonymous pub/sub on a topic
    Topic {
        /// The sender
        from: AgentId,
        /// The topic name
        topic: Topic,
    },
}

/// A message in flight on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id, also the key for delivery status
    pub id: MessageId,
    /// How the message was routed
    pub route: Route,
    /// The payload
    pub payload: JsonValue,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// After this instant the message is dead and will not be delivered
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    fn new(route: Route, payload: JsonValue, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::generate(),
            route,
            payload,
            timestamp: now,
            expires_at: ttl.and_then(|ttl| {
                chrono::Duration::from_std(ttl)
                    .ok()
                    .map(|ttl| now + ttl)
            }),
        }
    }

    /// Whether the message has passed its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Delivery state of a tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created but not yet handed to any receiver
    Pending,
    /// Handed to at least one receiver's queue
    Delivered,
    /// The recipient acknowledged reading it
    Read,
    /// Delivery failed or the message expired undelivered
    Failed,
}

#[derive(Debug, Clone)]
struct StatusRecord {
    status: DeliveryStatus,
    expires_at: Option<DateTime<Utc>>,
    /// Last status transition, used for retention pruning
    updated_at: DateTime<Utc>,
}

/// Tunables for the message bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of each agent's direct-message mailbox
    pub mailbox_capacity: usize,
    /// Capacity of each topic's broadcast channel
    pub topic_capacity: usize,
    /// TTL applied to messages sent without an explicit one
    pub default_ttl: Option<Duration>,
    /// Interval for the background expiry sweep
    pub sweep_interval: Duration,
    /// How long finished status records stay queryable before the sweep
    /// drops them
    pub status_retention: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            topic_capacity: 256,
            default_ttl: None,
            sweep_interval: Duration::from_secs(30),
            status_retention: Duration::from_secs(300),
        }
    }
}

/// In-process message bus.
///
/// Cheap to clone; all clones share the same registries.
#[derive(Clone)]
pub struct MessageBus {
    agents: Arc<DashMap<AgentId, mpsc::Sender<Message>>>,
    channels: Arc<DashMap<Topic, BTreeSet<AgentId>>>,
    topics: Arc<DashMap<Topic, broadcast::Sender<Message>>>,
    statuses: Arc<DashMap<MessageId, StatusRecord>>,
    config: Arc<BusConfig>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("agents", &self.agents.len())
            .field("channels", &self.channels.len())
            .field("topics", &self.topics.len())
            .finish()
    }
}

impl MessageBus {
    /// Create a bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with explicit configuration.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            topics: Arc::new(DashMap::new()),
            statuses: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Register an agent and get its mailbox receiver.
    ///
    /// Direct, broadcast, and channel traffic for the agent arrives on the
    /// returned receiver. A second registration under the same id fails
    /// unless the previous receiver was dropped, in which case the stale
    /// registration is replaced.
    pub fn register(&self, agent_id: &AgentId) -> BusResult<mpsc::Receiver<Message>> {
        let (sender, receiver) = mpsc::channel(self.config.mailbox_capacity);

        match self.agents.entry(agent_id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(sender);
            }
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_closed() {
                    return Err(BusError::AgentAlreadyRegistered(agent_id.to_string()));
                }
                tracing::debug!(agent_id = %agent_id, "replacing stale registration");
                occupied.insert(sender);
            }
        }

        Ok(receiver)
    }

    /// Remove an agent from the bus and from every channel.
    ///
    /// Returns `true` if the agent was registered.
    pub fn unregister(&self, agent_id: &AgentId) -> bool {
        let removed = self.agents.remove(agent_id).is_some();
        for mut channel in self.channels.iter_mut() {
            channel.value_mut().remove(agent_id);
        }
        removed
    }

    /// Whether an agent is currently registered.
    pub fn is_registered(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Ids of all registered agents, sorted.
    pub fn registered_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        agents.sort();
        agents
    }

    /// Send a direct message, applying the configured default TTL.
    pub fn send(
        &self,
        from: &AgentId,
        to: &AgentId,
        payload: JsonValue,
    ) -> BusResult<MessageId> {
        self.send_with_ttl(from, to, payload, self.config.default_ttl)
    }

    /// Send a direct message with an explicit TTL.
    ///
    /// Fails with [`BusError::AgentNotFound`] when the recipient is not
    /// registered and [`BusError::MessageExpired`] when the TTL is already
    /// spent at send time. The status record moves to Delivered on success
    /// and Failed otherwise.
    pub fn send_with_ttl(
        &self,
        from: &AgentId,
        to: &AgentId,
        payload: JsonValue,
        ttl: Option<Duration>,
    ) -> BusResult<MessageId> {
        let message = Message::new(
            Route::Direct {
                from: from.clone(),
                to: to.clone(),
            },
            payload,
            ttl,
        );
        let id = message.id;
        self.track(&message, DeliveryStatus::Pending);

        if message.is_expired(Utc::now()) {
            self.set_status(id, DeliveryStatus::Failed);
            return Err(BusError::MessageExpired(id.to_string()));
        }

        let sender = self
            .agents
            .get(to)
            .ok_or_else(|| BusError::AgentNotFound(to.to_string()))?
            .clone();

        match sender.try_send(message) {
            Ok(()) => {
                self.set_status(id, DeliveryStatus::Delivered);
                Ok(id)
            }
            Err(err) => {
                self.set_status(id, DeliveryStatus::Failed);
                tracing::warn!(to = %to, message = %id, "direct delivery failed");
                Err(BusError::Delivery(format!(
                    "mailbox for '{to}' rejected message: {err}"
                )))
            }
        }
    }

    /// Broadcast a message to every registered agent except the sender.
    ///
    /// Returns the message id and the number of mailboxes it reached. An
    /// agent whose mailbox is full is skipped, not an error.
    pub fn broadcast(
        &self,
        from: &AgentId,
        payload: JsonValue,
    ) -> BusResult<(MessageId, usize)> {
        let message = Message::new(
            Route::Broadcast { from: from.clone() },
            payload,
            self.config.default_ttl,
        );
        let id = message.id;
        self.track(&message, DeliveryStatus::Pending);

        let mut delivered = 0;
        for entry in self.agents.iter() {
            if entry.key() == from {
                continue;
            }
            match entry.value().try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!(
                        to = %entry.key(),
                        message = %id,
                        "broadcast delivery skipped a full or closed mailbox"
                    );
                }
            }
        }

        self.set_status(
            id,
            if delivered > 0 {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Failed
            },
        );
        Ok((id, delivered))
    }

    /// Create a channel. Returns `false` if it already existed.
    pub fn create_channel(&self, name: &Topic) -> bool {
        match self.channels.entry(name.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(BTreeSet::new());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Add a registered agent to a channel.
    pub fn join_channel(&self, name: &Topic, agent_id: &AgentId) -> BusResult<()> {
        if !self.is_registered(agent_id) {
            return Err(BusError::AgentNotFound(agent_id.to_string()));
        }
        let mut members = self
            .channels
            .get_mut(name)
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;
        members.insert(agent_id.clone());
        Ok(())
    }

    /// Remove an agent from a channel.
    pub fn leave_channel(&self, name: &Topic, agent_id: &AgentId) -> BusResult<bool> {
        let mut members = self
            .channels
            .get_mut(name)
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;
        Ok(members.remove(agent_id))
    }

    /// Current members of a channel, sorted.
    pub fn channel_members(&self, name: &Topic) -> BusResult<Vec<AgentId>> {
        let members = self
            .channels
            .get(name)
            .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;
        Ok(members.iter().cloned().collect())
    }

    /// All channel names, sorted.
    pub fn list_channels(&self) -> Vec<Topic> {
        let mut names: Vec<Topic> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Send a message to every member of a channel except the sender.
    ///
    /// The sender must be a member. Returns the message id and the number
    /// of mailboxes reached.
    pub fn send_to_channel(
        &self,
        from: &AgentId,
        name: &Topic,
        payload: JsonValue,
    ) -> BusResult<(MessageId, usize)> {
        let members: Vec<AgentId> = {
            let members = self
                .channels
                .get(name)
                .ok_or_else(|| BusError::ChannelNotFound(name.to_string()))?;
            if !members.contains(from) {
                return Err(BusError::NotAChannelMember {
                    agent: from.to_string(),
                    channel: name.to_string(),
                });
            }
            members.iter().cloned().collect()
        };

        let message = Message::new(
            Route::Channel {
                from: from.clone(),
                channel: name.clone(),
            },
            payload,
            self.config.default_ttl,
        );
        let id = message.id;
        self.track(&message, DeliveryStatus::Pending);

        let mut delivered = 0;
        for member in members {
            if &member == from {
                continue;
            }
            if let Some(sender) = self.agents.get(&member) {
                if sender.try_send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        self.set_status(
            id,
            if delivered > 0 {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Failed
            },
        );
        Ok((id, delivered))
    }

    /// Publish a message on a topic.
    ///
    /// Topics are created lazily. Publishing with no subscribers is not an
    /// error; the receiver count is returned. Topic messages are fire-and-
    /// forget and carry no delivery status.
    pub fn publish(
        &self,
        from: &AgentId,
        topic: &Topic,
        payload: JsonValue,
    ) -> BusResult<(MessageId, usize)> {
        let message = Message::new(
            Route::Topic {
                from: from.clone(),
                topic: topic.clone(),
            },
            payload,
            None,
        );
        let id = message.id;

        let sender = self.topic_sender(topic);
        let receivers = sender.send(message).unwrap_or(0);
        Ok((id, receivers))
    }

    /// Subscribe to a topic, creating it if needed.
    pub fn subscribe_topic(&self, topic: &Topic) -> broadcast::Receiver<Message> {
        self.topic_sender(topic).subscribe()
    }

    /// All topic names ever published or subscribed to, sorted.
    pub fn list_topics(&self) -> Vec<Topic> {
        let mut names: Vec<Topic> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn topic_sender(&self, topic: &Topic) -> broadcast::Sender<Message> {
        self.topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.config.topic_capacity).0)
            .clone()
    }

    /// Delivery status of a tracked message.
    pub fn delivery_status(&self, id: MessageId) -> Option<DeliveryStatus> {
        self.statuses.get(&id).map(|record| record.status)
    }

    /// Acknowledge a delivered message as read.
    pub fn mark_read(&self, id: MessageId) -> BusResult<()> {
        let mut record = self
            .statuses
            .get_mut(&id)
            .ok_or_else(|| BusError::Delivery(format!("unknown message {id}")))?;
        if record.status == DeliveryStatus::Delivered {
            record.status = DeliveryStatus::Read;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Number of tracked status records.
    pub fn tracked_messages(&self) -> usize {
        self.statuses.len()
    }

    /// Fail expired pending messages and prune stale status records.
    ///
    /// A record whose TTL has passed is failed if still pending, removed
    /// otherwise. Finished records (Delivered, Read, Failed) older than
    /// `status_retention` are removed even without a TTL, which keeps the
    /// registry bounded under the default no-TTL configuration. Returns the
    /// number of records touched.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let retention =
            chrono::Duration::from_std(self.config.status_retention).unwrap_or(chrono::Duration::MAX);
        let mut touched = 0;

        let expired: Vec<MessageId> = self
            .statuses
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .expires_at
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|entry| *entry.key())
            .collect();

        for id in expired {
            if let Some(mut record) = self.statuses.get_mut(&id) {
                match record.status {
                    DeliveryStatus::Pending => {
                        record.status = DeliveryStatus::Failed;
                        record.updated_at = now;
                        touched += 1;
                        continue;
                    }
                    DeliveryStatus::Delivered | DeliveryStatus::Read | DeliveryStatus::Failed => {}
                }
            }
            self.statuses.remove(&id);
            touched += 1;
        }

        let stale: Vec<MessageId> = self
            .statuses
            .iter()
            .filter(|entry| {
                entry.value().status != DeliveryStatus::Pending
                    && now.signed_duration_since(entry.value().updated_at) >= retention
            })
            .map(|entry| *entry.key())
            .collect();

        for id in stale {
            self.statuses.remove(&id);
            touched += 1;
        }

        if touched > 0 {
            tracing::debug!(touched, "expiry sweep cleaned message statuses");
        }
        touched
    }

    /// Spawn a background task that sweeps expired messages on the
    /// configured interval.
    pub fn spawn_expiry_task(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bus.sweep_expired();
            }
        })
    }

    fn track(&self, message: &Message, status: DeliveryStatus) {
        self.statuses.insert(
            message.id,
            StatusRecord {
                status,
                expires_at: message.expires_at,
                updated_at: message.timestamp,
            },
        );
    }

    fn set_status(&self, id: MessageId, status: DeliveryStatus) {
        if let Some(mut record) = self.statuses.get_mut(&id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
