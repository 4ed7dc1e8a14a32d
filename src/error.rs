//! Error types for Agora operations.
//!
//! Two error families exist: `MemoryError` for the shared memory core and
//! `BusError` for the message bus. They are kept separate because the bus is
//! a peer of the memory core, not a layer on top of it, and callers usually
//! handle the two independently.
use thiserror::Error;

/// The main error type for shared memory operations.
///
/// All fallible operations on [`crate::SharedMemory`] return
/// `Result<T, MemoryError>`.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// A key must be a non-empty string
    #[error("Key must be a non-empty string")]
    EmptyKey,

    /// Lock acquisition gave up after the configured retry budget
    #[error("Could not acquire lock for '{full_key}' after {attempts} attempts")]
    LockTimeout {
        /// Canonical `namespace:key` the lock protects
        full_key: String,
        /// Number of acquisition attempts made
        attempts: u32,
    },

    /// Key not found in the specified namespace
    #[error("Key '{key}' not found in namespace '{namespace}'")]
    KeyNotFound {
        /// The namespace that was queried
        namespace: String,
        /// The key that was not found
        key: String,
    },

    /// No version exists at or before the specified timestamp
    #[error("No version of '{key}' in namespace '{namespace}' at or before timestamp {timestamp}")]
    NoVersionAtTimestamp {
        /// The namespace that was queried
        namespace: String,
        /// The key that was queried
        key: String,
        /// The timestamp that was queried (unix seconds)
        timestamp: i64,
    },

    /// An atomic update exhausted its retry budget
    #[error("Atomic update of '{full_key}' failed after {attempts} attempts")]
    UpdateRetriesExhausted {
        /// Canonical `namespace:key` that was being updated
        full_key: String,
        /// Number of full read-modify-write attempts made
        attempts: u32,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Subscription id is not registered
    #[error("Subscription {0} not found")]
    SubscriptionNotFound(u64),

    /// Invalid key-pattern regex in a query
    #[error("Invalid key pattern: {0}")]
    InvalidKeyPattern(#[from] regex::Error),

    /// Snapshot save/load failed
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

/// Result type alias for shared memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Error type for message bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// An agent or topic id failed validation
    #[error("Invalid id '{id}': {reason}")]
    InvalidId {
        /// The offending id string
        id: String,
        /// Why validation rejected it
        reason: String,
    },

    /// The target agent is not registered on the bus
    #[error("Agent '{0}' is not registered")]
    AgentNotFound(String),

    /// An agent with this id is already registered
    #[error("Agent '{0}' is already registered")]
    AgentAlreadyRegistered(String),

    /// The named channel does not exist
    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),

    /// The sender is not a member of the channel
    #[error("Agent '{agent}' is not a member of channel '{channel}'")]
    NotAChannelMember {
        /// The agent that attempted the send
        agent: String,
        /// The channel it targeted
        channel: String,
    },

    /// The message expired before it could be delivered
    #[error("Message {0} expired before delivery")]
    MessageExpired(String),

    /// Delivery to a registered agent failed (receiver dropped)
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Result type alias for message bus operations.
pub type BusResult<T> = Result<T, BusError>;
