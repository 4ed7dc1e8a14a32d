//! # Agora
//!
//! An in-process, in-memory coordination layer for multi-agent systems.
//!
//! Agora gives a set of cooperating agents three things:
//!
//! - **Shared memory**: a namespaced key/value store with version history,
//!   per-key cooperative locking, an audit log, advisory conflict detection,
//!   change subscriptions, and an atomic read-modify-write primitive.
//! - **A message bus**: direct messages, broadcast, named channels, and
//!   topic pub/sub between registered agents, with delivery-status tracking
//!   and message expiry.
//! - **Session state**: a typed repository for meeting analysis state
//!   (transcript, progress, results) layered on the shared memory.
//!
//! Memory state can be snapshotted to disk and restored; everything else is
//! deliberately transient.
//!
//! ## Quick start
//!
//! ```ignore
//! use agora::{SharedMemory, MemoryQuery};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let memory = SharedMemory::start();
//!
//!     // Agents share versioned state.
//!     memory.write("profiles", "user:1", json!({"name": "A"}), "agent-1").await?;
//!     memory.write("profiles", "user:1", json!({"name": "B"}), "agent-2").await?;
//!
//!     // Reads see the latest write; history keeps both, newest first.
//!     assert_eq!(
//!         memory.read("profiles", "user:1", "agent-1").await?,
//!         Some(json!({"name": "B"}))
//!     );
//!     assert_eq!(memory.history("profiles", "user:1", None).await?.len(), 2);
//!
//!     // Lost-update-safe counters.
//!     memory.atomic_update("counters", "hits", "agent-1", |current| {
//!         json!(current.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
//!     }).await?;
//!
//!     // Watch a key for changes.
//!     let (_id, mut changes) = memory.subscribe("profiles", "user:1", "agent-3").await?;
//!     memory.write("profiles", "user:1", json!({"name": "C"}), "agent-1").await?;
//!     let event = changes.recv().await?;
//!     assert_eq!(event.value, Some(json!({"name": "C"})));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! Writes to one key are serialized by a cooperative per-key lock with
//! bounded, jittered backoff and a watchdog that steals locks from stuck
//! holders. Reads are lock-free and may race writes; the audit log and
//! [`SharedMemory::detect_conflicts`] surface those races after the fact
//! instead of blocking them. Nothing here is a transaction and nothing
//! rolls back.

pub mod bus;
pub mod config;
pub mod conflict;
pub mod error;
pub mod lock;
pub mod memory;
pub mod query;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod types;

pub use bus::{
    AgentId, BusConfig, DeliveryStatus, Message, MessageBus, MessageId, Route, Topic,
};
pub use config::{ConflictConfig, LockConfig, MemoryConfig, RetryConfig};
pub use conflict::{ConflictKind, MemoryConflict};
pub use error::{BusError, BusResult, MemoryError, MemoryResult};
pub use memory::{MemoryStats, SharedMemory};
pub use query::{MemoryQuery, QueryResult, SortField, SortOrder};
pub use state::{
    AnalysisProgress, MeetingState, MeetingStatus, StateRepository, TranscriptSegment,
};
pub use subscriptions::{
    MemoryEvent, MemoryEventKind, SubscriptionId, SubscriptionInfo, SubscriptionScope,
};
pub use types::{FullKey, MemoryEntry, Operation, OperationKind, ValueKind, VersionRecord};
