//! Common types used throughout the shared memory core.
//!
//! This module defines the internal data model: fully-qualified keys,
//! version records, entry snapshots, and the append-only audit operation
//! record that conflict detection later consumes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use uuid::Uuid;

/// A fully-qualified key combining namespace and key.
///
/// Agora organizes shared memory into namespaces (per meeting, per concern)
/// with keys within each namespace. Each `(namespace, key)` pair maps to at
/// most one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FullKey {
    /// The namespace (e.g., "meeting_state", "transcripts")
    pub namespace: String,
    /// The key within the namespace (e.g., "meeting-42")
    pub key: String,
}

impl FullKey {
    /// Create a new fully-qualified key.
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Get the canonical string representation.
    ///
    /// Format: "namespace:key". This is the string the per-key locks are
    /// keyed by.
    pub fn to_canonical_string(&self) -> String {
        format!("{}:{}", self.namespace, self.key)
    }
}

impl std::fmt::Display for FullKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// The JSON shape of a stored value.
///
/// Recorded alongside each version so queries can filter by value type
/// without inspecting the value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// JSON null
    Null,
    /// JSON boolean
    Bool,
    /// JSON number
    Number,
    /// JSON string
    String,
    /// JSON array
    Array,
    /// JSON object
    Object,
}

impl ValueKind {
    /// Derive the kind from a JSON value.
    pub fn of(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(_) => Self::Bool,
            JsonValue::Number(_) => Self::Number,
            JsonValue::String(_) => Self::String,
            JsonValue::Array(_) => Self::Array,
            JsonValue::Object(_) => Self::Object,
        }
    }
}

/// The kind of operation that produced a version or audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A value was read
    Read,
    /// A value was written
    Write,
    /// An entry was deleted
    Delete,
    /// A historical value was re-written as the current value
    Revert,
}

/// A single version of a value.
///
/// Every write prepends one of these to the entry's version list, so index 0
/// is always the most recent version. The value is `Arc`-wrapped: identical
/// values across versions and keys share one allocation, keyed by the
/// content-addressed version id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    /// The stored value (Arc-wrapped for deduplication)
    #[serde(
        serialize_with = "serialize_arc_json",
        deserialize_with = "deserialize_arc_json"
    )]
    pub value: Arc<JsonValue>,
    /// The JSON shape of the value
    pub kind: ValueKind,
    /// When this version was created
    pub timestamp: DateTime<Utc>,
    /// The agent that performed the write
    pub agent_id: String,
    /// The operation that produced this version
    pub operation: OperationKind,
    /// Content-addressed id of this version (blake3 of the canonical JSON)
    pub version_id: String,
    /// Caller-supplied metadata attached to the write
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, JsonValue>,
}

/// Serialize Arc<JsonValue> as plain JsonValue
fn serialize_arc_json<S>(value: &Arc<JsonValue>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    value.as_ref().serialize(serializer)
}

/// Deserialize JsonValue into Arc<JsonValue>
fn deserialize_arc_json<'de, D>(deserializer: D) -> Result<Arc<JsonValue>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(Arc::new(value))
}

impl VersionRecord {
    /// Get the value as a reference.
    pub fn value(&self) -> &JsonValue {
        &self.value
    }
}

/// A point-in-time snapshot of a memory entry.
///
/// Returned by reads and queries. `current_value` is `None` for placeholder
/// entries created by a subscribe before any write landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// The namespace this entry belongs to
    pub namespace: String,
    /// The key within the namespace
    pub key: String,
    /// The current value, if any has been written
    pub current_value: Option<JsonValue>,
    /// The JSON shape of the current value
    pub kind: Option<ValueKind>,
    /// When the entry was first created (first write or first subscribe)
    pub created: DateTime<Utc>,
    /// When the entry was last written
    pub last_updated: DateTime<Utc>,
    /// Agents subscribed to this entry
    pub subscribers: Vec<String>,
    /// Version history, newest first
    pub versions: Vec<VersionRecord>,
}

/// An append-only audit log record.
///
/// Every read, write, delete, and revert appends one of these. The conflict
/// detector scans them after the fact; nothing in the write path ever blocks
/// on the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id of this operation
    pub id: Uuid,
    /// What happened
    pub kind: OperationKind,
    /// The namespace acted on
    pub namespace: String,
    /// The key acted on
    pub key: String,
    /// The agent that performed the operation
    pub agent_id: String,
    /// When the operation completed
    pub timestamp: DateTime<Utc>,
    /// The value involved, for writes and reverts
    pub value: Option<JsonValue>,
}

impl Operation {
    /// Create a new audit record with a fresh id and the current time.
    pub fn new(
        kind: OperationKind,
        namespace: impl Into<String>,
        key: impl Into<String>,
        agent_id: impl Into<String>,
        value: Option<JsonValue>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            namespace: namespace.into(),
            key: key.into(),
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            value,
        }
    }

    /// Canonical `namespace:key` this operation targeted.
    pub fn full_key(&self) -> String {
        format!("{}:{}", self.namespace, self.key)
    }
}

/// Compute the content-addressed version id for a value.
///
/// Identical JSON values always hash to the same id, which is what makes the
/// value store's deduplication work.
pub(crate) fn version_id_for(value: &JsonValue) -> String {
    // serde_json serialization of a Value is deterministic (map keys keep
    // insertion order and Value maps are ordered), so hashing the bytes is
    // stable for equal values.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_key_canonical_string() {
        let key = FullKey::new("meeting_state", "meeting-42");
        assert_eq!(key.to_canonical_string(), "meeting_state:meeting-42");
    }

    #[test]
    fn test_full_key_equality() {
        let key1 = FullKey::new("a", "x");
        let key2 = FullKey::new("a", "x");
        let key3 = FullKey::new("a", "y");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_value_kind_of() {
        assert_eq!(ValueKind::of(&json!(null)), ValueKind::Null);
        assert_eq!(ValueKind::of(&json!(true)), ValueKind::Bool);
        assert_eq!(ValueKind::of(&json!(42)), ValueKind::Number);
        assert_eq!(ValueKind::of(&json!("hi")), ValueKind::String);
        assert_eq!(ValueKind::of(&json!([1, 2])), ValueKind::Array);
        assert_eq!(ValueKind::of(&json!({"a": 1})), ValueKind::Object);
    }

    #[test]
    fn test_version_id_deterministic() {
        let a = version_id_for(&json!({"name": "Alice", "age": 30}));
        let b = version_id_for(&json!({"name": "Alice", "age": 30}));
        let c = version_id_for(&json!({"name": "Bob"}));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_operation_full_key() {
        let op = Operation::new(OperationKind::Write, "ns", "k", "agent-1", Some(json!(1)));
        assert_eq!(op.full_key(), "ns:k");
        assert_eq!(op.kind, OperationKind::Write);
        assert_eq!(op.agent_id, "agent-1");
    }

    #[test]
    fn test_version_record_serde_roundtrip() {
        let record = VersionRecord {
            value: Arc::new(json!({"n": 1})),
            kind: ValueKind::Object,
            timestamp: Utc::now(),
            agent_id: "agent-1".to_string(),
            operation: OperationKind::Write,
            version_id: version_id_for(&json!({"n": 1})),
            metadata: Map::new(),
        };

        let text = serde_json::to_string(&record).unwrap();
        let back: VersionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.value(), record.value());
        assert_eq!(back.version_id, record.version_id);
    }
}
