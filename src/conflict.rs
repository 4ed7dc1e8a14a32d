//! Advisory conflict detection over the audit log.
//!
//! Detection is diagnostic only: it never blocks, reorders, or rolls back
//! an operation. Callers run it after the fact and reconcile through
//! [`crate::SharedMemory::resolve_conflict`], which is just another write
//! tagged with resolution metadata. This is a deliberate design choice, not
//! a missing feature: the store offers visibility into racy access, not a
//! consistency guarantee.
use crate::config::ConflictConfig;
use crate::types::{Operation, OperationKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The kind of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two different agents wrote the same key within the window
    ConcurrentWrite,
    /// A read happened long after the most recent write to the key
    StaleRead,
}

/// A detected conflict. Derived on demand, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConflict {
    /// What kind of conflict this is
    pub kind: ConflictKind,
    /// The namespace involved
    pub namespace: String,
    /// The key involved
    pub key: String,
    /// The agents party to the conflict
    pub agent_ids: Vec<String>,
    /// The audit operation ids party to the conflict
    pub operation_ids: Vec<Uuid>,
    /// Timestamps of the conflicting operations
    pub timestamps: Vec<DateTime<Utc>>,
    /// When detection ran
    pub detected_at: DateTime<Utc>,
}

fn is_write(op: &Operation) -> bool {
    matches!(op.kind, OperationKind::Write | OperationKind::Revert)
}

/// Scan a slice of audit operations for conflicts.
///
/// Flags:
/// - `ConcurrentWrite`: any pair of writes to the same key by different
///   agents within `concurrent_write_window` of each other.
/// - `StaleRead`: any read that happened more than `stale_read_threshold`
///   after the most recent prior write to the same key.
pub fn detect(operations: &[Operation], config: &ConflictConfig) -> Vec<MemoryConflict> {
    let write_window = Duration::from_std(config.concurrent_write_window)
        .unwrap_or_else(|_| Duration::milliseconds(1000));
    let stale_threshold = Duration::from_std(config.stale_read_threshold)
        .unwrap_or_else(|_| Duration::milliseconds(30_000));

    let mut by_key: HashMap<String, Vec<&Operation>> = HashMap::new();
    for op in operations {
        by_key.entry(op.full_key()).or_default().push(op);
    }

    let detected_at = Utc::now();
    let mut conflicts = Vec::new();

    for ops in by_key.values_mut() {
        ops.sort_by_key(|op| op.timestamp);

        let writes: Vec<&&Operation> = ops.iter().filter(|op| is_write(op)).collect();

        // Concurrent writes: pairwise over the sorted writes, bounded by the
        // window so the scan stays short.
        for (i, first) in writes.iter().enumerate() {
            for second in writes.iter().skip(i + 1) {
                if second.timestamp - first.timestamp > write_window {
                    break;
                }
                if first.agent_id == second.agent_id {
                    continue;
                }
                conflicts.push(MemoryConflict {
                    kind: ConflictKind::ConcurrentWrite,
                    namespace: first.namespace.clone(),
                    key: first.key.clone(),
                    agent_ids: vec![first.agent_id.clone(), second.agent_id.clone()],
                    operation_ids: vec![first.id, second.id],
                    timestamps: vec![first.timestamp, second.timestamp],
                    detected_at,
                });
            }
        }

        // Stale reads: each read against the most recent prior write.
        for (i, op) in ops.iter().enumerate() {
            if op.kind != OperationKind::Read {
                continue;
            }
            let last_write = ops[..i].iter().rev().find(|prior| is_write(prior));
            if let Some(write) = last_write {
                if op.timestamp - write.timestamp > stale_threshold {
                    conflicts.push(MemoryConflict {
                        kind: ConflictKind::StaleRead,
                        namespace: op.namespace.clone(),
                        key: op.key.clone(),
                        agent_ids: vec![write.agent_id.clone(), op.agent_id.clone()],
                        operation_ids: vec![write.id, op.id],
                        timestamps: vec![write.timestamp, op.timestamp],
                        detected_at,
                    });
                }
            }
        }
    }

    conflicts
}
