//! Query engine for the shared memory core.
//!
//! Queries are a linear scan over entry snapshots, filtered by namespace
//! set, key-pattern regex, value kind, and last-updated time range, with
//! optional sorting and limiting. The operation history for matched entries
//! can be included for conflict forensics.
//!
//! # Example
//!
//! ```ignore
//! use agora::query::{MemoryQuery, SortField, SortOrder};
//!
//! let query = MemoryQuery::new()
//!     .in_namespace("transcripts")
//!     .key_matching(r"^meeting-\d+$")
//!     .sort_by(SortField::LastUpdated, SortOrder::Desc)
//!     .limit(10);
//!
//! let result = memory.query(query)?;
//! ```
use crate::error::MemoryResult;
use crate::types::{MemoryEntry, Operation, ValueKind};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending (smallest first)
    Asc,
    /// Descending (largest first)
    Desc,
}

/// Field to sort matched entries by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    /// Sort by the canonical `namespace:key`
    Key,
    /// Sort by the last-updated timestamp
    LastUpdated,
}

/// A query against shared memory entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Namespaces to include (empty = all)
    pub namespaces: Vec<String>,
    /// Regex the key must match
    pub key_pattern: Option<String>,
    /// Required value kind of the current value
    pub kind: Option<ValueKind>,
    /// Only entries updated at or after this time
    pub updated_after: Option<DateTime<Utc>>,
    /// Only entries updated at or before this time
    pub updated_before: Option<DateTime<Utc>>,
    /// Include audit operations for matched entries
    pub include_operations: bool,
    /// Sort specification
    pub sort: Option<(SortField, SortOrder)>,
    /// Maximum number of entries returned
    pub limit: Option<usize>,
}

impl MemoryQuery {
    /// Create an empty query that matches every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a namespace. Can be called repeatedly to build a set.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.push(namespace.into());
        self
    }

    /// Require keys to match a regex pattern.
    pub fn key_matching(mut self, pattern: impl Into<String>) -> Self {
        self.key_pattern = Some(pattern.into());
        self
    }

    /// Require the current value to have a specific JSON shape.
    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Only entries updated at or after the given time.
    pub fn updated_after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.updated_after = Some(timestamp);
        self
    }

    /// Only entries updated at or before the given time.
    pub fn updated_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.updated_before = Some(timestamp);
        self
    }

    /// Include the audit operations for matched entries in the result.
    pub fn with_operations(mut self) -> Self {
        self.include_operations = true;
        self
    }

    /// Sort matched entries.
    pub fn sort_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort = Some((field, order));
        self
    }

    /// Limit the number of entries returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of a memory query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matched entries, after sort and limit
    pub entries: Vec<MemoryEntry>,
    /// Total matches before the limit was applied
    pub matched: usize,
    /// Audit operations for the matched entries, if requested
    pub operations: Option<Vec<Operation>>,
}

/// Executes queries against entry snapshots.
pub struct QueryExecutor;

impl QueryExecutor {
    /// Run a query over entry snapshots.
    ///
    /// `operations` is only consulted when the query asks for operation
    /// history; pass the audit log (oldest first).
    pub fn execute(
        query: &MemoryQuery,
        entries: Vec<MemoryEntry>,
        operations: &[Operation],
    ) -> MemoryResult<QueryResult> {
        let key_regex = match &query.key_pattern {
            Some(pattern) => Some(Regex::new(pattern)?),
            None => None,
        };

        let mut matched: Vec<MemoryEntry> = entries
            .into_iter()
            .filter(|entry| Self::matches(query, key_regex.as_ref(), entry))
            .collect();

        if let Some((field, order)) = query.sort {
            matched.sort_by(|a, b| {
                let ordering = match field {
                    SortField::Key => {
                        let ka = format!("{}:{}", a.namespace, a.key);
                        let kb = format!("{}:{}", b.namespace, b.key);
                        ka.cmp(&kb)
                    }
                    SortField::LastUpdated => a.last_updated.cmp(&b.last_updated),
                };
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        let total = matched.len();
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        let operations = if query.include_operations {
            let keys: HashSet<(String, String)> = matched
                .iter()
                .map(|e| (e.namespace.clone(), e.key.clone()))
                .collect();
            Some(
                operations
                    .iter()
                    .filter(|op| keys.contains(&(op.namespace.clone(), op.key.clone())))
                    .cloned()
                    .collect(),
            )
        } else {
            None
        };

        Ok(QueryResult {
            entries: matched,
            matched: total,
            operations,
        })
    }

    fn matches(query: &MemoryQuery, key_regex: Option<&Regex>, entry: &MemoryEntry) -> bool {
        if !query.namespaces.is_empty() && !query.namespaces.contains(&entry.namespace) {
            return false;
        }

        if let Some(regex) = key_regex {
            if !regex.is_match(&entry.key) {
                return false;
            }
        }

        if let Some(kind) = query.kind {
            if entry.kind != Some(kind) {
                return false;
            }
        }

        if let Some(after) = query.updated_after {
            if entry.last_updated < after {
                return false;
            }
        }

        if let Some(before) = query.updated_before {
            if entry.last_updated > before {
                return false;
            }
        }

        true
    }
}
