//! Snapshot persistence for the shared memory core.
//!
//! Saves the whole store (entries, version histories, audit log) as one JSON
//! document. Writes go to a temporary file first and are renamed into place,
//! so a crash mid-save leaves the previous snapshot intact rather than a
//! truncated file.
//!
//! Persistence is best-effort by contract: [`SharedMemory::save_snapshot`]
//! logs failures and returns, because a failed save must never take the
//! in-memory state down with it. Loading returns typed errors, since a
//! caller restoring state needs to know it did not get any.
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::SharedMemory;
use crate::store::MemoryStore;
use crate::types::{MemoryEntry, Operation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current snapshot format version.
const FORMAT_VERSION: u32 = 1;

/// On-disk snapshot document.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    /// Format version, checked on load
    format_version: u32,
    /// When the snapshot was taken
    saved_at: DateTime<Utc>,
    /// Every entry with its full version history
    entries: Vec<MemoryEntry>,
    /// The audit log at save time
    operations: Vec<Operation>,
}

/// Save a snapshot of the memory state to `path`.
///
/// Parent directories are created as needed. The write is atomic at the
/// filesystem level: data lands in `<path>.tmp` and is renamed over the
/// target.
pub async fn save(memory: &SharedMemory, path: impl AsRef<Path>) -> MemoryResult<()> {
    let path = path.as_ref();
    let snapshot = SnapshotFile {
        format_version: FORMAT_VERSION,
        saved_at: Utc::now(),
        entries: memory.store().scan_all(),
        operations: memory.store().operations(),
    };

    let data = serde_json::to_vec_pretty(&snapshot)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MemoryError::Snapshot(format!("create {parent:?}: {e}")))?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &data)
        .await
        .map_err(|e| MemoryError::Snapshot(format!("write {tmp_path:?}: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| MemoryError::Snapshot(format!("rename to {path:?}: {e}")))?;

    tracing::debug!(
        path = %path.display(),
        entries = snapshot.entries.len(),
        bytes = data.len(),
        "snapshot saved"
    );
    Ok(())
}

/// Load a snapshot from `path` into a fresh memory instance.
///
/// Values are re-deduplicated as entries are restored. Fails on missing
/// files, malformed JSON, and unknown format versions.
pub async fn load(path: impl AsRef<Path>, config: MemoryConfig) -> MemoryResult<SharedMemory> {
    let path = path.as_ref();
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| MemoryError::Snapshot(format!("read {path:?}: {e}")))?;

    let snapshot: SnapshotFile = serde_json::from_slice(&data)?;
    if snapshot.format_version != FORMAT_VERSION {
        return Err(MemoryError::Snapshot(format!(
            "unsupported snapshot format version {} (expected {FORMAT_VERSION})",
            snapshot.format_version
        )));
    }

    let store = MemoryStore::restore(
        snapshot.entries,
        snapshot.operations,
        config.max_history,
        config.audit_log_cap,
    );

    tracing::debug!(
        path = %path.display(),
        entries = store.entry_count(),
        "snapshot loaded"
    );
    Ok(SharedMemory::from_store(store, config))
}

impl SharedMemory {
    /// Save a snapshot, swallowing failures.
    ///
    /// Returns whether the save succeeded. Failures are logged at error
    /// level; memory state is never affected.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> bool {
        match save(self, path.as_ref()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    path = %path.as_ref().display(),
                    error = %err,
                    "snapshot save failed; continuing with in-memory state"
                );
                false
            }
        }
    }

    /// Load a snapshot into a new instance with the given configuration.
    pub async fn load_snapshot(
        path: impl AsRef<Path>,
        config: MemoryConfig,
    ) -> MemoryResult<Self> {
        load(path, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.json");

        let memory = SharedMemory::start();
        memory
            .write("profiles", "user:1", json!({"n": 1}), "agent-1")
            .await
            .unwrap();
        memory
            .write("profiles", "user:1", json!({"n": 2}), "agent-1")
            .await
            .unwrap();
        memory
            .write("config", "app", json!("on"), "agent-2")
            .await
            .unwrap();

        save(&memory, &path).await.unwrap();

        let restored = load(&path, MemoryConfig::default()).await.unwrap();
        assert_eq!(
            restored.read("profiles", "user:1", "agent-1").await.unwrap(),
            Some(json!({"n": 2}))
        );
        assert_eq!(
            restored.read("config", "app", "agent-1").await.unwrap(),
            Some(json!("on"))
        );

        // Version history survives the roundtrip.
        let history = restored.history("profiles", "user:1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].value(), &json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_load_enforces_smaller_history_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.json");

        let memory = SharedMemory::start();
        for i in 0..10 {
            memory.write("ns", "k", json!(i), "agent-1").await.unwrap();
        }
        save(&memory, &path).await.unwrap();

        let restored = load(&path, MemoryConfig::default().with_max_history(3))
            .await
            .unwrap();

        let history = restored.history("ns", "k", None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value(), &json!(9));
    }

    #[tokio::test]
    async fn test_audit_log_survives_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.json");

        let memory = SharedMemory::start();
        memory.write("ns", "k", json!(1), "agent-1").await.unwrap();
        memory.read("ns", "k", "agent-2").await.unwrap();

        save(&memory, &path).await.unwrap();
        let restored = load(&path, MemoryConfig::default()).await.unwrap();

        let ops = restored.operations().await;
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].agent_id, "agent-1");
        assert_eq!(ops[1].agent_id, "agent-2");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(dir.path().join("absent.json"), MemoryConfig::default()).await;
        assert!(matches!(result, Err(MemoryError::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.json");

        let document = json!({
            "format_version": 99,
            "saved_at": Utc::now(),
            "entries": [],
            "operations": [],
        });
        tokio::fs::write(&path, serde_json::to_vec(&document).unwrap())
            .await
            .unwrap();

        let result = load(&path, MemoryConfig::default()).await;
        assert!(matches!(result, Err(MemoryError::Snapshot(_))));
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let result = load(&path, MemoryConfig::default()).await;
        assert!(matches!(result, Err(MemoryError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("agora.json");

        let memory = SharedMemory::start();
        memory.write("ns", "k", json!(1), "agent-1").await.unwrap();

        save(&memory, &path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_save_snapshot_is_best_effort() {
        let memory = SharedMemory::start();
        memory.write("ns", "k", json!(1), "agent-1").await.unwrap();

        // A directory path cannot be renamed over; the save fails quietly.
        let dir = tempfile::tempdir().unwrap();
        assert!(!memory.save_snapshot(dir.path()).await);

        // Memory is untouched either way.
        assert_eq!(
            memory.read("ns", "k", "agent-1").await.unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.json");

        let memory = SharedMemory::start();
        memory.write("ns", "k", json!(1), "agent-1").await.unwrap();
        save(&memory, &path).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
