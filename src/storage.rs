//! Durable key-value storage.
//!
//! Pending snoozes, the offline mutation queue and cross-context handoff
//! flags all live here. Values are plain strings; structured values are JSON
//! encoded through [`get_json`] / [`set_json`].

use crate::error::{AttendError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Well-known storage keys.
pub mod keys {
    /// JSON map of task id to snooze deadline.
    pub const PENDING_TASKS: &str = "pending_tasks";
    /// JSON array of queued mutations.
    pub const OFFLINE_QUEUE: &str = "offline_queue";
    /// Id of the task occupying the activation slot.
    pub const ACTIVE_TASK_ID: &str = "active_task_id";
    /// Id of the task paused by a pending switch request.
    pub const INTERRUPTED_TASK_ID: &str = "interrupted_task_id";
    /// Elapsed seconds captured when the interrupted task was paused.
    pub const INTERRUPTED_ELAPSED_SECS: &str = "interrupted_elapsed_secs";
    /// Proposal waiting on the switch request that paused the interrupted task.
    pub const SWITCH_PROPOSAL_ID: &str = "switch_proposal_id";
    /// Task proposed by a background trigger context, awaiting reconciliation.
    pub const PROPOSED_TASK_ID: &str = "proposed_task_id";

    /// Per-task snooze preference in minutes.
    #[must_use]
    pub fn snooze_minutes(task_id: crate::task::TaskId) -> String {
        format!("snooze_minutes:{task_id}")
    }
}

/// Durable string key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw).await
}

/// Read a value that should parse with [`std::str::FromStr`].
///
/// Unparseable values are logged and treated as absent.
pub async fn get_parsed<T: std::str::FromStr>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    match raw.trim().parse() {
        Ok(v) => Ok(Some(v)),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable stored value");
            Ok(None)
        }
    }
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// File-backed store: a single JSON object written atomically.
///
/// Every operation re-reads the file so writes made by another process (a
/// background trigger context) are observed. A file that no longer parses is
/// moved to `<path>.corrupt` and the read fails; later writes start a fresh
/// file.
pub struct FileKeyValueStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileKeyValueStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(AttendError::Storage(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(map) => Ok(map),
            Err(e) => {
                let aside = self.corrupt_path();
                match tokio::fs::rename(&self.path, &aside).await {
                    Ok(()) => warn!(
                        "malformed state file at {} moved to {}: {e}",
                        self.path.display(),
                        aside.display()
                    ),
                    Err(move_err) => warn!(
                        "malformed state file at {} could not be moved aside: {move_err}",
                        self.path.display()
                    ),
                }
                Err(AttendError::Storage(format!(
                    "malformed state file {}: {e}",
                    self.path.display()
                )))
            }
        }
    }

    /// Where an unreadable state file is preserved.
    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    async fn write_all(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AttendError::Storage(format!("cannot create state directory: {e}"))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(map)?;
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| AttendError::Storage(format!("cannot write state temp file: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| AttendError::Storage(format!("cannot finalize state file: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(key.to_owned(), value);
        self.write_all(&map).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_all().await?;
        if map.remove(key).is_some() {
            self.write_all(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::task::TaskId;

    #[tokio::test]
    async fn memory_store_set_get_remove() {
        let store = MemoryKeyValueStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", "v".to_owned()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let store = MemoryKeyValueStore::new();
        set_json(&store, "ids", &vec![1, 2, 3]).await.unwrap();
        let ids: Option<Vec<i32>> = get_json(&store, "ids").await.unwrap();
        assert_eq!(ids, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn get_json_surfaces_corruption() {
        let store = MemoryKeyValueStore::new();
        store.set("ids", "{not json".to_owned()).await.unwrap();
        let result: Result<Option<Vec<i32>>> = get_json(&store, "ids").await;
        assert!(matches!(result, Err(AttendError::Serialization(_))));
    }

    #[tokio::test]
    async fn get_parsed_ignores_garbage() {
        let store = MemoryKeyValueStore::new();
        store.set(keys::ACTIVE_TASK_ID, "12".to_owned()).await.unwrap();
        store.set(keys::PROPOSED_TASK_ID, "x".to_owned()).await.unwrap();
        let active: Option<TaskId> = get_parsed(&store, keys::ACTIVE_TASK_ID).await.unwrap();
        let proposed: Option<TaskId> = get_parsed(&store, keys::PROPOSED_TASK_ID).await.unwrap();
        assert_eq!(active, Some(TaskId(12)));
        assert_eq!(proposed, None);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("state.json");

        let first = FileKeyValueStore::new(path.clone());
        first.set("a", "1".to_owned()).await.unwrap();
        first.set("b", "2".to_owned()).await.unwrap();
        first.remove("a").await.unwrap();

        let second = FileKeyValueStore::new(path);
        assert!(second.get("a").await.unwrap().is_none());
        assert_eq!(second.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn file_store_moves_malformed_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let truncated = r#"{"offline_queue": "[{\"id\": "#;
        std::fs::write(&path, truncated).unwrap();

        let store = FileKeyValueStore::new(path);
        let err = store.get(keys::OFFLINE_QUEUE).await.unwrap_err();
        assert!(matches!(err, AttendError::Storage(_)));

        let aside = dir.path().join("state.json.corrupt");
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), truncated);

        store.set(keys::ACTIVE_TASK_ID, "1".to_owned()).await.unwrap();
        assert_eq!(
            store.get(keys::ACTIVE_TASK_ID).await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), truncated);
    }

    #[test]
    fn snooze_preference_key_format() {
        assert_eq!(keys::snooze_minutes(TaskId(9)), "snooze_minutes:9");
    }
}
