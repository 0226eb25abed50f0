//! Fetch checkpoints persisted by the host between invocations.

use crate::traits::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// The checkpoint object of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LastRun(Map<String, Value>);

impl LastRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// A list of strings; non-string items are skipped.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for LastRun {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Storage for per-instance checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint; an instance never saved yields an empty one.
    async fn load(&self, instance: &str) -> ConnectorResult<LastRun>;

    async fn save(&self, instance: &str, last_run: &LastRun) -> ConnectorResult<()>;

    async fn clear(&self, instance: &str) -> ConnectorResult<()>;
}

/// One pretty-printed JSON file per instance under a state directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Percent-encoded instance name, so distinct instances never share a file.
    pub fn path_for(&self, instance: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(instance)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, instance: &str) -> ConnectorResult<LastRun> {
        let path = self.path_for(instance);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(instance, "No stored checkpoint");
                return Ok(LastRun::new());
            }
            Err(e) => {
                return Err(ConnectorError::Internal(format!(
                    "Failed to read checkpoint {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if text.trim().is_empty() {
            return Ok(LastRun::new());
        }
        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::Internal(format!("Corrupt checkpoint {}: {}", path.display(), e))
        })
    }

    async fn save(&self, instance: &str, last_run: &LastRun) -> ConnectorResult<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            ConnectorError::Internal(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;
        let path = self.path_for(instance);
        let text = serde_json::to_string_pretty(last_run)
            .map_err(|e| ConnectorError::Internal(e.to_string()))?;
        tokio::fs::write(&path, text).await.map_err(|e| {
            ConnectorError::Internal(format!("Failed to write checkpoint {}: {}", path.display(), e))
        })?;
        debug!(instance, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn clear(&self, instance: &str) -> ConnectorResult<()> {
        match tokio::fs::remove_file(self.path_for(instance)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectorError::Internal(e.to_string())),
        }
    }
}

/// In-memory store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, LastRun>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, instance: &str) -> ConnectorResult<LastRun> {
        Ok(self.entries.read().await.get(instance).cloned().unwrap_or_default())
    }

    async fn save(&self, instance: &str, last_run: &LastRun) -> ConnectorResult<()> {
        self.entries
            .write()
            .await
            .insert(instance.to_string(), last_run.clone());
        Ok(())
    }

    async fn clear(&self, instance: &str) -> ConnectorResult<()> {
        self.entries.write().await.remove(instance);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_run_accessors() {
        let mut last_run = LastRun::new();
        last_run.set("ids", json!(["a", 1, "b"]));
        last_run.set("time", "2023-01-01T00:00:00");
        last_run.set("last_id", "12");
        assert_eq!(last_run.get_str_list("ids"), vec!["a", "b"]);
        assert_eq!(last_run.get_str("time"), Some("2023-01-01T00:00:00"));
        assert_eq!(last_run.get_i64("last_id"), Some(12));
        assert!(last_run.get_str_list("missing").is_empty());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("state"));

        assert!(store.load("armis prod").await.unwrap().is_empty());

        let mut last_run = LastRun::new();
        last_run.set("alerts_last_fetch_time", "2023-01-01T00:00:00");
        store.save("armis prod", &last_run).await.unwrap();
        assert!(store.path_for("armis prod").ends_with("armis%20prod.json"));
        assert_eq!(store.load("armis prod").await.unwrap(), last_run);

        store.clear("armis prod").await.unwrap();
        assert!(store.load("armis prod").await.unwrap().is_empty());
        store.clear("armis prod").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let names = ["a.b", "a_b", "a b", "a%20b", "a/b"];

        for (i, name) in names.iter().enumerate() {
            let mut last_run = LastRun::new();
            last_run.set("n", i as i64);
            store.save(name, &last_run).await.unwrap();
        }
        for (i, name) in names.iter().enumerate() {
            assert_eq!(store.load(name).await.unwrap().get_i64("n"), Some(i as i64));
            assert_eq!(store.path_for(name).parent().unwrap(), dir.path());
        }
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        std::fs::write(store.path_for("x"), "{not json").unwrap();
        assert!(store.load("x").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        let mut last_run = LastRun::new();
        last_run.set("k", 1);
        store.save("i", &last_run).await.unwrap();
        assert_eq!(store.load("i").await.unwrap(), last_run);
        store.clear("i").await.unwrap();
        assert!(store.load("i").await.unwrap().is_empty());
    }
}
