//! # Storage Adapter
//!
//! The only persistence primitive the sync core depends on: a namespaced
//! key-value store holding JSON documents. Two backends ship with the crate:
//!
//! - [`MemoryStorage`] for tests and in-process simulations
//! - [`FileStorage`], one JSON file per key inside a data directory
//!
//! Sync code never touches raw string keys. [`TypedStorage`] binds each
//! [`StorageNamespace`] to its value type through the [`Namespace`] trait, so
//! loading `ns::Tasks` always yields `Vec<Task>`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Durable key-value store. Single-key writes are assumed atomic; nothing
/// more.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
    async fn has(&self, key: &str) -> Result<bool>;
}

/// Every storage slot the sync core reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageNamespace {
    Tasks,
    TimeBlocks,
    UserPattern,
    PendingOperations,
}

impl StorageNamespace {
    pub const ALL: [StorageNamespace; 4] = [
        StorageNamespace::Tasks,
        StorageNamespace::TimeBlocks,
        StorageNamespace::UserPattern,
        StorageNamespace::PendingOperations,
    ];

    pub fn key(self) -> &'static str {
        match self {
            StorageNamespace::Tasks => "tasks",
            StorageNamespace::TimeBlocks => "timeBlocks",
            StorageNamespace::UserPattern => "userPattern",
            StorageNamespace::PendingOperations => "pendingOperations",
        }
    }
}

/// Binds a namespace to the type stored under it.
pub trait Namespace {
    const NAMESPACE: StorageNamespace;
    type Value: Serialize + DeserializeOwned + Default + Send + Sync;
}

/// Marker types for [`TypedStorage`].
pub mod ns {
    use super::{Namespace, StorageNamespace};
    use crate::model::{SyncOperation, Task, TimeBlock, UserPattern as Pattern};

    pub struct Tasks;
    pub struct TimeBlocks;
    pub struct UserPattern;
    pub struct PendingOperations;

    impl Namespace for Tasks {
        const NAMESPACE: StorageNamespace = StorageNamespace::Tasks;
        type Value = Vec<Task>;
    }

    impl Namespace for TimeBlocks {
        const NAMESPACE: StorageNamespace = StorageNamespace::TimeBlocks;
        type Value = Vec<TimeBlock>;
    }

    impl Namespace for UserPattern {
        const NAMESPACE: StorageNamespace = StorageNamespace::UserPattern;
        type Value = Option<Pattern>;
    }

    impl Namespace for PendingOperations {
        const NAMESPACE: StorageNamespace = StorageNamespace::PendingOperations;
        type Value = Vec<SyncOperation>;
    }
}

/// Typed view over a [`StorageAdapter`].
#[derive(Clone)]
pub struct TypedStorage {
    adapter: Arc<dyn StorageAdapter>,
}

impl TypedStorage {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Missing slots read as the type's default (empty list, `None`).
    pub async fn load<N: Namespace>(&self) -> Result<N::Value> {
        let key = N::NAMESPACE.key();
        match self.adapter.get(key).await? {
            None | Some(Value::Null) => Ok(N::Value::default()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| SyncError::Storage(format!("corrupt '{}' namespace: {}", key, e))),
        }
    }

    pub async fn store<N: Namespace>(&self, value: &N::Value) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.adapter.set(N::NAMESPACE.key(), value).await
    }

    pub async fn remove<N: Namespace>(&self) -> Result<()> {
        self.adapter.delete(N::NAMESPACE.key()).await
    }
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }
}

/// Directory-backed store: `<dir>/<key>.json`.
#[derive(Clone, Debug)]
pub struct FileStorage {
    storage_dir: PathBuf,
}

impl FileStorage {
    pub async fn new(storage_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_dir).await?;
        Ok(Self { storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SyncError::Storage(format!("invalid storage key '{}'", key)));
        }
        Ok(self.storage_dir.join(format!("{}.json", key)))
    }

    async fn json_entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = fs::read_dir(&self.storage_dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path.clone()));
            }
        }

        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.entry_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.entry_path(key)?;
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(&value)?;
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Stored '{}' ({} bytes)", key, data.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        for (_, path) in self.json_entries().await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.json_entries().await?.into_iter().map(|(key, _)| key).collect())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    async fn exercise_adapter(storage: &dyn StorageAdapter) {
        assert!(!storage.has("tasks").await.unwrap());
        assert_eq!(storage.get("tasks").await.unwrap(), None);

        storage.set("tasks", json!([{"id": "t1"}])).await.unwrap();
        storage.set("userPattern", json!(null)).await.unwrap();
        assert!(storage.has("tasks").await.unwrap());
        assert_eq!(storage.get("tasks").await.unwrap(), Some(json!([{"id": "t1"}])));
        assert_eq!(storage.keys().await.unwrap(), vec!["tasks", "userPattern"]);

        storage.delete("tasks").await.unwrap();
        storage.delete("tasks").await.unwrap();
        assert!(!storage.has("tasks").await.unwrap());

        storage.clear().await.unwrap();
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_contract() {
        exercise_adapter(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_file_storage_contract() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().join("data")).await.unwrap();
        exercise_adapter(&storage).await;
    }

    #[tokio::test]
    async fn test_file_storage_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        let first = FileStorage::new(dir.clone()).await.unwrap();
        first.set("pendingOperations", json!([1, 2])).await.unwrap();

        let second = FileStorage::new(dir).await.unwrap();
        assert_eq!(second.get("pendingOperations").await.unwrap(), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_file_storage_rejects_path_like_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().to_path_buf()).await.unwrap();

        assert_matches!(storage.set("../escape", json!(1)).await, Err(SyncError::Storage(_)));
        assert_matches!(storage.get("").await, Err(SyncError::Storage(_)));
    }

    #[tokio::test]
    async fn test_typed_storage_defaults_and_round_trip() {
        let typed = TypedStorage::new(Arc::new(MemoryStorage::new()));

        assert!(typed.load::<ns::Tasks>().await.unwrap().is_empty());
        assert!(typed.load::<ns::UserPattern>().await.unwrap().is_none());

        let tasks = vec![Task::new("Water plants")];
        typed.store::<ns::Tasks>(&tasks).await.unwrap();
        assert_eq!(typed.load::<ns::Tasks>().await.unwrap(), tasks);

        typed.remove::<ns::Tasks>().await.unwrap();
        assert!(!typed.adapter().has("tasks").await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_storage_reports_corruption() {
        let adapter = Arc::new(MemoryStorage::new());
        adapter.set("tasks", json!({"not": "a list"})).await.unwrap();

        let typed = TypedStorage::new(adapter);
        assert_matches!(typed.load::<ns::Tasks>().await, Err(SyncError::Storage(_)));
    }

    #[test]
    fn test_namespace_keys() {
        let keys: Vec<&str> = StorageNamespace::ALL.iter().map(|n| n.key()).collect();
        assert_eq!(keys, vec!["tasks", "timeBlocks", "userPattern", "pendingOperations"]);
    }
}
