//! Vector cache store
//!
//! One JSON file per document holding every fragment's raw vector and
//! metadata, so embeddings can be re-pushed to any backend without paying
//! for them again. The file name is a UUIDv5 (URL namespace) of
//! `ws_{workspace_id}_{document_name}` and the body is a JSON array of
//! `{vectorDbId, values, metadata}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;
use vdm_core::{CacheConfig, Document, Result, VdmError};

use crate::{Metadata, VectorRecord};

const EXTENSION: &str = "json";

/// One cached fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "vectorDbId")]
    pub vector_db_id: String,
    pub values: Vec<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl From<VectorRecord> for CacheEntry {
    fn from(record: VectorRecord) -> Self {
        Self {
            vector_db_id: record.id,
            values: record.values,
            metadata: record.metadata,
        }
    }
}

impl From<CacheEntry> for VectorRecord {
    fn from(entry: CacheEntry) -> Self {
        VectorRecord::new(entry.vector_db_id, entry.values, entry.metadata)
    }
}

/// Held while one cache file is read and rewritten; releases its lock
/// entry once nobody else is waiting on it
struct FileGuard<'a> {
    store: &'a VectorCacheStore,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.store.prune_lock(&self.key);
    }
}

/// File-backed cache of document vectors.
///
/// Writes to one file are serialised through a per-file async lock, which
/// covers writers inside this process only.
pub struct VectorCacheStore {
    directory: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl VectorCacheStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.directory.clone())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Deterministic cache key for a document, without extension
    pub fn cache_key(workspace_id: i64, document_name: &str) -> String {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("ws_{workspace_id}_{document_name}").as_bytes(),
        )
        .to_string()
    }

    pub fn key_for(document: &Document) -> String {
        Self::cache_key(document.workspace_id, &document.name)
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.{EXTENSION}"))
    }

    async fn lock(&self, key: &str) -> FileGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        FileGuard {
            store: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Forget a key's lock when the map holds the only reference
    fn prune_lock(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    /// Number of keys with a live lock entry
    pub fn tracked_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.path(key)).await.unwrap_or(false)
    }

    /// Read a cache file; `None` when it does not exist
    pub async fn read(&self, key: &str) -> Result<Option<Vec<CacheEntry>>> {
        let path = self.path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VdmError::CacheError(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            VdmError::CacheError(format!("Could not read JSON data from {}: {e}", path.display()))
        })
    }

    /// Read a cache file that must exist
    pub async fn read_required(&self, key: &str) -> Result<Vec<CacheEntry>> {
        self.read(key)
            .await?
            .ok_or_else(|| VdmError::CacheMissing(self.path(key).display().to_string()))
    }

    /// Replace a cache file wholesale
    pub async fn write(&self, key: &str, entries: &[CacheEntry]) -> Result<()> {
        let _guard = self.lock(key).await;
        self.write_unlocked(key, entries).await
    }

    async fn write_unlocked(&self, key: &str, entries: &[CacheEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| VdmError::CacheError(format!("Failed to create cache folder: {e}")))?;

        let body = serde_json::to_vec(entries)
            .map_err(|e| VdmError::CacheError(format!("Failed to encode cache entries: {e}")))?;

        let path = self.path(key);
        let staging = path.with_extension(format!("{EXTENSION}.tmp"));
        tokio::fs::write(&staging, body)
            .await
            .map_err(|e| VdmError::CacheError(format!("Failed to write {}: {e}", staging.display())))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| VdmError::CacheError(format!("Failed to replace {}: {e}", path.display())))?;

        tracing::debug!(cache = key, entries = entries.len(), "Vector cache stored");
        Ok(())
    }

    /// Delete a cache file; returns whether one existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock(key).await;

        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => {
                tracing::info!(cache = key, "Removed vector-cache file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VdmError::CacheError(format!(
                "Failed to remove cache {key}: {e}"
            ))),
        }
    }

    /// Replace values and metadata of one entry, leaving the rest untouched.
    ///
    /// Returns `false` when no entry carries `vector_id`; the file is then
    /// left as it was.
    pub async fn update_entry(
        &self,
        key: &str,
        vector_id: &str,
        values: Vec<f64>,
        metadata: Metadata,
    ) -> Result<bool> {
        let _guard = self.lock(key).await;

        let mut entries = self.read_required(key).await?;
        let Some(entry) = entries.iter_mut().find(|e| e.vector_db_id == vector_id) else {
            return Ok(false);
        };
        entry.values = values;
        entry.metadata = metadata;

        self.write_unlocked(key, &entries).await?;
        Ok(true)
    }

    /// Drop one entry; returns whether it was present
    pub async fn remove_entry(&self, key: &str, vector_id: &str) -> Result<bool> {
        let _guard = self.lock(key).await;

        let Some(mut entries) = self.read(key).await? else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| e.vector_db_id != vector_id);
        if entries.len() == before {
            return Ok(false);
        }

        self.write_unlocked(key, &entries).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(id: &str, values: Vec<f64>) -> CacheEntry {
        CacheEntry {
            vector_db_id: id.to_string(),
            values,
            metadata: json!({ "text": id }).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = VectorCacheStore::cache_key(4, "report.pdf");
        assert_eq!(a, VectorCacheStore::cache_key(4, "report.pdf"));
        assert_ne!(a, VectorCacheStore::cache_key(5, "report.pdf"));
        assert_eq!(
            a,
            Uuid::new_v5(&Uuid::NAMESPACE_URL, b"ws_4_report.pdf").to_string()
        );
    }

    #[test]
    fn test_entry_wire_format() {
        let value = serde_json::to_value(entry("v1", vec![0.5])).unwrap();
        assert_eq!(
            value,
            json!({ "vectorDbId": "v1", "values": [0.5], "metadata": { "text": "v1" } })
        );
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = VectorCacheStore::new(dir.path());
        assert_eq!(store.read("nope").await.unwrap(), None);
        assert!(matches!(
            store.read_required("nope").await,
            Err(VdmError::CacheMissing(_))
        ));
        assert!(!store.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_creates_directory_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let store = VectorCacheStore::new(dir.path().join("nested/cache"));
        let entries = vec![entry("a", vec![1.0]), entry("b", vec![2.0])];

        store.write("doc", &entries).await.unwrap();
        assert!(store.exists("doc").await);
        assert_eq!(store.read("doc").await.unwrap().unwrap(), entries);
    }

    #[tokio::test]
    async fn test_update_entry_touches_only_target() {
        let dir = TempDir::new().unwrap();
        let store = VectorCacheStore::new(dir.path());
        store
            .write("doc", &[entry("a", vec![1.0]), entry("b", vec![2.0])])
            .await
            .unwrap();

        let metadata = json!({ "text": "new" }).as_object().cloned().unwrap();
        assert!(store
            .update_entry("doc", "b", vec![9.0], metadata.clone())
            .await
            .unwrap());
        assert!(!store
            .update_entry("doc", "zzz", vec![0.0], Metadata::new())
            .await
            .unwrap());

        let entries = store.read("doc").await.unwrap().unwrap();
        assert_eq!(entries[0], entry("a", vec![1.0]));
        assert_eq!(entries[1].values, vec![9.0]);
        assert_eq!(entries[1].metadata, metadata);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(VectorCacheStore::new(dir.path()));
        let initial: Vec<CacheEntry> = (0..20).map(|i| entry(&format!("v{i}"), vec![0.0])).collect();
        store.write("doc", &initial).await.unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .update_entry("doc", &format!("v{i}"), vec![i as f64], Metadata::new())
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        let entries = store.read("doc").await.unwrap().unwrap();
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.values, vec![i as f64]);
        }
    }

    #[tokio::test]
    async fn test_double_precision_survives_rewrite() {
        let dir = TempDir::new().unwrap();
        let store = VectorCacheStore::new(dir.path());
        std::fs::write(
            store.path("doc"),
            r#"[{"vectorDbId":"a","values":[0.0123456789012345,-0.987654321098765],"metadata":{"text":"a"}}]"#,
        )
        .unwrap();

        let expected = [0.0123456789012345_f64, -0.987654321098765];
        let close = |values: &[f64]| {
            values.len() == 2 && values.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-15)
        };

        let entries = store.read_required("doc").await.unwrap();
        assert!(close(&entries[0].values));

        store.write("doc", &entries).await.unwrap();
        let reread = store.read_required("doc").await.unwrap();
        assert_eq!(reread, entries);
        assert!(close(&reread[0].values));
    }

    #[tokio::test]
    async fn test_locks_are_released() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(VectorCacheStore::new(dir.path()));
        let keys: Vec<String> = (0..10).map(|i| format!("doc-{i}")).collect();

        let tasks: Vec<_> = keys
            .iter()
            .cloned()
            .map(|key| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.write(&key, &[entry("a", vec![1.0])]).await.unwrap();
                    store
                        .update_entry(&key, "a", vec![2.0], Metadata::new())
                        .await
                        .unwrap();
                    store.remove_entry(&key, "a").await.unwrap();
                    store.delete(&key).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let dir = TempDir::new().unwrap();
        let store = VectorCacheStore::new(dir.path());
        store
            .write("doc", &[entry("a", vec![1.0]), entry("b", vec![2.0])])
            .await
            .unwrap();

        assert!(store.remove_entry("doc", "a").await.unwrap());
        assert!(!store.remove_entry("doc", "a").await.unwrap());
        let entries = store.read("doc").await.unwrap().unwrap();
        assert_eq!(entries, vec![entry("b", vec![2.0])]);
    }
}
