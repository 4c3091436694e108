use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::record::SessionRecord;
use crate::error::PersistenceError;

/// Durable storage for session records, keyed by record id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, PersistenceError>;

    async fn put(&self, record: &SessionRecord) -> Result<(), PersistenceError>;

    /// Returns `true` if a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;

    async fn list(&self) -> Result<Vec<SessionRecord>, PersistenceError>;

    /// Synchronous write for shutdown paths where no runtime can be awaited.
    fn put_blocking(&self, record: &SessionRecord) -> Result<(), PersistenceError>;
}

/// One pretty-printed JSON file per record.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates `dir` if missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let name: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    fn temp_path_for(&self, id: &str) -> PathBuf {
        self.path_for(id).with_extension("json.tmp")
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(record)?;
        let temp = self.temp_path_for(&record.id);
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, self.path_for(&record.id)).await?;
        debug!("Saved session record {}", record.id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, PersistenceError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<SessionRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable session record {:?}: {}", path, e),
            }
        }

        Ok(records)
    }

    fn put_blocking(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(record)?;
        let temp = self.temp_path_for(&record.id);
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, self.path_for(&record.id))?;
        Ok(())
    }
}

/// In-process store, lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        Ok(self.records().get(id).cloned())
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        self.put_blocking(record)
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        Ok(self.records().remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, PersistenceError> {
        Ok(self.records().values().cloned().collect())
    }

    fn put_blocking(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        self.records().insert(record.id.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("sessions")).unwrap();

        let record = SessionRecord::new("session-1", Map::new());
        store.put(&record).await.unwrap();

        let loaded = store.get("session-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "session-1");
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert!(store.delete("session-1").await.unwrap());
        assert!(!store.delete("session-1").await.unwrap());
        assert!(store.get("session-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_sanitises_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let record = SessionRecord::new("../escape/attempt", Map::new());
        store.put(&record).await.unwrap();

        assert!(dir.path().join("___escape_attempt.json").exists());
        assert_eq!(
            store.get("../escape/attempt").await.unwrap().unwrap().id,
            "../escape/attempt"
        );
    }

    #[tokio::test]
    async fn test_file_store_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        store.put(&SessionRecord::new("ok", Map::new())).await.unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "ok");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.put(&SessionRecord::new("a", Map::new())).await.unwrap();
        store.put_blocking(&SessionRecord::new("b", Map::new())).unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }
}
