//! Verified-state persistence
//!
//! A single record per device says whether it has completed a verification
//! with another device of the account. The record is only consulted before
//! bootstrapping; it never gates inbound verification.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keytrust_core::{errors::StorageError, VerifiedStateRecord};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Load and save the verified-state record
#[async_trait]
pub trait VerifiedStateStore: Send + Sync {
    /// The current record; absent or unreadable state counts as not verified
    async fn load(&self) -> Result<VerifiedStateRecord, StorageError>;

    async fn save(&self, record: &VerifiedStateRecord) -> Result<(), StorageError>;
}

// ----------------------------------------------------------------------------
// JSON File Store
// ----------------------------------------------------------------------------

/// Pretty-printed JSON file, created along with its directory on first save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<file_name>`
    pub fn in_dir(dir: impl AsRef<Path>, file_name: &str) -> Self {
        Self::new(dir.as_ref().join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl VerifiedStateStore for JsonFileStore {
    async fn load(&self) -> Result<VerifiedStateRecord, StorageError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No verified state at {}", self.path.display());
                return Ok(VerifiedStateRecord::default());
            }
            Err(err) => return Err(self.io_error(err)),
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(
                    "Ignoring unreadable verified state at {}: {}",
                    self.path.display(),
                    err
                );
                Ok(VerifiedStateRecord::default())
            }
        }
    }

    async fn save(&self, record: &VerifiedStateRecord) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.io_error(err))?;
        }
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|err| self.io_error(err))
    }
}

// ----------------------------------------------------------------------------
// In-memory Store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    record: Mutex<VerifiedStateRecord>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: VerifiedStateRecord) -> Self {
        Self {
            record: Mutex::new(record),
            saves: Default::default(),
        }
    }

    pub async fn snapshot(&self) -> VerifiedStateRecord {
        self.record.lock().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl VerifiedStateStore for MemoryStateStore {
    async fn load(&self) -> Result<VerifiedStateRecord, StorageError> {
        Ok(self.snapshot().await)
    }

    async fn save(&self, record: &VerifiedStateRecord) -> Result<(), StorageError> {
        *self.record.lock().await = record.clone();
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keytrust_core::{DeviceIdentity, Timestamp};

    #[tokio::test]
    async fn test_missing_file_is_not_verified() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "state.json");
        assert!(!store.load().await.unwrap().verified);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_not_verified() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "state.json");
        tokio::fs::write(store.path(), "{not json").await.unwrap();
        assert!(!store.load().await.unwrap().verified);
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_pretty_prints() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path().join("nested/deeper"), "state.json");
        let record = VerifiedStateRecord::verified_with(
            &DeviceIdentity::new("@alice:example.org", "DEVB"),
            Timestamp::new(1_700_000_000_000),
        );
        store.save(&record).await.unwrap();

        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(raw.contains("\n  \"verified\": true"));
        assert!(raw.contains("\"verifiedAt\": \"2023-11-14T22:13:20Z\""));
        assert_eq!(store.load().await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_memory_store_counts_saves() {
        let store = MemoryStateStore::new();
        store.save(&VerifiedStateRecord::default()).await.unwrap();
        assert_eq!(store.save_count(), 1);
    }
}
