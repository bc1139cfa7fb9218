//! # Resume Position Store
//!
//! Durable per-entity-type stream position for resumable CDC.
//!
//! ## Features
//!
//! - **Guarded Upserts**: a position only moves forward; stale or replayed
//!   tokens never overwrite a newer stored token
//! - **Per-Type Isolation**: records for different entity types never
//!   contend on a shared lock
//! - **Durable Storage**: JSON files with temp-file + fsync + rename writes
//!
//! ## Usage
//!
//! ```ignore
//! use sluice_cdc::common::{FileResumeTokenStore, ResumeTokenStore, ResumeToken};
//!
//! let store = FileResumeTokenStore::new("/var/lib/sluice/positions").await?;
//!
//! // Bulk migration is required when no position exists
//! if store.get("users").await?.is_none() {
//!     // ...
//! }
//!
//! // Advance after a streamed event was handled
//! store.advance("users", &ResumeToken::new("8263a1...")).await?;
//! ```

use crate::common::{CdcError, ResumeToken, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Most recently confirmed stream position for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePosition {
    /// Entity type (unique key)
    pub entity_type: String,
    /// Last durably confirmed resume token
    pub last_synced_token: ResumeToken,
    /// When the position was last advanced (Unix epoch millis)
    pub updated_at: i64,
}

impl ResumePosition {
    pub fn new(entity_type: impl Into<String>, token: ResumeToken) -> Self {
        Self {
            entity_type: entity_type.into(),
            last_synced_token: token,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Result of a guarded position upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The stored position now holds the offered token
    Advanced(ResumePosition),
    /// The stored position was already at or past the offered token
    Stale(ResumePosition),
}

impl AdvanceOutcome {
    /// The position as stored after the call.
    pub fn position(&self) -> &ResumePosition {
        match self {
            Self::Advanced(p) | Self::Stale(p) => p,
        }
    }

    pub fn is_advanced(&self) -> bool {
        matches!(self, Self::Advanced(_))
    }
}

/// Decide whether `offered` moves `stored` forward.
fn follows(stored: Option<&ResumePosition>, offered: &ResumeToken) -> bool {
    stored.is_none_or(|p| offered > &p.last_synced_token)
}

/// Storage backend for resume positions.
///
/// `advance` must behave like a compare-and-swap: write only if the offered
/// token is strictly greater than the stored one, atomically with respect
/// to other writers of the same entity type.
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    /// Read the stored position for an entity type.
    async fn get(&self, entity_type: &str) -> Result<Option<ResumePosition>>;

    /// Guarded upsert of the position for an entity type.
    async fn advance(&self, entity_type: &str, token: &ResumeToken) -> Result<AdvanceOutcome>;

    /// Remove the stored position (forces bulk migration on next start).
    async fn delete(&self, entity_type: &str) -> Result<()>;

    /// List all stored positions.
    async fn list(&self) -> Result<Vec<ResumePosition>>;
}

/// Shared resume token store.
pub type SharedResumeTokenStore = Arc<dyn ResumeTokenStore>;

/// In-memory resume token store (for testing or ephemeral pipelines).
#[derive(Debug, Default)]
pub struct MemoryResumeTokenStore {
    positions: Mutex<HashMap<String, ResumePosition>>,
}

impl MemoryResumeTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a position without the forward-only guard.
    pub fn insert(&self, position: ResumePosition) {
        self.positions
            .lock()
            .insert(position.entity_type.clone(), position);
    }
}

#[async_trait]
impl ResumeTokenStore for MemoryResumeTokenStore {
    async fn get(&self, entity_type: &str) -> Result<Option<ResumePosition>> {
        Ok(self.positions.lock().get(entity_type).cloned())
    }

    async fn advance(&self, entity_type: &str, token: &ResumeToken) -> Result<AdvanceOutcome> {
        let mut positions = self.positions.lock();
        let stored = positions.get(entity_type);
        if !follows(stored, token) {
            if let Some(p) = stored {
                return Ok(AdvanceOutcome::Stale(p.clone()));
            }
        }
        let position = ResumePosition::new(entity_type, token.clone());
        positions.insert(entity_type.to_string(), position.clone());
        Ok(AdvanceOutcome::Advanced(position))
    }

    async fn delete(&self, entity_type: &str) -> Result<()> {
        self.positions.lock().remove(entity_type);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumePosition>> {
        Ok(self.positions.lock().values().cloned().collect())
    }
}

/// Persistent resume token store.
///
/// Stores one JSON file per entity type:
/// ```text
/// base_dir/
///   users.json
///   orders.json
/// ```
pub struct FileResumeTokenStore {
    /// Base directory for position files
    base_dir: PathBuf,
    /// In-memory cache
    cache: RwLock<HashMap<String, ResumePosition>>,
    /// Per-entity-type write locks
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Whether to fsync after writes
    fsync: bool,
}

impl FileResumeTokenStore {
    /// Create a new store, loading any positions already on disk.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a store with custom options.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(CdcError::Io)?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            fsync,
        };

        store.load_all().await?;

        Ok(store)
    }

    /// Get the directory path.
    pub fn dir(&self) -> &Path {
        &self.base_dir
    }

    fn validate_key(entity_type: &str) -> Result<()> {
        if entity_type.is_empty()
            || entity_type.contains('/')
            || entity_type.contains('\\')
            || entity_type.starts_with('.')
        {
            return Err(CdcError::checkpoint(format!(
                "Invalid entity type for position file: '{}'",
                entity_type
            )));
        }
        Ok(())
    }

    fn file_path(&self, entity_type: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", entity_type))
    }

    fn lock_for(&self, entity_type: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(entity_type.to_string())
            .or_default()
            .clone()
    }

    async fn write_file(&self, position: &ResumePosition) -> Result<()> {
        let file_path = self.file_path(&position.entity_type);
        let temp_path = file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(position)
            .map_err(|e| CdcError::serialization(e.to_string()))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(CdcError::Io)?;

        file.write_all(json.as_bytes()).await.map_err(CdcError::Io)?;

        if self.fsync {
            file.sync_all().await.map_err(CdcError::Io)?;
        }

        fs::rename(&temp_path, &file_path)
            .await
            .map_err(CdcError::Io)?;
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(CdcError::Io)?;
        let mut cache = self.cache.write().await;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await.map_err(CdcError::Io)? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<ResumePosition>(&content) {
                    Ok(position) => {
                        cache.insert(position.entity_type.clone(), position);
                        loaded += 1;
                    }
                    Err(e) => warn!("Failed to parse position file {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read position file {:?}: {}", path, e),
            }
        }

        if loaded > 0 {
            info!(
                "Loaded {} resume positions from {}",
                loaded,
                self.base_dir.display()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ResumeTokenStore for FileResumeTokenStore {
    async fn get(&self, entity_type: &str) -> Result<Option<ResumePosition>> {
        Ok(self.cache.read().await.get(entity_type).cloned())
    }

    async fn advance(&self, entity_type: &str, token: &ResumeToken) -> Result<AdvanceOutcome> {
        Self::validate_key(entity_type)?;

        let lock = self.lock_for(entity_type);
        let _guard = lock.lock().await;

        let stored = self.cache.read().await.get(entity_type).cloned();
        if !follows(stored.as_ref(), token) {
            if let Some(p) = stored {
                return Ok(AdvanceOutcome::Stale(p));
            }
        }

        let position = ResumePosition::new(entity_type, token.clone());
        self.write_file(&position).await?;
        self.cache
            .write()
            .await
            .insert(entity_type.to_string(), position.clone());

        debug!("Advanced resume position for {}: {}", entity_type, token);
        Ok(AdvanceOutcome::Advanced(position))
    }

    async fn delete(&self, entity_type: &str) -> Result<()> {
        Self::validate_key(entity_type)?;

        let lock = self.lock_for(entity_type);
        let _guard = lock.lock().await;

        let file_path = self.file_path(entity_type);
        if fs::try_exists(&file_path).await.map_err(CdcError::Io)? {
            fs::remove_file(&file_path).await.map_err(CdcError::Io)?;
        }
        self.cache.write().await.remove(entity_type);

        info!("Deleted resume position for {}", entity_type);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumePosition>> {
        Ok(self.cache.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn token(n: u64) -> ResumeToken {
        ResumeToken::from_sequence(n)
    }

    #[tokio::test]
    async fn test_memory_store_advances_forward_only() {
        let store = MemoryResumeTokenStore::new();
        assert!(store.get("users").await.unwrap().is_none());

        let first = store.advance("users", &token(5)).await.unwrap();
        assert!(first.is_advanced());

        let replay = store.advance("users", &token(5)).await.unwrap();
        assert!(!replay.is_advanced());

        let older = store.advance("users", &token(3)).await.unwrap();
        assert_eq!(older, AdvanceOutcome::Stale(first.position().clone()));

        let newer = store.advance("users", &token(6)).await.unwrap();
        assert!(newer.is_advanced());
        assert_eq!(
            store.get("users").await.unwrap().unwrap().last_synced_token,
            token(6)
        );
    }

    #[tokio::test]
    async fn test_memory_store_types_are_independent() {
        let store = MemoryResumeTokenStore::new();
        store.advance("users", &token(10)).await.unwrap();
        assert!(store.advance("orders", &token(1)).await.unwrap().is_advanced());

        assert_eq!(store.list().await.unwrap().len(), 2);

        store.delete("users").await.unwrap();
        assert!(store.get("users").await.unwrap().is_none());
        assert!(store.get("orders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistent_store_survives_restart() {
        let dir = tempdir().unwrap();
        let store = FileResumeTokenStore::new(dir.path()).await.unwrap();
        store.advance("users", &token(42)).await.unwrap();

        // Create new store (simulates restart)
        let store2 = FileResumeTokenStore::new(dir.path()).await.unwrap();
        let loaded = store2.get("users").await.unwrap().unwrap();
        assert_eq!(loaded.last_synced_token, token(42));

        // Guard still applies after reload
        assert!(!store2.advance("users", &token(41)).await.unwrap().is_advanced());
    }

    #[tokio::test]
    async fn test_persistent_store_delete() {
        let dir = tempdir().unwrap();
        let store = FileResumeTokenStore::with_options(dir.path(), false)
            .await
            .unwrap();
        store.advance("orders", &token(1)).await.unwrap();
        assert!(dir.path().join("orders.json").exists());

        store.delete("orders").await.unwrap();
        assert!(!dir.path().join("orders.json").exists());
        assert!(store.get("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistent_store_invalid_key() {
        let dir = tempdir().unwrap();
        let store = FileResumeTokenStore::new(dir.path()).await.unwrap();

        assert!(store.advance("", &token(1)).await.is_err());
        assert!(store.advance("foo/bar", &token(1)).await.is_err());
        assert!(store.advance("foo\\bar", &token(1)).await.is_err());
        assert!(store.advance("..", &token(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_advances_keep_maximum() {
        let store: SharedResumeTokenStore = Arc::new(MemoryResumeTokenStore::new());

        let mut handles = Vec::new();
        for n in [7u64, 3, 9, 1, 8] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.advance("users", &token(n)).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = store.get("users").await.unwrap().unwrap();
        assert_eq!(stored.last_synced_token, token(9));
    }
}
