//! Durable storage for queued jobs
//!
//! The engine persists every status transition through the [`QueueRepository`]
//! trait and reads the store back only once, at startup. Two implementations
//! are provided: an in-memory map used by tests and a JSON document per
//! collection on disk.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::QueueItem;

/// Repository error types
///
/// A missing item is not an error: `get` returns `Ok(None)`.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// I/O error while reading or writing the store
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
    /// The stored document could not be encoded or decoded
    #[error("Storage encoding error: {0}")]
    Json(#[from] serde_json::Error),
    /// The stored document has an unexpected shape
    #[error("Corrupt collection {collection}: {reason}")]
    Corrupt { collection: String, reason: String },
}

/// Key-value store of queue items for one named collection
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Name of the collection this repository writes to
    fn collection(&self) -> &str;

    /// Insert or replace an item, keyed by its id
    async fn put(&self, item: &QueueItem) -> Result<(), RepositoryError>;

    /// Look up an item by id
    async fn get(&self, id: &str) -> Result<Option<QueueItem>, RepositoryError>;

    /// Delete an item; deleting a missing id is not an error
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;

    /// Every stored item, in no particular order
    async fn get_all(&self) -> Result<Vec<QueueItem>, RepositoryError>;

    /// Remove every item of the collection
    async fn clear(&self) -> Result<(), RepositoryError>;
}

/// In-memory repository, mostly useful for tests
pub struct MemoryRepository {
    collection: String,
    items: Mutex<HashMap<String, QueueItem>>,
}

impl MemoryRepository {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            items: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QueueRepository for MemoryRepository {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn put(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        self.items.lock().await.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, RepositoryError> {
        Ok(self.items.lock().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.items.lock().await.remove(id);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<QueueItem>, RepositoryError> {
        Ok(self.items.lock().await.values().cloned().collect())
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        self.items.lock().await.clear();
        Ok(())
    }
}

/// File-backed repository
///
/// Each collection is one JSON object (`id -> item`) stored at
/// `<data_dir>/<collection>.json`. The whole document is rewritten on every
/// change through a temporary file and an atomic rename, so a crash leaves
/// either the old or the new document on disk.
pub struct FileRepository {
    collection: String,
    path: PathBuf,
    items: Mutex<HashMap<String, QueueItem>>,
}

impl FileRepository {
    /// Open (or create) the collection file inside `data_dir`
    pub async fn open(
        data_dir: impl AsRef<Path>,
        collection: impl Into<String>,
    ) -> Result<Self, RepositoryError> {
        let collection = collection.into();
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;

        let path = data_dir.join(format!("{}.json", collection));
        let items = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => HashMap::new(),
            Ok(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                if !value.is_object() {
                    return Err(RepositoryError::Corrupt {
                        collection,
                        reason: "expected a JSON object keyed by job id".to_string(),
                    });
                }
                serde_json::from_value(value)?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No stored collection at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            collection,
            path,
            items: Mutex::new(items),
        })
    }

    /// Path of the collection document
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, items: &HashMap<String, QueueItem>) -> Result<(), RepositoryError> {
        let data = serde_json::to_vec_pretty(items)?;
        let tmp_path = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp_path, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            warn!(
                "Failed to replace collection file {}: {}",
                self.path.display(),
                e
            );
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply `change` to a copy of the collection, write it, then commit it
    /// in memory only when the write succeeded.
    async fn update<F>(&self, change: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut HashMap<String, QueueItem>),
    {
        let mut items = self.items.lock().await;
        let mut next = items.clone();
        change(&mut next);
        self.flush(&next).await?;
        *items = next;
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for FileRepository {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn put(&self, item: &QueueItem) -> Result<(), RepositoryError> {
        let item = item.clone();
        self.update(move |items| {
            items.insert(item.id.clone(), item);
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, RepositoryError> {
        Ok(self.items.lock().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.update(|items| {
            items.remove(id);
        })
        .await
    }

    async fn get_all(&self) -> Result<Vec<QueueItem>, RepositoryError> {
        Ok(self.items.lock().await.values().cloned().collect())
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        self.update(|items| items.clear()).await
    }
}
