//! Persistent binary store for model weights
//!
//! One record per key: the raw weights plus `{stored_at, byte_size,
//! model_version}` metadata. Records older than a configurable age are purged.
//! Callers treat a failing `retrieve` as a cache miss.

use crate::error::{SpeechError, SpeechResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Metadata kept next to stored weights
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub key: String,
    pub stored_at: DateTime<Utc>,
    pub byte_size: u64,
    pub model_version: String,
}

/// Caller-supplied part of the metadata
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub model_version: String,
    pub stored_at: DateTime<Utc>,
}

impl RecordMeta {
    /// Metadata stamped with the current time
    pub fn now(model_version: impl Into<String>) -> Self {
        Self {
            model_version: model_version.into(),
            stored_at: Utc::now(),
        }
    }
}

/// A stored model
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub meta: ModelMeta,
    pub weights: Bytes,
}

/// Key-value store for large binary model records
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Insert or replace the record under `key`
    async fn store(&self, key: &str, weights: Bytes, meta: RecordMeta) -> SpeechResult<()>;

    /// Fetch the record under `key`, `None` when absent
    async fn retrieve(&self, key: &str) -> SpeechResult<Option<ModelRecord>>;

    /// Delete the record under `key`. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> SpeechResult<()>;

    /// Delete every record stored more than `max_age_days` ago.
    /// Returns the number of records removed.
    async fn purge_stale(&self, max_age_days: u32) -> SpeechResult<usize>;

    /// Metadata of every record, without weights
    async fn list(&self) -> SpeechResult<Vec<ModelMeta>>;
}

fn cutoff(max_age_days: u32) -> DateTime<Utc> {
    Utc::now() - Duration::days(i64::from(max_age_days))
}

/// Sled-backed model store.
///
/// Metadata and weights live in separate trees so scans for staleness never
/// touch weight blobs.
pub struct SledModelStore {
    db: sled::Db,
    meta: sled::Tree,
    weights: sled::Tree,
}

impl SledModelStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> SpeechResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        let meta = db.open_tree("model_meta")?;
        let weights = db.open_tree("model_weights")?;
        info!(path = %path.display(), "Model store opened");
        Ok(Self { db, meta, weights })
    }

    fn decode_meta(raw: &[u8]) -> SpeechResult<ModelMeta> {
        Ok(bincode::deserialize(raw)?)
    }

    fn remove_sync(&self, key: &str) -> SpeechResult<()> {
        self.meta.remove(key)?;
        self.weights.remove(key)?;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> SpeechResult<T>
where
    F: FnOnce() -> SpeechResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SpeechError::Store(format!("Store task failed: {}", e)))?
}

#[async_trait]
impl ModelStore for SledModelStore {
    async fn store(&self, key: &str, weights: Bytes, meta: RecordMeta) -> SpeechResult<()> {
        let record = ModelMeta {
            key: key.to_string(),
            stored_at: meta.stored_at,
            byte_size: weights.len() as u64,
            model_version: meta.model_version,
        };
        let encoded = bincode::serialize(&record)?;
        let key = key.to_string();
        let meta_tree = self.meta.clone();
        let weights_tree = self.weights.clone();
        let db = self.db.clone();

        blocking(move || {
            // Weights first: a crash between the two writes leaves an orphan
            // blob, never metadata pointing at nothing.
            weights_tree.insert(key.as_bytes(), weights.as_ref())?;
            meta_tree.insert(key.as_bytes(), encoded)?;
            db.flush()?;
            Ok(())
        })
        .await?;

        debug!(key = %record.key, bytes = record.byte_size, "Model record stored");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> SpeechResult<Option<ModelRecord>> {
        let key = key.to_string();
        let meta_tree = self.meta.clone();
        let weights_tree = self.weights.clone();

        blocking(move || {
            let raw_meta = match meta_tree.get(key.as_bytes())? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let meta = SledModelStore::decode_meta(&raw_meta)?;

            let weights = match weights_tree.get(key.as_bytes())? {
                Some(raw) => Bytes::from(raw.to_vec()),
                None => {
                    return Err(SpeechError::CacheCorruption(format!(
                        "Metadata for {} has no weights",
                        key
                    )))
                }
            };

            if weights.len() as u64 != meta.byte_size {
                return Err(SpeechError::CacheCorruption(format!(
                    "Stored weights for {} are {} bytes, metadata says {}",
                    key,
                    weights.len(),
                    meta.byte_size
                )));
            }

            Ok(Some(ModelRecord { meta, weights }))
        })
        .await
    }

    async fn remove(&self, key: &str) -> SpeechResult<()> {
        self.remove_sync(key)?;
        debug!(key, "Model record removed");
        Ok(())
    }

    async fn purge_stale(&self, max_age_days: u32) -> SpeechResult<usize> {
        let cutoff = cutoff(max_age_days);
        let mut stale = Vec::new();

        for entry in self.meta.iter() {
            let (key, raw) = entry?;
            match Self::decode_meta(&raw) {
                Ok(meta) if meta.stored_at < cutoff => stale.push(key.to_vec()),
                Ok(_) => {}
                Err(e) => {
                    warn!("Unreadable model metadata, purging: {}", e);
                    stale.push(key.to_vec());
                }
            }
        }

        for key in &stale {
            self.meta.remove(key)?;
            self.weights.remove(key)?;
        }

        if !stale.is_empty() {
            info!(removed = stale.len(), max_age_days, "Purged stale model records");
        }
        Ok(stale.len())
    }

    async fn list(&self) -> SpeechResult<Vec<ModelMeta>> {
        let mut records = Vec::new();
        for entry in self.meta.iter() {
            let (_, raw) = entry?;
            records.push(Self::decode_meta(&raw)?);
        }
        Ok(records)
    }
}

/// In-memory model store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryModelStore {
    records: RwLock<HashMap<String, ModelRecord>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn store(&self, key: &str, weights: Bytes, meta: RecordMeta) -> SpeechResult<()> {
        let record = ModelRecord {
            meta: ModelMeta {
                key: key.to_string(),
                stored_at: meta.stored_at,
                byte_size: weights.len() as u64,
                model_version: meta.model_version,
            },
            weights,
        };
        self.records.write().insert(key.to_string(), record);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> SpeechResult<Option<ModelRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> SpeechResult<()> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn purge_stale(&self, max_age_days: u32) -> SpeechResult<usize> {
        let cutoff = cutoff(max_age_days);
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| r.meta.stored_at >= cutoff);
        Ok(before - records.len())
    }

    async fn list(&self) -> SpeechResult<Vec<ModelMeta>> {
        Ok(self.records.read().values().map(|r| r.meta.clone()).collect())
    }
}
