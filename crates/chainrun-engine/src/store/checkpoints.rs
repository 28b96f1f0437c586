//! Checkpoint storage.
//!
//! Checkpoints are append-only. Content above a size threshold is moved to a
//! blob keyed by the checkpoint id and replaced by a [`BlobRef`] carrying its
//! SHA-256 digest; `get` rehydrates it transparently and `list` never touches
//! blobs. Deleting a checkpoint always deletes its blob with it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use chainrun_core::{ChainId, Checkpoint, CheckpointId, CheckpointMeta, RunId};

/// Checkpoint store errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(CheckpointId),

    #[error("Checkpoint already exists: {0}")]
    AlreadyExists(CheckpointId),

    #[error("Blob for checkpoint {0} is missing")]
    BlobMissing(CheckpointId),

    #[error("Blob for checkpoint {0} does not match its digest")]
    DigestMismatch(CheckpointId),

    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reference to externalized checkpoint content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: String,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Where a checkpoint's content lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum StoredContent {
    Inline { content: String },
    External { blob: BlobRef },
}

/// Persisted form of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub meta: CheckpointMeta,
    pub content: StoredContent,
}

impl CheckpointRecord {
    /// Build a record, splitting off the content as a blob when it exceeds
    /// `threshold` bytes. Returns the record and the blob to write, if any.
    pub fn prepare(checkpoint: Checkpoint, threshold: usize) -> (Self, Option<(String, String)>) {
        let externalize = checkpoint.content.len() > threshold;
        let meta = checkpoint.meta(externalize);
        if !externalize {
            let record = Self {
                meta,
                content: StoredContent::Inline {
                    content: checkpoint.content,
                },
            };
            return (record, None);
        }

        let blob = BlobRef {
            key: blob_key(&checkpoint.id),
            sha256: digest(&checkpoint.content),
            size_bytes: checkpoint.content.len(),
        };
        let record = Self {
            meta,
            content: StoredContent::External { blob: blob.clone() },
        };
        (record, Some((blob.key, checkpoint.content)))
    }

    /// Blob key referenced by this record, if externalized.
    pub fn blob_key(&self) -> Option<&str> {
        match &self.content {
            StoredContent::External { blob } => Some(&blob.key),
            StoredContent::Inline { .. } => None,
        }
    }

    /// Turn the record back into a checkpoint. `blob` must be the loaded
    /// blob content for externalized records.
    pub fn hydrate(self, blob: Option<String>) -> Result<Checkpoint, CheckpointError> {
        let content = match self.content {
            StoredContent::Inline { content } => content,
            StoredContent::External { blob: blob_ref } => {
                let content = blob.ok_or_else(|| CheckpointError::BlobMissing(self.meta.id.clone()))?;
                if digest(&content) != blob_ref.sha256 {
                    return Err(CheckpointError::DigestMismatch(self.meta.id));
                }
                content
            }
        };
        Ok(Checkpoint {
            id: self.meta.id,
            run_id: self.meta.run_id,
            chain_id: self.meta.chain_id,
            step_id: self.meta.step_id,
            kind: self.meta.kind,
            content,
            created_at: self.meta.created_at,
        })
    }
}

pub(crate) fn blob_key(id: &CheckpointId) -> String {
    format!("{}.blob", id)
}

fn digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Durable, append-only checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a new checkpoint and return its id. An empty id is replaced
    /// with a fresh one; an id that already exists is rejected.
    async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError>;

    /// Load a checkpoint with its content.
    async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError>;

    /// Checkpoint metadata for a run in creation order, without content.
    async fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointMeta>, CheckpointError>;

    /// Delete one checkpoint and its blob.
    async fn delete(&self, id: &CheckpointId) -> Result<(), CheckpointError>;

    /// Delete every checkpoint of a run. Returns how many were removed.
    async fn delete_by_run(&self, run_id: &RunId) -> Result<usize, CheckpointError>;

    /// Delete every checkpoint of a chain. Returns how many were removed.
    async fn delete_by_chain(&self, chain_id: &ChainId) -> Result<usize, CheckpointError>;
}

/// Metadata index shared by the store backends.
#[derive(Debug, Default)]
pub(crate) struct CheckpointIndex {
    records: HashMap<CheckpointId, CheckpointRecord>,
    by_run: HashMap<RunId, Vec<CheckpointId>>,
}

impl CheckpointIndex {
    pub(crate) fn contains(&self, id: &CheckpointId) -> bool {
        self.records.contains_key(id)
    }

    pub(crate) fn get(&self, id: &CheckpointId) -> Option<&CheckpointRecord> {
        self.records.get(id)
    }

    pub(crate) fn insert(&mut self, record: CheckpointRecord) {
        let id = record.meta.id.clone();
        self.by_run
            .entry(record.meta.run_id.clone())
            .or_default()
            .push(id.clone());
        self.records.insert(id, record);
    }

    pub(crate) fn remove(&mut self, id: &CheckpointId) -> Option<CheckpointRecord> {
        let record = self.records.remove(id)?;
        if let Some(ids) = self.by_run.get_mut(&record.meta.run_id) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_run.remove(&record.meta.run_id);
            }
        }
        Some(record)
    }

    /// Records of a run in insertion order.
    pub(crate) fn run_records(&self, run_id: &RunId) -> Vec<&CheckpointRecord> {
        self.by_run
            .get(run_id)
            .map(|ids| ids.iter().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn ids_for_run(&self, run_id: &RunId) -> Vec<CheckpointId> {
        self.by_run.get(run_id).cloned().unwrap_or_default()
    }

    pub(crate) fn ids_for_chain(&self, chain_id: &ChainId) -> Vec<CheckpointId> {
        self.records
            .values()
            .filter(|r| &r.meta.chain_id == chain_id)
            .map(|r| r.meta.id.clone())
            .collect()
    }
}

/// Normalize the id of a checkpoint about to be saved.
pub(crate) fn assign_id(mut checkpoint: Checkpoint) -> Checkpoint {
    if checkpoint.id.as_str().is_empty() {
        checkpoint.id = CheckpointId::generate();
    }
    checkpoint
}

#[derive(Default)]
struct MemoryState {
    index: CheckpointIndex,
    blobs: HashMap<String, String>,
}

impl MemoryState {
    fn remove(&mut self, id: &CheckpointId) -> Option<CheckpointRecord> {
        let record = self.index.remove(id)?;
        if let Some(key) = record.blob_key() {
            self.blobs.remove(key);
        }
        Some(record)
    }
}

/// In-memory checkpoint store. Blobs are kept in a separate map so the
/// externalization path behaves exactly like the file backend.
pub struct MemoryCheckpointStore {
    threshold: usize,
    state: RwLock<MemoryState>,
}

impl MemoryCheckpointStore {
    pub fn new(externalize_threshold_bytes: usize) -> Self {
        Self {
            threshold: externalize_threshold_bytes,
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of stored blobs.
    pub async fn blob_count(&self) -> usize {
        self.state.read().await.blobs.len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError> {
        let checkpoint = assign_id(checkpoint);
        let mut state = self.state.write().await;
        if state.index.contains(&checkpoint.id) {
            return Err(CheckpointError::AlreadyExists(checkpoint.id));
        }

        let (record, blob) = CheckpointRecord::prepare(checkpoint, self.threshold);
        if let Some((key, content)) = blob {
            state.blobs.insert(key, content);
        }
        let id = record.meta.id.clone();
        debug!(
            checkpoint_id = %id,
            run_id = %record.meta.run_id,
            kind = ?record.meta.kind,
            externalized = record.meta.externalized,
            "Checkpoint saved"
        );
        state.index.insert(record);
        Ok(id)
    }

    async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
        let state = self.state.read().await;
        let record = state
            .index
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.clone()))?;
        let blob = record.blob_key().and_then(|key| state.blobs.get(key).cloned());
        record.hydrate(blob)
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let state = self.state.read().await;
        Ok(state
            .index
            .run_records(run_id)
            .into_iter()
            .map(|r| r.meta.clone())
            .collect())
    }

    async fn delete(&self, id: &CheckpointId) -> Result<(), CheckpointError> {
        self.state
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CheckpointError::NotFound(id.clone()))
    }

    async fn delete_by_run(&self, run_id: &RunId) -> Result<usize, CheckpointError> {
        let mut state = self.state.write().await;
        let ids = state.index.ids_for_run(run_id);
        for id in &ids {
            state.remove(id);
        }
        info!(run_id = %run_id, removed = ids.len(), "Run checkpoints deleted");
        Ok(ids.len())
    }

    async fn delete_by_chain(&self, chain_id: &ChainId) -> Result<usize, CheckpointError> {
        let mut state = self.state.write().await;
        let ids = state.index.ids_for_chain(chain_id);
        for id in &ids {
            state.remove(id);
        }
        info!(chain_id = %chain_id, removed = ids.len(), "Chain checkpoints deleted");
        Ok(ids.len())
    }
}
