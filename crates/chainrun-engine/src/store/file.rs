//! File-system checkpoint backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! runs/<run_id>.json          ordered checkpoint records of one run
//! blobs/<checkpoint_id>.blob  externalized content
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use chainrun_core::{ChainId, Checkpoint, CheckpointId, CheckpointMeta, RunId};

use super::checkpoints::{
    assign_id, CheckpointError, CheckpointIndex, CheckpointRecord, CheckpointStore,
};

const RUNS_DIR: &str = "runs";
const BLOBS_DIR: &str = "blobs";

/// Checkpoint store persisted under a directory.
pub struct FileCheckpointStore {
    root: PathBuf,
    threshold: usize,
    index: RwLock<CheckpointIndex>,
}

impl FileCheckpointStore {
    /// Open (or create) a store rooted at `root`, rebuilding the index from
    /// disk and removing blobs that no record references.
    pub async fn open(
        root: impl Into<PathBuf>,
        externalize_threshold_bytes: usize,
    ) -> Result<Self, CheckpointError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(RUNS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(BLOBS_DIR)).await?;

        let mut index = CheckpointIndex::default();
        let mut referenced = HashSet::new();
        let mut runs = 0usize;

        let mut entries = tokio::fs::read_dir(root.join(RUNS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            let records: Vec<CheckpointRecord> = serde_json::from_slice(&raw)?;
            for record in records {
                if let Some(key) = record.blob_key() {
                    referenced.insert(key.to_string());
                }
                index.insert(record);
            }
            runs += 1;
        }

        let mut swept = 0usize;
        let mut blobs = tokio::fs::read_dir(root.join(BLOBS_DIR)).await?;
        while let Some(entry) = blobs.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !referenced.contains(&name) {
                remove_if_exists(&entry.path()).await?;
                swept += 1;
            }
        }
        if swept > 0 {
            warn!(root = %root.display(), swept, "Removed unreferenced checkpoint blobs");
        }

        info!(root = %root.display(), runs, "Checkpoint store opened");
        Ok(Self {
            root,
            threshold: externalize_threshold_bytes,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join(RUNS_DIR).join(format!("{}.json", run_id))
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(key)
    }

    /// Rewrite the record file of one run from the index.
    async fn persist_run(
        &self,
        index: &CheckpointIndex,
        run_id: &RunId,
    ) -> Result<(), CheckpointError> {
        let records: Vec<&CheckpointRecord> = index.run_records(run_id);
        let path = self.run_path(run_id);
        if records.is_empty() {
            return remove_if_exists(&path).await;
        }
        let bytes = serde_json::to_vec_pretty(&records)?;
        write_atomic(&path, &bytes).await
    }

    /// Remove records from the index and disk, then their blobs.
    async fn remove_many(
        &self,
        index: &mut CheckpointIndex,
        ids: &[CheckpointId],
    ) -> Result<usize, CheckpointError> {
        let mut touched_runs = HashSet::new();
        let mut blob_keys = Vec::new();
        for id in ids {
            if let Some(record) = index.remove(id) {
                if let Some(key) = record.blob_key() {
                    blob_keys.push(key.to_string());
                }
                touched_runs.insert(record.meta.run_id);
            }
        }
        for run_id in &touched_runs {
            self.persist_run(index, run_id).await?;
        }
        for key in &blob_keys {
            remove_if_exists(&self.blob_path(key)).await?;
        }
        Ok(ids.len())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), CheckpointError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError> {
        let checkpoint = assign_id(checkpoint);
        let mut index = self.index.write().await;
        if index.contains(&checkpoint.id) {
            return Err(CheckpointError::AlreadyExists(checkpoint.id));
        }

        let (record, blob) = CheckpointRecord::prepare(checkpoint, self.threshold);
        let id = record.meta.id.clone();
        let run_id = record.meta.run_id.clone();

        if let Some((key, content)) = &blob {
            write_atomic(&self.blob_path(key), content.as_bytes()).await?;
        }

        index.insert(record);
        if let Err(e) = self.persist_run(&index, &run_id).await {
            index.remove(&id);
            if let Some((key, _)) = &blob {
                let _ = remove_if_exists(&self.blob_path(key)).await;
            }
            return Err(e);
        }
        Ok(id)
    }

    async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
        let record = self
            .index
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.clone()))?;

        let blob = match record.blob_key() {
            Some(key) => match tokio::fs::read_to_string(self.blob_path(key)).await {
                Ok(content) => Some(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        record.hydrate(blob)
    }

    async fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        Ok(self
            .index
            .read()
            .await
            .run_records(run_id)
            .into_iter()
            .map(|r| r.meta.clone())
            .collect())
    }

    async fn delete(&self, id: &CheckpointId) -> Result<(), CheckpointError> {
        let mut index = self.index.write().await;
        if !index.contains(id) {
            return Err(CheckpointError::NotFound(id.clone()));
        }
        self.remove_many(&mut index, std::slice::from_ref(id)).await?;
        Ok(())
    }

    async fn delete_by_run(&self, run_id: &RunId) -> Result<usize, CheckpointError> {
        let mut index = self.index.write().await;
        let ids = index.ids_for_run(run_id);
        let removed = self.remove_many(&mut index, &ids).await?;
        info!(run_id = %run_id, removed, "Run checkpoints deleted");
        Ok(removed)
    }

    async fn delete_by_chain(&self, chain_id: &ChainId) -> Result<usize, CheckpointError> {
        let mut index = self.index.write().await;
        let ids = index.ids_for_chain(chain_id);
        let removed = self.remove_many(&mut index, &ids).await?;
        info!(chain_id = %chain_id, removed, "Chain checkpoints deleted");
        Ok(removed)
    }
}
