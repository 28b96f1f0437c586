//! Run registry owned by the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use chainrun_core::{CoreError, RunId, RunMetadata, RunStatus};

/// State of one run: metadata, final output, cancellation handle.
pub struct RunHandle {
    id: RunId,
    meta: RwLock<RunMetadata>,
    output: RwLock<Option<String>>,
    cancel: CancellationToken,
    status: watch::Sender<RunStatus>,
    /// Tokio tasks that wrote metadata through `update` or `lock`.
    #[cfg(test)]
    writers: std::sync::Mutex<std::collections::HashSet<tokio::task::Id>>,
}

impl RunHandle {
    pub fn new(meta: RunMetadata) -> Self {
        let (status, _) = watch::channel(meta.status);
        Self {
            id: meta.id.clone(),
            meta: RwLock::new(meta),
            output: RwLock::new(None),
            cancel: CancellationToken::new(),
            status,
            #[cfg(test)]
            writers: Default::default(),
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Copy of the current metadata.
    pub async fn snapshot(&self) -> RunMetadata {
        self.meta.read().await.clone()
    }

    pub async fn status(&self) -> RunStatus {
        self.meta.read().await.status
    }

    /// Apply `f` while the run is still active. Returns `None` once terminal.
    pub async fn update<T>(&self, f: impl FnOnce(&mut RunMetadata) -> T) -> Option<T> {
        #[cfg(test)]
        self.record_writer();
        let mut meta = self.meta.write().await;
        if meta.status.is_terminal() {
            return None;
        }
        Some(f(&mut meta))
    }

    /// Apply a status transition and notify waiters.
    pub async fn transition(
        &self,
        f: impl FnOnce(&mut RunMetadata) -> Result<(), CoreError>,
    ) -> Result<RunStatus, CoreError> {
        let mut meta = self.meta.write().await;
        f(&mut meta)?;
        let status = meta.status;
        self.status.send_replace(status);
        Ok(status)
    }

    /// Exclusive access for writes that must not interleave with a status flip.
    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, RunMetadata> {
        #[cfg(test)]
        self.record_writer();
        self.meta.write().await
    }

    #[cfg(test)]
    fn record_writer(&self) {
        if let Some(id) = tokio::task::try_id() {
            self.writers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id);
        }
    }

    /// Number of distinct tokio tasks that wrote metadata.
    #[cfg(test)]
    pub(crate) fn writer_tasks(&self) -> usize {
        self.writers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn set_output(&self, output: String) {
        *self.output.write().await = Some(output);
    }

    pub async fn output(&self) -> Option<String> {
        self.output.read().await.clone()
    }

    /// Resolve once the run reaches a terminal status.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status.subscribe();
        let reached = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => Some(*status),
            Err(_) => None,
        };
        match reached {
            Some(status) => status,
            None => self.status().await,
        }
    }
}

/// Runs indexed by id.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: Arc<RunHandle>) {
        self.runs.write().await.insert(handle.id().clone(), handle);
    }

    pub async fn get(&self, id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs.write().await.remove(id)
    }

    /// Metadata snapshots of every run, oldest start first.
    pub async fn list(&self) -> Vec<RunMetadata> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(handle.snapshot().await);
        }
        runs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        runs
    }

    /// Run counts per status.
    pub async fn counts_by_status(&self) -> HashMap<RunStatus, usize> {
        let handles: Vec<Arc<RunHandle>> = self.runs.read().await.values().cloned().collect();
        let mut counts = HashMap::new();
        for handle in handles {
            *counts.entry(handle.status().await).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
