//! Read-only chain lookup.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use chainrun_core::{Chain, ChainId};

/// Errors raised while loading chain definitions.
#[derive(Debug, Error)]
pub enum ChainLoadError {
    #[error("Failed to read chain definitions from '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid chain definition in '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Chain '{0}' has no steps")]
    EmptyChain(ChainId),
}

/// Source of chain definitions. The engine only reads from it.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_chain(&self, id: &ChainId) -> Option<Chain>;
}

/// In-memory chain registry.
#[derive(Default)]
pub struct ChainRegistry {
    chains: RwLock<HashMap<ChainId, Chain>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain, replacing any previous definition with the same id.
    pub async fn insert(&self, chain: Chain) -> Result<(), ChainLoadError> {
        if chain.is_empty() {
            return Err(ChainLoadError::EmptyChain(chain.id));
        }
        self.chains.write().await.insert(chain.id.clone(), chain);
        Ok(())
    }

    /// Load every `*.json` chain definition in `dir`.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, ChainLoadError> {
        let dir = dir.as_ref();
        let io_err = |source| ChainLoadError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| ChainLoadError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            let chain: Chain = serde_json::from_str(&raw).map_err(|source| ChainLoadError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            info!(chain_id = %chain.id, steps = chain.len(), path = %path.display(), "Loaded chain");
            self.insert(chain).await?;
            loaded += 1;
        }

        if loaded == 0 {
            warn!(dir = %dir.display(), "No chain definitions found");
        }
        Ok(loaded)
    }

    pub async fn len(&self) -> usize {
        self.chains.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chains.read().await.is_empty()
    }
}

#[async_trait]
impl ChainSource for ChainRegistry {
    async fn get_chain(&self, id: &ChainId) -> Option<Chain> {
        self.chains.read().await.get(id).cloned()
    }
}
