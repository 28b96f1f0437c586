//! Checkpoints: append-only snapshots of a run's artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChainId, CheckpointId, RunId, StepId};

/// What a checkpoint captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Input,
    Output,
    /// Output of one chain step.
    Intermediate,
    /// Failure record naming the failing step.
    Error,
    Segment,
    /// Final output of a whole run.
    Complete,
}

/// A checkpoint with its content hydrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Assigned on creation when absent from a serialized checkpoint.
    #[serde(default = "CheckpointId::generate")]
    pub id: CheckpointId,
    pub run_id: RunId,
    pub chain_id: ChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub kind: CheckpointKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id.
    pub fn new(
        run_id: RunId,
        chain_id: ChainId,
        kind: CheckpointKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: CheckpointId::generate(),
            run_id,
            chain_id,
            step_id: None,
            kind,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Builder method to attach the producing step.
    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Metadata view without content.
    pub fn meta(&self, externalized: bool) -> CheckpointMeta {
        CheckpointMeta {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            chain_id: self.chain_id.clone(),
            step_id: self.step_id.clone(),
            kind: self.kind,
            size_bytes: self.content.len(),
            externalized,
            created_at: self.created_at,
        }
    }
}

/// Lightweight checkpoint listing entry; content is not loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub chain_id: ChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub kind: CheckpointKind,
    /// Content length in bytes.
    pub size_bytes: usize,
    /// True when the content lives in an external blob.
    pub externalized: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_id_is_generated() {
        let json = r#"{
            "run_id": "r1",
            "chain_id": "c1",
            "kind": "intermediate",
            "content": "hello",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();
        assert!(!checkpoint.id.as_str().is_empty());
        assert_eq!(checkpoint.kind, CheckpointKind::Intermediate);
        assert!(checkpoint.step_id.is_none());
    }

    #[test]
    fn test_meta_reports_size() {
        let checkpoint = Checkpoint::new(
            RunId::new("r"),
            ChainId::new("c"),
            CheckpointKind::Complete,
            "12345",
        )
        .with_step(StepId::new("s"));
        let meta = checkpoint.meta(false);
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.step_id, Some(StepId::new("s")));
    }
}
