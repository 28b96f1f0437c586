//! Tasks: atomic schedulable units of work.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChainId, ChainStep, RunId, SegmentationMethod, TaskId, TaskStatus};

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ModelExecution,
    Segmentation,
    Integration,
    Preprocessing,
}

/// Typed input descriptor, one variant per task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskInput {
    /// Run one prompt through the invoker.
    ModelExecution {
        step: ChainStep,
        /// Text the step's template is rendered with.
        text: String,
        /// Segment order when this call covers one chunk of a larger input.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment: Option<usize>,
    },
    /// Split `text` and spawn one model-execution child per segment.
    Segmentation {
        step: ChainStep,
        text: String,
        chunk_size_tokens: usize,
        method: SegmentationMethod,
    },
    /// Concatenate dependency outputs in dependency order.
    Integration { separator: String },
    /// Reserved.
    Preprocessing { text: String },
}

impl TaskInput {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::ModelExecution { .. } => TaskKind::ModelExecution,
            Self::Segmentation { .. } => TaskKind::Segmentation,
            Self::Integration { .. } => TaskKind::Integration,
            Self::Preprocessing { .. } => TaskKind::Preprocessing,
        }
    }

    /// Text payload, if this input carries one.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::ModelExecution { text, .. }
            | Self::Segmentation { text, .. }
            | Self::Preprocessing { text } => Some(text),
            Self::Integration { .. } => None,
        }
    }

    /// Drop the text payload, keeping every other field.
    pub fn clear_text(&mut self) {
        match self {
            Self::ModelExecution { text, .. }
            | Self::Segmentation { text, .. }
            | Self::Preprocessing { text } => *text = String::new(),
            Self::Integration { .. } => {}
        }
    }
}

/// Typed output descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutput {
    /// Text produced by a model call or an integration.
    Text { text: String },
    /// Children created by a segmentation task, indexed by segment order.
    Segments { children: Vec<TaskId> },
}

impl TaskOutput {
    /// Text payload, if this output carries one.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Segments { .. } => None,
        }
    }

    /// Drop the text payload. Segment lists are kept.
    pub fn clear_text(&mut self) {
        if let Self::Text { text } = self {
            *text = String::new();
        }
    }
}

/// Execution metrics recorded on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    pub cost: f64,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// A unit of work owned by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,

    /// Tasks that must complete before this one becomes ready.
    pub dependencies: BTreeSet<TaskId>,

    /// Ordered view of `dependencies`, used when outputs are concatenated.
    pub dependency_order: Vec<TaskId>,

    pub input: TaskInput,
    pub output: Option<TaskOutput>,
    pub metrics: TaskMetrics,
    pub error: Option<String>,

    pub run_id: RunId,
    pub chain_id: ChainId,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for the given run.
    pub fn new(run_id: RunId, chain_id: ChainId, input: TaskInput) -> Self {
        Self {
            id: TaskId::generate(),
            kind: input.kind(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            dependency_order: Vec::new(),
            input,
            output: None,
            metrics: TaskMetrics::default(),
            error: None,
            run_id,
            chain_id,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Builder method to add a dependency. Order of calls is preserved.
    pub fn with_dependency(mut self, id: TaskId) -> Self {
        if self.dependencies.insert(id.clone()) {
            self.dependency_order.push(id);
        }
        self
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
