//! Run metadata and input payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChainId, CheckpointId, CoreError, ProcessingOptions, RunId, RunStatus, StepId};

/// A named file attached to a run's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub content: String,
}

/// Input payload of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub files: Vec<InputFile>,
}

impl RunInput {
    /// Plain text input without files.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }

    /// Builder method to attach a file.
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(InputFile {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    /// True if there is neither text nor any file.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.files.is_empty()
    }

    /// Flatten text and files into the text fed to the first step.
    pub fn into_text(self) -> Result<String, CoreError> {
        if self.is_empty() {
            return Err(CoreError::InvalidInput(
                "input text is empty and no files were provided".to_string(),
            ));
        }
        let mut out = self.text;
        for file in self.files {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("--- {} ---\n{}", file.name, file.content));
        }
        Ok(out)
    }
}

/// Observable state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub id: RunId,
    pub chain_id: ChainId,
    pub status: RunStatus,

    /// Fraction of work done, in `[0, 1]`. Never decreases while active.
    pub progress: f64,

    /// Zero-based index of the step being executed.
    pub current_step: Option<usize>,
    pub current_step_id: Option<StepId>,
    pub total_steps: usize,

    /// Estimated tokens sent to and received from the invoker.
    pub total_tokens: usize,

    /// Checkpoints written for this run, in creation order.
    pub checkpoints: Vec<CheckpointId>,

    pub error: Option<String>,
    pub options: ProcessingOptions,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetadata {
    /// Create pending metadata for a new run.
    pub fn new(chain_id: ChainId, total_steps: usize, options: ProcessingOptions) -> Self {
        Self {
            id: RunId::generate(),
            chain_id,
            status: RunStatus::Pending,
            progress: 0.0,
            current_step: None,
            current_step_id: None,
            total_steps,
            total_tokens: 0,
            checkpoints: Vec::new(),
            error: None,
            options,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the run as started.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Switch between `running` and `processing`.
    pub fn set_processing(&mut self, processing: bool) -> Result<(), CoreError> {
        let next = if processing {
            RunStatus::Processing
        } else {
            RunStatus::Running
        };
        if self.status == next {
            return Ok(());
        }
        self.transition(next)
    }

    /// Raise progress; lower values are ignored.
    pub fn advance_progress(&mut self, progress: f64) {
        let clamped = progress.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    /// Mark the run as completed.
    pub fn complete(&mut self) -> Result<(), CoreError> {
        self.transition(RunStatus::Completed)?;
        self.progress = 1.0;
        self.current_step = None;
        self.current_step_id = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the run as failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the run as cancelled.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        self.transition(RunStatus::Cancelled)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}
