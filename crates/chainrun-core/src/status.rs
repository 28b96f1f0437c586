//! Status enums for Runs and Tasks.

use serde::{Deserialize, Serialize};

/// Status of a Run of a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run requested but not yet started.
    #[default]
    Pending,
    /// Coordinator is working through chain steps.
    Running,
    /// A segmented step is fanning out across chunks.
    Processing,
    /// All steps finished and the final output is available.
    Completed,
    /// A step failed.
    Failed,
    /// Run was cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if the run may be cancelled from this state.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Running | Self::Processing)
    }

    /// Whether `self -> next` is a legal run transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Failed) => true,
            (Running, Processing) | (Processing, Running) => true,
            (Running | Processing, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Status of a Task in the task store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Every dependency has completed.
    Ready,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error after exhausting retries.
    Failed,
    /// Manually paused.
    Paused,
    /// Cancelled by user or system.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal task transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready) => true,
            (Ready, Running) => true,
            // A failed attempt that will be retried goes back to ready.
            (Running, Ready) => true,
            (Running, Completed | Failed | Cancelled) => true,
            (Pending | Ready, Paused) => true,
            (Paused, Pending | Ready) => true,
            (Pending | Ready | Paused, Cancelled) => true,
            _ => false,
        }
    }
}
