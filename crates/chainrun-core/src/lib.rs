//! ChainRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Storage
//! - Model providers
//!
//! Segmentation lives here too: splitting and merging text is pure and
//! deterministic, so it needs nothing beyond the standard library.

pub mod chain;
pub mod checkpoint;
pub mod error;
pub mod ids;
pub mod options;
pub mod run;
pub mod segment;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use chain::{Chain, ChainStep, GenerationParams, INPUT_PLACEHOLDER};
pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointMeta};
pub use error::CoreError;
pub use ids::{ChainId, CheckpointId, RunId, StepId, TaskId};
pub use options::{ProcessingOptions, SegmentationMethod};
pub use run::{InputFile, RunInput, RunMetadata};
pub use segment::{estimate_tokens, merge, Segment, SegmentError, Segmenter};
pub use status::{RunStatus, TaskStatus};
pub use task::{Task, TaskInput, TaskKind, TaskMetrics, TaskOutput};
