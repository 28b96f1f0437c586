//! Task and checkpoint storage.

pub mod checkpoints;
pub mod file;
pub mod tasks;

pub use checkpoints::{
    BlobRef, CheckpointError, CheckpointRecord, CheckpointStore, MemoryCheckpointStore,
    StoredContent,
};
pub use file::FileCheckpointStore;
pub use tasks::{TaskStore, TaskStoreError};
