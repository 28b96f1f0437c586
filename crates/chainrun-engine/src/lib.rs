//! ChainRun Engine Library
//!
//! Runs chains of model-invocation steps: the run coordinator, the task
//! scheduler with retry and timeouts, the bounded segment fan-out, and the
//! task and checkpoint stores behind them.

pub mod chains;
pub mod config;
pub mod coordinator;
pub mod fanout;
pub mod invoker;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod store;

pub use chains::{ChainLoadError, ChainRegistry, ChainSource};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{CoordinatorError, ErrorKind, RunCoordinator};
pub use fanout::{fan_out, FanOutError};
pub use invoker::{CommandInvoker, InvokeError, ModelInvoker};
pub use retry::RetryPolicy;
pub use scheduler::{BatchReport, SchedulerConfig, SchedulerError, TaskScheduler};
pub use state::{RunHandle, RunRegistry};
pub use store::{
    CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, TaskStore,
    TaskStoreError,
};
