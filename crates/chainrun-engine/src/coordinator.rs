//! Run coordinator - drives chains step by step.
//!
//! Each run gets its own coordinating tokio task. Steps execute strictly in
//! order; a step whose input exceeds `max_tokens_per_chunk` is segmented,
//! fanned out across at most `max_parallel_chunks` concurrent model calls and
//! merged back in segment order. Only the coordinating task writes run
//! metadata; segment tasks report their metrics back over a channel. It checks
//! the run status before every write, so a concurrent `cancel_run` always wins.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chainrun_core::{
    Chain, ChainId, ChainStep, Checkpoint, CheckpointId, CheckpointKind, CheckpointMeta,
    CoreError, ProcessingOptions, RunId, RunInput, RunMetadata, RunStatus, Task, TaskId,
    TaskInput, TaskMetrics, TaskOutput, TaskStatus,
};

use crate::chains::ChainSource;
use crate::config::EngineConfig;
use crate::fanout::{fan_out, FanOutError};
use crate::invoker::ModelInvoker;
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerConfig, SchedulerError, TaskScheduler};
use crate::state::{RunHandle, RunRegistry};
use crate::store::{
    CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, TaskStore,
    TaskStoreError,
};

/// Coarse error classification for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Execution,
    Cancellation,
    NotFound,
}

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Chain not found: {0}")]
    ChainNotFound(ChainId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {id} is not running (status: {status:?})")]
    NotRunning { id: RunId, status: RunStatus },

    #[error("Run {id} is not completed (status: {status:?})")]
    NotCompleted { id: RunId, status: RunStatus },

    #[error("Run {id} is still active (status: {status:?})")]
    StillActive { id: RunId, status: RunStatus },

    #[error("segment {segment} of {total} failed: {source}")]
    SegmentFailed {
        segment: usize,
        total: usize,
        #[source]
        source: SchedulerError,
    },

    #[error("Run {0} was cancelled")]
    Cancelled(RunId),

    #[error("Unexpected task output: {0}")]
    UnexpectedOutput(TaskId),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for CoordinatorError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            CoreError::InvalidOptions(msg) => Self::InvalidOptions(msg),
            other => Self::Core(other),
        }
    }
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ChainNotFound(_) | Self::RunNotFound(_) => ErrorKind::NotFound,
            Self::Checkpoint(CheckpointError::NotFound(_)) => ErrorKind::NotFound,
            Self::InvalidInput(_)
            | Self::InvalidOptions(_)
            | Self::NotRunning { .. }
            | Self::NotCompleted { .. }
            | Self::StillActive { .. } => ErrorKind::Validation,
            Self::Cancelled(_) | Self::Scheduler(SchedulerError::Cancelled(_)) => {
                ErrorKind::Cancellation
            }
            Self::SegmentFailed {
                source: SchedulerError::Cancelled(_),
                ..
            } => ErrorKind::Cancellation,
            _ => ErrorKind::Execution,
        }
    }
}

/// Owns the run registry and drives runs.
pub struct RunCoordinator {
    chains: Arc<dyn ChainSource>,
    scheduler: Arc<TaskScheduler>,
    checkpoints: Arc<dyn CheckpointStore>,
    runs: RunRegistry,
    segment_separator: String,
}

impl RunCoordinator {
    /// Create a new RunCoordinator.
    pub fn new(
        chains: Arc<dyn ChainSource>,
        invoker: Arc<dyn ModelInvoker>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &EngineConfig,
    ) -> Self {
        let tasks = Arc::new(TaskStore::new());
        let scheduler = Arc::new(TaskScheduler::new(
            tasks,
            invoker,
            SchedulerConfig::from(config),
        ));
        Self {
            chains,
            scheduler,
            checkpoints,
            runs: RunRegistry::new(),
            segment_separator: config.segment_separator.clone(),
        }
    }

    /// Create a coordinator with the checkpoint backend named by `config`:
    /// a file store under `checkpoint_dir`, or memory when unset.
    pub async fn from_config(
        chains: Arc<dyn ChainSource>,
        invoker: Arc<dyn ModelInvoker>,
        config: &EngineConfig,
    ) -> Result<Self, CoordinatorError> {
        let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(
                FileCheckpointStore::open(dir, config.externalize_threshold_bytes).await?,
            ),
            None => Arc::new(MemoryCheckpointStore::new(
                config.externalize_threshold_bytes,
            )),
        };
        Ok(Self::new(chains, invoker, checkpoints, config))
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    async fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>, CoordinatorError> {
        self.runs
            .get(run_id)
            .await
            .ok_or_else(|| CoordinatorError::RunNotFound(run_id.clone()))
    }

    /// Start a run of `chain_id` over `input`. Returns as soon as the run is
    /// registered; the steps execute on a spawned task.
    pub async fn run_chain(
        &self,
        chain_id: &ChainId,
        input: RunInput,
        options: ProcessingOptions,
    ) -> Result<RunId, CoordinatorError> {
        let chain = self
            .chains
            .get_chain(chain_id)
            .await
            .ok_or_else(|| CoordinatorError::ChainNotFound(chain_id.clone()))?;
        options.validate()?;
        let text = input.into_text()?;
        let policy = RetryPolicy::from_options(&options);

        let mut meta = RunMetadata::new(chain.id.clone(), chain.len(), options);
        meta.start()?;
        let handle = Arc::new(RunHandle::new(meta));
        let run_id = handle.id().clone();
        self.runs.insert(handle.clone()).await;

        info!(
            run_id = %run_id,
            chain_id = %chain.id,
            steps = chain.len(),
            input_bytes = text.len(),
            "Run started"
        );

        let driver = RunDriver {
            policy,
            handle,
            chain,
            scheduler: self.scheduler.clone(),
            checkpoints: self.checkpoints.clone(),
            separator: self.segment_separator.clone(),
        };
        tokio::spawn(async move { driver.run(text).await });

        Ok(run_id)
    }

    /// Current metadata of a run.
    pub async fn get_run_status(&self, run_id: &RunId) -> Result<RunMetadata, CoordinatorError> {
        Ok(self.handle(run_id).await?.snapshot().await)
    }

    /// Metadata of every known run.
    pub async fn list_runs(&self) -> Vec<RunMetadata> {
        self.runs.list().await
    }

    /// Cancel a running run. In-flight and ready tasks are cancelled best effort.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<(), CoordinatorError> {
        let handle = self.handle(run_id).await?;
        let flipped = handle
            .transition(|meta| {
                if !meta.status.is_cancellable() {
                    return Err(CoreError::InvalidStateTransition {
                        from: format!("{:?}", meta.status),
                        to: format!("{:?}", RunStatus::Cancelled),
                    });
                }
                meta.cancel()
            })
            .await;
        if flipped.is_err() {
            return Err(CoordinatorError::NotRunning {
                id: run_id.clone(),
                status: handle.status().await,
            });
        }
        handle.cancel_token().cancel();

        let mut cancelled = 0usize;
        for task in self.scheduler.tasks().list_by_run(run_id).await {
            if !matches!(task.status, TaskStatus::Running | TaskStatus::Ready) {
                continue;
            }
            match self.scheduler.cancel_task(&task.id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(run_id = %run_id, task_id = %task.id, error = %e, "Failed to cancel task")
                }
            }
        }
        info!(run_id = %run_id, tasks_cancelled = cancelled, "Run cancelled");
        Ok(())
    }

    /// Final output of a completed run.
    pub async fn get_run_results(&self, run_id: &RunId) -> Result<String, CoordinatorError> {
        let handle = self.handle(run_id).await?;
        let status = handle.status().await;
        if status != RunStatus::Completed {
            return Err(CoordinatorError::NotCompleted {
                id: run_id.clone(),
                status,
            });
        }
        handle
            .output()
            .await
            .ok_or_else(|| CoordinatorError::NotCompleted {
                id: run_id.clone(),
                status,
            })
    }

    pub async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, CoordinatorError> {
        Ok(self.checkpoints.get(id).await?)
    }

    /// Checkpoint metadata of a run, in creation order.
    pub async fn list_checkpoints(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<CheckpointMeta>, CoordinatorError> {
        Ok(self.checkpoints.list(run_id).await?)
    }

    /// Remove a finished run with its tasks and checkpoints.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<(), CoordinatorError> {
        let handle = self.handle(run_id).await?;
        let status = handle.status().await;
        if !status.is_terminal() {
            return Err(CoordinatorError::StillActive {
                id: run_id.clone(),
                status,
            });
        }
        self.runs.remove(run_id).await;
        let tasks = self.scheduler.tasks().delete_run(run_id).await;
        let checkpoints = self.checkpoints.delete_by_run(run_id).await?;
        info!(run_id = %run_id, tasks, checkpoints, "Run deleted");
        Ok(())
    }

    /// Wait until a run reaches a terminal status and return its metadata.
    pub async fn wait_for_run(&self, run_id: &RunId) -> Result<RunMetadata, CoordinatorError> {
        let handle = self.handle(run_id).await?;
        handle.wait().await;
        Ok(handle.snapshot().await)
    }
}

/// Everything one run's coordinating task needs.
struct RunDriver {
    handle: Arc<RunHandle>,
    chain: Chain,
    scheduler: Arc<TaskScheduler>,
    checkpoints: Arc<dyn CheckpointStore>,
    separator: String,
    policy: RetryPolicy,
}

impl RunDriver {
    async fn run(self, text: String) {
        let run_id = self.handle.id().clone();
        match self.execute_steps(text).await {
            Ok(output) => {
                if let Err(e) = self.finish(output).await {
                    error!(run_id = %run_id, error = %e, "Failed to finalize run");
                    let index = self.chain.steps.len().saturating_sub(1);
                    let step = self.chain.steps.get(index);
                    let cause = format!("finalizing run: {e}");
                    let message = match step {
                        Some(step) => step_failure(index, step, cause),
                        None => cause,
                    };
                    self.fail(step, message).await;
                }
            }
            Err(_) if self.handle.cancel_token().is_cancelled() => {
                self.cancel_leftover_tasks().await;
                self.release_task_payloads().await;
                debug!(run_id = %run_id, "Run stopped after cancellation");
            }
            Err((index, e)) => {
                let step = &self.chain.steps[index];
                self.fail(Some(step), step_failure(index, step, e)).await;
            }
        }
    }

    async fn execute_steps(&self, text: String) -> Result<String, (usize, CoordinatorError)> {
        let total = self.chain.steps.len();
        let options = self.handle.snapshot().await.options;
        let mut current = text;

        for (index, step) in self.chain.steps.iter().enumerate() {
            if self.handle.cancel_token().is_cancelled() {
                return Err((index, CoordinatorError::Cancelled(self.handle.id().clone())));
            }
            let started = self
                .handle
                .update(|meta| {
                    meta.current_step = Some(index);
                    meta.current_step_id = Some(step.id.clone());
                })
                .await;
            if started.is_none() {
                return Err((index, CoordinatorError::Cancelled(self.handle.id().clone())));
            }

            let tokens = self.scheduler.estimate_tokens(&current);
            let segmented = tokens > options.max_tokens_per_chunk;
            debug!(
                run_id = %self.handle.id(),
                step = index + 1,
                step_id = %step.id,
                tokens,
                segmented,
                "Executing step"
            );

            let output = if segmented {
                self.segmented_step(index, step, current, &options).await
            } else {
                self.direct_step(step, current).await
            }
            .map_err(|e| (index, e))?;

            self.handle
                .update(|meta| meta.advance_progress((index + 1) as f64 / total as f64))
                .await;
            if options.save_checkpoints {
                self.checkpoint(CheckpointKind::Intermediate, Some(step), &output)
                    .await
                    .map_err(|e| (index, e))?;
            }
            current = output;
        }
        Ok(current)
    }

    fn new_task(&self, input: TaskInput) -> Task {
        Task::new(self.handle.id().clone(), self.chain.id.clone(), input)
    }

    async fn add_tokens(&self, task_id: &TaskId) -> Result<(), CoordinatorError> {
        let metrics = self.scheduler.tasks().get(task_id).await?.metrics;
        self.handle
            .update(|meta| meta.total_tokens += metrics.input_tokens + metrics.output_tokens)
            .await;
        Ok(())
    }

    async fn direct_step(&self, step: &ChainStep, text: String) -> Result<String, CoordinatorError> {
        let task = self.new_task(TaskInput::ModelExecution {
            step: step.clone(),
            text,
            segment: None,
        });
        let id = self.scheduler.tasks().insert(task).await?;
        let output = self
            .scheduler
            .execute_task_with(self.handle.cancel_token(), &id, &self.policy)
            .await?;
        self.add_tokens(&id).await?;
        text_of(&id, output)
    }

    async fn segmented_step(
        &self,
        index: usize,
        step: &ChainStep,
        text: String,
        options: &ProcessingOptions,
    ) -> Result<String, CoordinatorError> {
        let run_id = self.handle.id().clone();
        let cancel = self.handle.cancel_token();
        let entered = self
            .handle
            .update(|meta| meta.set_processing(true))
            .await
            .ok_or_else(|| CoordinatorError::Cancelled(run_id.clone()))?;
        entered?;

        let split = self.new_task(TaskInput::Segmentation {
            step: step.clone(),
            text,
            chunk_size_tokens: options.max_tokens_per_chunk,
            method: options.segmentation_method,
        });
        let split_id = self.scheduler.tasks().insert(split).await?;
        let children = match self
            .scheduler
            .execute_task_with(cancel, &split_id, &self.policy)
            .await?
        {
            TaskOutput::Segments { children } => children,
            TaskOutput::Text { .. } => return Err(CoordinatorError::UnexpectedOutput(split_id)),
        };

        let count = children.len();
        info!(run_id = %run_id, step = index + 1, segments = count, "Step segmented");

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskMetrics>();
        let fanned = fan_out(
            children.clone(),
            options.max_parallel_chunks,
            cancel,
            |_, child, token| {
                let scheduler = self.scheduler.clone();
                let policy = self.policy.clone();
                let done = done_tx.clone();
                async move {
                    let output = scheduler.execute_task_with(&token, &child, &policy).await?;
                    let metrics = scheduler.tasks().get(&child).await?.metrics;
                    // The receiver outlives the fan-out.
                    let _ = done.send(metrics);
                    Ok::<_, SchedulerError>(output)
                }
            },
        );
        tokio::pin!(fanned);

        let mut finished = 0;
        let results = loop {
            tokio::select! {
                results = &mut fanned => break results,
                Some(metrics) = done_rx.recv() => {
                    finished += 1;
                    self.record_segment(index, finished, count, &metrics).await;
                }
            }
        };
        while let Ok(metrics) = done_rx.try_recv() {
            finished += 1;
            self.record_segment(index, finished, count, &metrics).await;
        }

        if let Err(e) = results {
            return Err(match e {
                FanOutError::Failed {
                    index,
                    total,
                    error,
                } => CoordinatorError::SegmentFailed {
                    segment: index + 1,
                    total,
                    source: error,
                },
                FanOutError::Cancelled => CoordinatorError::Cancelled(run_id),
                FanOutError::Aborted(message) => CoordinatorError::Scheduler(
                    SchedulerError::Execution {
                        id: split_id,
                        message,
                    },
                ),
            });
        }

        let mut integration = self.new_task(TaskInput::Integration {
            separator: self.separator.clone(),
        });
        for child in &children {
            integration = integration.with_dependency(child.clone());
        }
        let join_id = self.scheduler.tasks().insert(integration).await?;
        let output = self
            .scheduler
            .execute_task_with(cancel, &join_id, &RetryPolicy::none())
            .await?;

        let left = self
            .handle
            .update(|meta| meta.set_processing(false))
            .await
            .ok_or_else(|| CoordinatorError::Cancelled(run_id.clone()))?;
        left?;
        debug!(run_id = %run_id, step = index + 1, segments = count, "Segments merged");
        text_of(&join_id, output)
    }

    /// Tokens and progress of one finished segment.
    async fn record_segment(
        &self,
        index: usize,
        finished: usize,
        count: usize,
        metrics: &TaskMetrics,
    ) {
        let total_steps = self.chain.steps.len() as f64;
        let progress = (index as f64 + finished as f64 / (count + 1) as f64) / total_steps;
        self.handle
            .update(|meta| {
                meta.total_tokens += metrics.input_tokens + metrics.output_tokens;
                meta.advance_progress(progress);
            })
            .await;
    }

    /// Append a checkpoint unless the run already ended. The write happens
    /// outside the metadata lock; a checkpoint that loses a race with a
    /// terminal transition is deleted again.
    async fn checkpoint(
        &self,
        kind: CheckpointKind,
        step: Option<&ChainStep>,
        content: &str,
    ) -> Result<(), CoordinatorError> {
        if self.handle.status().await.is_terminal() {
            return Ok(());
        }
        let mut checkpoint = Checkpoint::new(
            self.handle.id().clone(),
            self.chain.id.clone(),
            kind,
            content,
        );
        if let Some(step) = step {
            checkpoint = checkpoint.with_step(step.id.clone());
        }
        let id = self.checkpoints.save(checkpoint).await?;

        let mut meta = self.handle.lock().await;
        if meta.status.is_terminal() {
            drop(meta);
            debug!(
                run_id = %self.handle.id(),
                checkpoint_id = %id,
                "Run ended, dropping checkpoint"
            );
            self.checkpoints.delete(&id).await?;
            return Ok(());
        }
        debug!(run_id = %meta.id, checkpoint_id = %id, kind = ?kind, "Checkpoint written");
        meta.checkpoints.push(id);
        Ok(())
    }

    async fn finish(&self, output: String) -> Result<(), CoordinatorError> {
        let run_id = self.handle.id();
        let options = self.handle.snapshot().await.options;
        if options.save_checkpoints {
            self.checkpoint(CheckpointKind::Complete, None, &output).await?;
        }
        self.handle.set_output(output).await;
        self.release_task_payloads().await;

        if self.handle.status().await.is_terminal() {
            return Ok(());
        }
        match self.handle.transition(|meta| meta.complete()).await {
            Ok(_) => {
                let meta = self.handle.snapshot().await;
                info!(
                    run_id = %run_id,
                    checkpoints = meta.checkpoints.len(),
                    total_tokens = meta.total_tokens,
                    "Run completed"
                );
            }
            // Lost a race with cancel_run.
            Err(e) => debug!(run_id = %run_id, error = %e, "Run not completed"),
        }
        Ok(())
    }

    async fn fail(&self, step: Option<&ChainStep>, message: String) {
        let run_id = self.handle.id();
        let options = self.handle.snapshot().await.options;
        if options.save_checkpoints {
            if let Err(e) = self.checkpoint(CheckpointKind::Error, step, &message).await {
                warn!(run_id = %run_id, error = %e, "Failed to write error checkpoint");
            }
        }
        self.cancel_leftover_tasks().await;
        self.release_task_payloads().await;

        let failed = self
            .handle
            .transition(|meta| {
                if meta.status.is_terminal() {
                    return Ok(());
                }
                meta.fail(message.clone())
            })
            .await;
        match failed {
            Ok(RunStatus::Failed) => error!(run_id = %run_id, error = %message, "Run failed"),
            Ok(_) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to mark run failed"),
        }
    }

    /// Cancel tasks of this run that never reached a terminal status.
    async fn cancel_leftover_tasks(&self) {
        for task in self.scheduler.tasks().list_by_run(self.handle.id()).await {
            if task.is_terminal() {
                continue;
            }
            if let Err(e) = self.scheduler.cancel_task(&task.id).await {
                warn!(task_id = %task.id, error = %e, "Failed to cancel leftover task");
            }
        }
    }

    /// Drop task payloads once the run no longer needs them. The final output
    /// lives on the run handle and in checkpoints.
    async fn release_task_payloads(&self) {
        self.scheduler.tasks().release_payloads(self.handle.id()).await;
    }
}

fn step_failure(index: usize, step: &ChainStep, cause: impl fmt::Display) -> String {
    format!("step {} ({}) failed: {}", index + 1, step.name, cause)
}

fn text_of(id: &TaskId, output: TaskOutput) -> Result<String, CoordinatorError> {
    match output {
        TaskOutput::Text { text } => Ok(text),
        TaskOutput::Segments { .. } => Err(CoordinatorError::UnexpectedOutput(id.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use chainrun_core::{Segmenter, SegmentationMethod, TaskKind};

    use crate::chains::ChainRegistry;
    use crate::testing::TestInvoker;

    fn step(id: &str) -> ChainStep {
        ChainStep::new(id, "test", "{{input}}")
    }

    fn options() -> ProcessingOptions {
        ProcessingOptions {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    async fn coordinator(invoker: TestInvoker, chains: Vec<Chain>) -> RunCoordinator {
        with_checkpoints(
            invoker,
            chains,
            Arc::new(MemoryCheckpointStore::new(64 * 1024)),
        )
        .await
    }

    async fn with_checkpoints(
        invoker: TestInvoker,
        chains: Vec<Chain>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> RunCoordinator {
        let registry = Arc::new(ChainRegistry::new());
        for chain in chains {
            registry.insert(chain).await.unwrap();
        }
        RunCoordinator::new(
            registry,
            Arc::new(invoker),
            checkpoints,
            &EngineConfig::default(),
        )
    }

    /// Memory store that can reject one checkpoint kind and hold the first
    /// save until released.
    struct ScriptedCheckpoints {
        inner: MemoryCheckpointStore,
        reject: Option<CheckpointKind>,
        gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    }

    impl ScriptedCheckpoints {
        fn new() -> Self {
            Self {
                inner: MemoryCheckpointStore::new(64 * 1024),
                reject: None,
                gate: Mutex::new(None),
            }
        }

        fn rejecting(mut self, kind: CheckpointKind) -> Self {
            self.reject = Some(kind);
            self
        }

        /// Returns (entered, release).
        fn gated(self) -> (Self, Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
            (self, entered, release)
        }
    }

    #[async_trait]
    impl CheckpointStore for ScriptedCheckpoints {
        async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError> {
            if self.reject == Some(checkpoint.kind) {
                return Err(CheckpointError::Io(std::io::Error::other("disk full")));
            }
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, release)) = gate {
                entered.notify_one();
                release.notified().await;
            }
            self.inner.save(checkpoint).await
        }

        async fn get(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
            self.inner.get(id).await
        }

        async fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointMeta>, CheckpointError> {
            self.inner.list(run_id).await
        }

        async fn delete(&self, id: &CheckpointId) -> Result<(), CheckpointError> {
            self.inner.delete(id).await
        }

        async fn delete_by_run(&self, run_id: &RunId) -> Result<usize, CheckpointError> {
            self.inner.delete_by_run(run_id).await
        }

        async fn delete_by_chain(&self, chain_id: &ChainId) -> Result<usize, CheckpointError> {
            self.inner.delete_by_chain(chain_id).await
        }
    }

    fn two_steps() -> Chain {
        Chain::new("two", "two steps")
            .with_step(step("s1"))
            .with_step(step("s2"))
    }

    fn one_step() -> Chain {
        Chain::new("one", "one step").with_step(step("s1"))
    }

    /// 40,000 characters, five blocks of one letter each.
    fn large_input() -> String {
        ["a", "b", "c", "d", "e"]
            .iter()
            .map(|c| c.repeat(8000))
            .collect()
    }

    #[tokio::test]
    async fn test_short_input_two_steps() {
        let c = coordinator(TestInvoker::new(), vec![two_steps()]).await;
        let run_id = c
            .run_chain(&"two".into(), RunInput::text("hello"), options())
            .await
            .unwrap();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
        assert_eq!(meta.progress, 1.0);
        assert!(meta.error.is_none());
        assert_eq!(c.get_run_results(&run_id).await.unwrap(), "[s2][s1]hello");

        let checkpoints = c.list_checkpoints(&run_id).await.unwrap();
        let kinds: Vec<CheckpointKind> = checkpoints.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CheckpointKind::Intermediate,
                CheckpointKind::Intermediate,
                CheckpointKind::Complete
            ]
        );
        assert_eq!(checkpoints[0].step_id, Some("s1".into()));
        assert_eq!(checkpoints[1].step_id, Some("s2".into()));
        assert_eq!(
            meta.checkpoints,
            checkpoints.iter().map(|m| m.id.clone()).collect::<Vec<_>>()
        );

        let first = c.get_checkpoint(&checkpoints[0].id).await.unwrap();
        assert_eq!(first.content, "[s1]hello");
        let last = c.get_checkpoint(&checkpoints[2].id).await.unwrap();
        assert_eq!(last.content, "[s2][s1]hello");
    }

    #[tokio::test]
    async fn test_large_input_is_segmented_and_merged_in_order() {
        let invoker = TestInvoker::new().with_delay(Duration::from_millis(20));
        let peak = invoker.peak();
        let calls = invoker.calls();
        let c = coordinator(invoker, vec![one_step()]).await;

        let text = large_input();
        let run_id = c
            .run_chain(&"one".into(), RunInput::text(text.clone()), options())
            .await
            .unwrap();
        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Completed);

        let expected: Vec<String> = Segmenter::new(SegmentationMethod::Simple)
            .split(&text, 2000)
            .into_iter()
            .map(|s| format!("[s1]{}", s.content))
            .collect();
        assert_eq!(expected.len(), 5);
        assert_eq!(c.get_run_results(&run_id).await.unwrap(), expected.join("\n\n"));

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
        assert_eq!(c.list_checkpoints(&run_id).await.unwrap().len(), 2);
        assert!(meta.total_tokens > 10_000);
    }

    #[tokio::test]
    async fn test_segment_failure_fails_run_without_partial_merge() {
        let c = coordinator(TestInvoker::new().failing_on("ccc"), vec![one_step()]).await;
        let opts = ProcessingOptions {
            auto_retry: false,
            ..options()
        };
        let run_id = c
            .run_chain(&"one".into(), RunInput::text(large_input()), opts)
            .await
            .unwrap();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Failed);
        let error = meta.error.unwrap();
        assert!(error.contains("step 1 (s1)"), "{error}");
        assert!(error.contains("segment 3 of 5"), "{error}");

        let checkpoints = c.list_checkpoints(&run_id).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].kind, CheckpointKind::Error);
        assert!(matches!(
            c.get_run_results(&run_id).await,
            Err(CoordinatorError::NotCompleted {
                status: RunStatus::Failed,
                ..
            })
        ));

        for task in c.scheduler().tasks().list_by_run(&run_id).await {
            assert!(task.is_terminal(), "task {} left {:?}", task.id, task.status);
        }
    }

    #[tokio::test]
    async fn test_failing_step_is_named() {
        let chain = Chain::new("two", "two steps")
            .with_step(step("s1"))
            .with_step(ChainStep::new("s2", "test", "BOOM {{input}}"));
        let c = coordinator(TestInvoker::new().failing_on("BOOM"), vec![chain]).await;
        let opts = ProcessingOptions {
            auto_retry: false,
            ..options()
        };
        let run_id = c
            .run_chain(&"two".into(), RunInput::text("hi"), opts)
            .await
            .unwrap();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Failed);
        assert!(meta.error.unwrap().starts_with("step 2 (s2) failed"));
        let kinds: Vec<CheckpointKind> = c
            .list_checkpoints(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![CheckpointKind::Intermediate, CheckpointKind::Error]);
    }

    #[tokio::test]
    async fn test_cancel_then_results_not_completed() {
        let c = coordinator(
            TestInvoker::new().with_delay(Duration::from_secs(30)),
            vec![two_steps()],
        )
        .await;
        let run_id = c
            .run_chain(&"two".into(), RunInput::text("hello"), options())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        c.cancel_run(&run_id).await.unwrap();
        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Cancelled);

        let err = c.get_run_results(&run_id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotCompleted { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = c.cancel_run(&run_id).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::NotRunning {
                status: RunStatus::Cancelled,
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let tasks = c.scheduler().tasks().list_by_run(&run_id).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Cancelled);
        assert_eq!(c.scheduler().in_flight(), 0);
        assert!(c.list_checkpoints(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_fan_out() {
        let invoker = TestInvoker::new().with_delay(Duration::from_secs(30));
        let calls = invoker.calls();
        let c = coordinator(invoker, vec![one_step()]).await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text(large_input()), options())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            c.get_run_status(&run_id).await.unwrap().status,
            RunStatus::Processing
        );

        c.cancel_run(&run_id).await.unwrap();
        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Cancelled);
        assert!(c.get_run_results(&run_id).await.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let tasks = c.scheduler().tasks().list_by_run(&run_id).await;
                if tasks.iter().all(|t| t.is_terminal()) && c.scheduler().in_flight() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let tasks = c.scheduler().tasks().list_by_run(&run_id).await;
        assert_eq!(tasks.len(), 6);
        assert!(tasks
            .iter()
            .any(|t| t.kind == TaskKind::ModelExecution && t.status == TaskStatus::Cancelled));
        assert!(calls.load(Ordering::SeqCst) <= 3);
        assert!(c.list_checkpoints(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_the_coordinating_task_writes_run_metadata() {
        let c = coordinator(
            TestInvoker::new().with_delay(Duration::from_millis(5)),
            vec![one_step()],
        )
        .await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text(large_input()), options())
            .await
            .unwrap();
        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
        assert_eq!(meta.progress, 1.0);

        let tasks = c.scheduler().tasks().list_by_run(&run_id).await;
        let segment_tokens: usize = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::ModelExecution)
            .map(|t| t.metrics.input_tokens + t.metrics.output_tokens)
            .sum();
        assert_eq!(meta.total_tokens, segment_tokens);

        let handle = c.runs().get(&run_id).await.unwrap();
        assert_eq!(handle.writer_tasks(), 1);
    }

    #[tokio::test]
    async fn test_task_payloads_released_after_run() {
        let c = coordinator(TestInvoker::new(), vec![one_step()]).await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text(large_input()), options())
            .await
            .unwrap();
        c.wait_for_run(&run_id).await.unwrap();

        let tasks = c.scheduler().tasks().list_by_run(&run_id).await;
        assert_eq!(tasks.len(), 7);
        for task in tasks {
            assert_eq!(task.status, TaskStatus::Completed);
            assert!(task.input.text().map_or(true, str::is_empty), "{}", task.id);
            let output = task.output.as_ref().and_then(|o| o.text());
            assert!(output.map_or(true, str::is_empty), "{}", task.id);
        }
        assert!(c.get_run_results(&run_id).await.unwrap().len() > 40_000);
    }

    #[tokio::test]
    async fn test_finalize_failure_names_last_step() {
        let store = ScriptedCheckpoints::new().rejecting(CheckpointKind::Complete);
        let c = with_checkpoints(TestInvoker::new(), vec![two_steps()], Arc::new(store)).await;
        let run_id = c
            .run_chain(&"two".into(), RunInput::text("hello"), options())
            .await
            .unwrap();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Failed);
        let error = meta.error.unwrap();
        assert!(error.starts_with("step 2 (s2) failed: finalizing run"), "{error}");

        let kinds: Vec<CheckpointKind> = c
            .list_checkpoints(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                CheckpointKind::Intermediate,
                CheckpointKind::Intermediate,
                CheckpointKind::Error
            ]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_write_does_not_block_status_or_cancel() {
        let (store, entered, release) = ScriptedCheckpoints::new().gated();
        let store = Arc::new(store);
        let c = with_checkpoints(TestInvoker::new(), vec![one_step()], store.clone()).await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text("hello"), options())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), entered.notified())
            .await
            .unwrap();
        let meta = tokio::time::timeout(Duration::from_secs(1), c.get_run_status(&run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.status, RunStatus::Running);
        tokio::time::timeout(Duration::from_secs(1), c.cancel_run(&run_id))
            .await
            .unwrap()
            .unwrap();
        release.notify_one();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Cancelled);
        assert!(meta.checkpoints.is_empty());

        // The checkpoint written after the cancel is removed again.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.list(&run_id).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(c.get_run_status(&run_id).await.unwrap().checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_whitespace_input_is_accepted() {
        let c = coordinator(TestInvoker::new(), vec![one_step()]).await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text("  "), options())
            .await
            .unwrap();
        assert_eq!(
            c.wait_for_run(&run_id).await.unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(c.get_run_results(&run_id).await.unwrap(), "[s1]  ");
    }

    #[tokio::test]
    async fn test_status_reads_have_no_side_effects() {
        let c = coordinator(TestInvoker::new(), vec![one_step()]).await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text("hello"), options())
            .await
            .unwrap();
        c.wait_for_run(&run_id).await.unwrap();

        let first = c.get_run_status(&run_id).await.unwrap();
        let second = c.get_run_status(&run_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(c.list_runs().await, vec![first]);
    }

    #[tokio::test]
    async fn test_validation_errors_create_nothing() {
        let c = coordinator(TestInvoker::new(), vec![one_step()]).await;

        let err = c
            .run_chain(&"missing".into(), RunInput::text("x"), options())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ChainNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = c
            .run_chain(&"one".into(), RunInput::text(""), options())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidInput(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let bad = ProcessingOptions {
            max_parallel_chunks: 0,
            ..options()
        };
        let err = c
            .run_chain(&"one".into(), RunInput::text("x"), bad)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidOptions(_)));

        assert!(c.list_runs().await.is_empty());
        assert!(c.scheduler().tasks().is_empty().await);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let invoker = TestInvoker::new().failing_times(2);
        let calls = invoker.calls();
        let c = coordinator(invoker, vec![one_step()]).await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text("hello"), options())
            .await
            .unwrap();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let tasks = c.scheduler().tasks().list_by_run(&run_id).await;
        assert_eq!(tasks[0].metrics.attempts, 3);
    }

    #[tokio::test]
    async fn test_checkpoints_disabled() {
        let c = coordinator(TestInvoker::new(), vec![two_steps()]).await;
        let opts = ProcessingOptions {
            save_checkpoints: false,
            ..options()
        };
        let run_id = c
            .run_chain(&"two".into(), RunInput::text("hello"), opts)
            .await
            .unwrap();

        let meta = c.wait_for_run(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
        assert!(meta.checkpoints.is_empty());
        assert!(c.list_checkpoints(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_run() {
        let c = coordinator(
            TestInvoker::new().with_delay(Duration::from_millis(50)),
            vec![one_step()],
        )
        .await;
        let run_id = c
            .run_chain(&"one".into(), RunInput::text("hello"), options())
            .await
            .unwrap();

        let err = c.delete_run(&run_id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StillActive { .. }));

        c.wait_for_run(&run_id).await.unwrap();
        c.delete_run(&run_id).await.unwrap();

        assert!(matches!(
            c.get_run_status(&run_id).await,
            Err(CoordinatorError::RunNotFound(_))
        ));
        assert!(c.list_checkpoints(&run_id).await.unwrap().is_empty());
        assert!(c.scheduler().tasks().list_by_run(&run_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_file_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ChainRegistry::new());
        registry.insert(one_step()).await.unwrap();
        let config = EngineConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            externalize_threshold_bytes: 16,
            ..Default::default()
        };
        let c = RunCoordinator::from_config(registry, Arc::new(TestInvoker::new()), &config)
            .await
            .unwrap();

        let text = "x".repeat(100);
        let run_id = c
            .run_chain(&"one".into(), RunInput::text(text.clone()), options())
            .await
            .unwrap();
        c.wait_for_run(&run_id).await.unwrap();

        let checkpoints = c.list_checkpoints(&run_id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert!(checkpoints.iter().all(|m| m.externalized));
        let complete = c.get_checkpoint(&checkpoints[1].id).await.unwrap();
        assert_eq!(complete.content, format!("[s1]{text}"));
    }
}
