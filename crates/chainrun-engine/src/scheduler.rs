//! Task scheduler - executes ready tasks.
//!
//! Every execution holds an entry in the in-flight registry for its whole
//! lifetime, retries included, so a task id is never run twice at once.
//! Attempts are bounded by the task timeout and observe cancellation through
//! the registered token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainrun_core::{
    merge, Segment, Segmenter, Task, TaskId, TaskInput, TaskKind, TaskMetrics, TaskOutput,
    TaskStatus,
};

use crate::config::EngineConfig;
use crate::invoker::{InvokeError, ModelInvoker};
use crate::retry::RetryPolicy;
use crate::store::{TaskStore, TaskStoreError};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {id} is not ready (status: {status:?})")]
    NotReady { id: TaskId, status: TaskStatus },

    #[error("Task {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("Task {id} failed: {message}")]
    Execution { id: TaskId, message: String },

    #[error("Task {id} timed out after {after:?}")]
    Timeout { id: TaskId, after: Duration },

    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    #[error("Task kind {0:?} is not implemented")]
    NotImplemented(TaskKind),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error("{failed} of {total} tasks failed: {}", .messages.join("; "))]
    Batch {
        failed: usize,
        total: usize,
        messages: Vec<String>,
    },
}

impl SchedulerError {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::Timeout { .. })
    }
}

/// Scheduler settings taken from the engine config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub task_timeout: Duration,
    pub max_concurrent_tasks: usize,
    pub cost_per_1k_tokens: f64,
    /// Policy for callers that do not bring their own.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            max_concurrent_tasks: config.max_concurrent_tasks.max(1),
            cost_per_1k_tokens: config.cost_per_1k_tokens,
            retry: RetryPolicy::from_options(&config.processing),
        }
    }
}

/// Outcome of a batch: outputs of successful tasks and every failure.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outputs: HashMap<TaskId, TaskOutput>,
    pub failures: Vec<(TaskId, SchedulerError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outputs.len() + self.failures.len()
    }

    /// Collapse into an error if any task failed.
    pub fn into_result(self) -> Result<HashMap<TaskId, TaskOutput>, SchedulerError> {
        if self.failures.is_empty() {
            return Ok(self.outputs);
        }
        let total = self.total();
        Err(SchedulerError::Batch {
            failed: self.failures.len(),
            total,
            messages: self.failures.iter().map(|(_, e)| e.to_string()).collect(),
        })
    }
}

/// Result of one dispatched attempt.
struct Dispatched {
    output: TaskOutput,
    input_tokens: usize,
    output_tokens: usize,
}

type Registry = Mutex<HashMap<TaskId, CancellationToken>>;

/// Removes a task from the in-flight registry when dropped.
struct InFlight<'a> {
    registry: &'a Registry,
    id: TaskId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.remove(&self.id);
    }
}

/// Task scheduler.
pub struct TaskScheduler {
    tasks: Arc<TaskStore>,
    invoker: Arc<dyn ModelInvoker>,
    config: SchedulerConfig,
    in_flight: Registry,
}

impl TaskScheduler {
    /// Create a new TaskScheduler.
    pub fn new(
        tasks: Arc<TaskStore>,
        invoker: Arc<dyn ModelInvoker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            invoker,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Token estimate of `text` as seen by the invoker.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.invoker.estimate_tokens(text)
    }

    /// Number of tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn register(
        &self,
        ctx: &CancellationToken,
        id: &TaskId,
    ) -> Result<(InFlight<'_>, CancellationToken), SchedulerError> {
        let mut registry = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if registry.contains_key(id) {
            return Err(SchedulerError::AlreadyRunning(id.clone()));
        }
        let token = ctx.child_token();
        registry.insert(id.clone(), token.clone());
        Ok((
            InFlight {
                registry: &self.in_flight,
                id: id.clone(),
            },
            token,
        ))
    }

    /// Execute a ready task with the scheduler's default retry policy.
    pub async fn execute_task(
        &self,
        ctx: &CancellationToken,
        id: &TaskId,
    ) -> Result<TaskOutput, SchedulerError> {
        self.execute_task_with(ctx, id, &self.config.retry).await
    }

    /// Execute a ready task with an explicit retry policy.
    pub async fn execute_task_with(
        &self,
        ctx: &CancellationToken,
        id: &TaskId,
        policy: &RetryPolicy,
    ) -> Result<TaskOutput, SchedulerError> {
        let (_guard, token) = self.register(ctx, id)?;

        let task = self.tasks.get(id).await.map_err(|e| match e {
            TaskStoreError::NotFound(id) => SchedulerError::TaskNotFound(id),
            other => other.into(),
        })?;
        if task.status != TaskStatus::Ready {
            return Err(SchedulerError::NotReady {
                id: id.clone(),
                status: task.status,
            });
        }

        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if token.is_cancelled() {
                return Err(self.cancelled(id).await);
            }
            self.tasks.mark_running(id).await?;
            debug!(task_id = %id, kind = ?task.kind, attempt, "Task attempt started");

            let result = tokio::select! {
                _ = token.cancelled() => Err(SchedulerError::Cancelled(id.clone())),
                r = tokio::time::timeout(self.config.task_timeout, self.dispatch(&token, &task)) => {
                    r.unwrap_or_else(|_| Err(SchedulerError::Timeout {
                        id: id.clone(),
                        after: self.config.task_timeout,
                    }))
                }
            };

            let mut metrics = TaskMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                attempts: attempt,
                ..Default::default()
            };

            match result {
                Ok(done) => {
                    if token.is_cancelled() {
                        return Err(self.cancelled(id).await);
                    }
                    metrics.input_tokens = done.input_tokens;
                    metrics.output_tokens = done.output_tokens;
                    metrics.cost = (done.input_tokens + done.output_tokens) as f64 / 1000.0
                        * self.config.cost_per_1k_tokens;
                    match self.tasks.complete(id, done.output.clone(), metrics).await {
                        Ok(_) => {}
                        Err(TaskStoreError::InvalidTransition {
                            from: TaskStatus::Cancelled,
                            ..
                        }) => return Err(SchedulerError::Cancelled(id.clone())),
                        Err(e) => return Err(e.into()),
                    }
                    debug!(task_id = %id, attempt, "Task completed");
                    return Ok(done.output);
                }
                Err(SchedulerError::Cancelled(_)) => {
                    return Err(self.cancelled(id).await);
                }
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.backoff_delay(attempt + 1);
                    warn!(
                        task_id = %id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Task attempt failed, retrying"
                    );
                    self.tasks.mark_retrying(id, &e.to_string()).await?;
                    tokio::select! {
                        _ = token.cancelled() => return Err(self.cancelled(id).await),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(task_id = %id, attempt, error = %e, "Task failed");
                    self.tasks.fail(id, e.to_string(), metrics).await?;
                    return Err(e);
                }
            }
        }
    }

    /// Record cancellation of a task this scheduler was executing.
    async fn cancelled(&self, id: &TaskId) -> SchedulerError {
        if let Err(e) = self.tasks.cancel(id).await {
            warn!(task_id = %id, error = %e, "Failed to mark task cancelled");
        }
        SchedulerError::Cancelled(id.clone())
    }

    async fn dispatch(
        &self,
        token: &CancellationToken,
        task: &Task,
    ) -> Result<Dispatched, SchedulerError> {
        match &task.input {
            TaskInput::ModelExecution { step, text, .. } => {
                let prompt = step.render_prompt(text);
                let output = self
                    .invoker
                    .execute(token, step, &prompt, &step.params)
                    .await
                    .map_err(|e| match e {
                        InvokeError::Cancelled => SchedulerError::Cancelled(task.id.clone()),
                        other => SchedulerError::Execution {
                            id: task.id.clone(),
                            message: other.to_string(),
                        },
                    })?;
                Ok(Dispatched {
                    input_tokens: self.invoker.estimate_tokens(&prompt),
                    output_tokens: self.invoker.estimate_tokens(&output),
                    output: TaskOutput::Text { text: output },
                })
            }
            TaskInput::Segmentation {
                step,
                text,
                chunk_size_tokens,
                method,
            } => {
                let segments = Segmenter::new(*method).split(text, *chunk_size_tokens);
                let mut children = Vec::with_capacity(segments.len());
                for segment in segments {
                    let child = Task::new(
                        task.run_id.clone(),
                        task.chain_id.clone(),
                        TaskInput::ModelExecution {
                            step: step.clone(),
                            text: segment.content,
                            segment: Some(segment.order),
                        },
                    )
                    .with_dependency(task.id.clone());
                    children.push(self.tasks.insert(child).await?);
                }
                debug!(task_id = %task.id, segments = children.len(), "Input segmented");
                Ok(Dispatched {
                    output: TaskOutput::Segments { children },
                    input_tokens: 0,
                    output_tokens: 0,
                })
            }
            TaskInput::Integration { separator } => {
                let deps = self.tasks.dependency_outputs(&task.id).await?;
                let mut parts = Vec::with_capacity(deps.len());
                for (order, (dep, status, output)) in deps.into_iter().enumerate() {
                    let text = match (status, output.as_ref().and_then(|o| o.text())) {
                        (TaskStatus::Completed, Some(text)) => text.to_string(),
                        _ => {
                            return Err(SchedulerError::Execution {
                                id: task.id.clone(),
                                message: format!("dependency {} has no text output", dep),
                            })
                        }
                    };
                    parts.push(Segment::new(order, text));
                }
                let text = merge(parts, separator).map_err(|e| SchedulerError::Execution {
                    id: task.id.clone(),
                    message: e.to_string(),
                })?;
                Ok(Dispatched {
                    output: TaskOutput::Text { text },
                    input_tokens: 0,
                    output_tokens: 0,
                })
            }
            TaskInput::Preprocessing { .. } => Err(SchedulerError::NotImplemented(task.kind)),
        }
    }

    /// Cancel a task: trip its token if it is executing, then mark it cancelled.
    /// Returns false if the task had already finished.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let token = {
            let registry = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            registry.get(id).cloned()
        };
        if let Some(token) = token {
            token.cancel();
        }
        let cancelled = self.tasks.cancel(id).await.map_err(|e| match e {
            TaskStoreError::NotFound(id) => SchedulerError::TaskNotFound(id),
            other => other.into(),
        })?;
        if cancelled {
            info!(task_id = %id, "Task cancellation requested");
        }
        Ok(cancelled)
    }

    /// Execute tasks on a pool of `max_concurrent_tasks` workers fed from a
    /// shared queue. Every task is attempted; failures are collected.
    pub async fn execute_batch(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        ids: Vec<TaskId>,
    ) -> BatchReport {
        let total = ids.len();
        let (tx, rx) = mpsc::channel(total.max(1));
        for id in ids {
            // Capacity covers every id.
            let _ = tx.try_send(id);
        }
        drop(tx);

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.config.max_concurrent_tasks.min(total).max(1);
        let mut join_set = JoinSet::new();
        for worker in 0..workers {
            let scheduler = self.clone();
            let rx = rx.clone();
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let mut results = Vec::new();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(id) = next else { break };
                    let result = scheduler.execute_task(&ctx, &id).await;
                    results.push((id, result));
                }
                debug!(worker, handled = results.len(), "Batch worker finished");
                results
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(results) => {
                    for (id, result) in results {
                        match result {
                            Ok(output) => {
                                report.outputs.insert(id, output);
                            }
                            Err(e) => report.failures.push((id, e)),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Batch worker aborted"),
            }
        }

        info!(
            total,
            completed = report.outputs.len(),
            failed = report.failures.len(),
            "Batch finished"
        );
        report
    }
}
