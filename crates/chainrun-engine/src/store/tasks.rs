//! Task store: task records, dependency edges and the task state machine.
//!
//! A task is `ready` exactly when every dependency is `completed`. Completing
//! a task promotes its pending dependents in the same critical section, so no
//! reader ever sees a pending task whose dependencies are all done.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use chainrun_core::{RunId, Task, TaskId, TaskMetrics, TaskOutput, TaskStatus};

/// Task store errors.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Invalid state transition for task {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} still has {count} live dependents")]
    HasLiveDependents { id: TaskId, count: usize },
}

#[derive(Default)]
struct Graph {
    tasks: HashMap<TaskId, Task>,
    /// Reverse edges: task -> tasks that depend on it.
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl Graph {
    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task, TaskStoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))
    }

    fn transition(&mut self, id: &TaskId, to: TaskStatus) -> Result<&mut Task, TaskStoreError> {
        let task = self.get_mut(id)?;
        if !task.status.can_transition_to(to) {
            return Err(TaskStoreError::InvalidTransition {
                id: id.clone(),
                from: task.status,
                to,
            });
        }
        task.status = to;
        Ok(task)
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Promote pending dependents of `id` whose dependencies are all complete.
    fn promote_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let candidates: Vec<TaskId> = self
            .dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut promoted = Vec::new();
        for candidate in candidates {
            let ready = match self.tasks.get(&candidate) {
                Some(task) => {
                    task.status == TaskStatus::Pending && self.dependencies_completed(task)
                }
                None => false,
            };
            if ready {
                if let Some(task) = self.tasks.get_mut(&candidate) {
                    task.status = TaskStatus::Ready;
                    promoted.push(candidate);
                }
            }
        }
        promoted
    }

    fn live_dependents(&self, id: &TaskId) -> usize {
        self.dependents
            .get(id)
            .map(|set| {
                set.iter()
                    .filter(|d| self.tasks.get(*d).map(|t| !t.is_terminal()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        for dep in &task.dependencies {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(id);
            }
        }
        self.dependents.remove(id);
        Some(task)
    }
}

/// In-memory task store guarded by a single lock.
#[derive(Default)]
pub struct TaskStore {
    graph: RwLock<Graph>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task. Its status is derived from its dependencies:
    /// `ready` when they have all completed, `pending` otherwise.
    pub async fn insert(&self, mut task: Task) -> Result<TaskId, TaskStoreError> {
        let mut graph = self.graph.write().await;
        if graph.tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        for dep in &task.dependencies {
            if !graph.tasks.contains_key(dep) {
                return Err(TaskStoreError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        task.status = if graph.dependencies_completed(&task) {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };

        let id = task.id.clone();
        for dep in &task.dependencies {
            graph
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
        }
        debug!(task_id = %id, kind = ?task.kind, status = ?task.status, "Task stored");
        graph.tasks.insert(id.clone(), task);
        Ok(id)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task, TaskStoreError> {
        self.graph
            .read()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))
    }

    pub async fn status(&self, id: &TaskId) -> Result<TaskStatus, TaskStoreError> {
        self.graph
            .read()
            .await
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))
    }

    /// Tasks owned by a run, oldest first.
    pub async fn list_by_run(&self, run_id: &RunId) -> Vec<Task> {
        let graph = self.graph.read().await;
        let mut tasks: Vec<Task> = graph
            .tasks
            .values()
            .filter(|t| &t.run_id == run_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Outputs of a task's dependencies, in declared dependency order.
    pub async fn dependency_outputs(
        &self,
        id: &TaskId,
    ) -> Result<Vec<(TaskId, TaskStatus, Option<TaskOutput>)>, TaskStoreError> {
        let graph = self.graph.read().await;
        let task = graph
            .tasks
            .get(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))?;
        task.dependency_order
            .iter()
            .map(|dep| {
                graph
                    .tasks
                    .get(dep)
                    .map(|t| (dep.clone(), t.status, t.output.clone()))
                    .ok_or_else(|| TaskStoreError::UnknownDependency {
                        task: id.clone(),
                        dependency: dep.clone(),
                    })
            })
            .collect()
    }

    /// `ready -> running`.
    pub async fn mark_running(&self, id: &TaskId) -> Result<Task, TaskStoreError> {
        let mut graph = self.graph.write().await;
        let task = graph.transition(id, TaskStatus::Running)?;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        Ok(task.clone())
    }

    /// `running -> ready`, between retry attempts.
    pub async fn mark_retrying(&self, id: &TaskId, error: &str) -> Result<(), TaskStoreError> {
        let mut graph = self.graph.write().await;
        let task = graph.transition(id, TaskStatus::Ready)?;
        task.error = Some(error.to_string());
        Ok(())
    }

    /// `running -> completed`. Returns dependents promoted to `ready`.
    pub async fn complete(
        &self,
        id: &TaskId,
        output: TaskOutput,
        metrics: TaskMetrics,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let mut graph = self.graph.write().await;
        let task = graph.transition(id, TaskStatus::Completed)?;
        task.output = Some(output);
        task.metrics = metrics;
        task.error = None;
        task.finished_at = Some(Utc::now());

        let promoted = graph.promote_dependents(id);
        if !promoted.is_empty() {
            debug!(task_id = %id, promoted = promoted.len(), "Dependents ready");
        }
        Ok(promoted)
    }

    /// `running -> failed`.
    pub async fn fail(
        &self,
        id: &TaskId,
        error: impl Into<String>,
        metrics: TaskMetrics,
    ) -> Result<(), TaskStoreError> {
        let mut graph = self.graph.write().await;
        let task = graph.transition(id, TaskStatus::Failed)?;
        task.error = Some(error.into());
        task.metrics = metrics;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel a non-terminal task. Returns false if it was already terminal.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, TaskStoreError> {
        let mut graph = self.graph.write().await;
        let task = graph.get_mut(id)?;
        if task.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(Utc::now());
        info!(task_id = %id, "Task cancelled");
        Ok(true)
    }

    /// Manually pause a pending or ready task.
    pub async fn pause(&self, id: &TaskId) -> Result<(), TaskStoreError> {
        let mut graph = self.graph.write().await;
        graph.transition(id, TaskStatus::Paused)?;
        info!(task_id = %id, "Task paused");
        Ok(())
    }

    /// Resume a paused task into `ready` or `pending` depending on its dependencies.
    pub async fn resume(&self, id: &TaskId) -> Result<TaskStatus, TaskStoreError> {
        let mut graph = self.graph.write().await;
        let next = {
            let task = graph
                .tasks
                .get(id)
                .ok_or_else(|| TaskStoreError::NotFound(id.clone()))?;
            if graph.dependencies_completed(task) {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            }
        };
        graph.transition(id, next)?;
        info!(task_id = %id, status = ?next, "Task resumed");
        Ok(next)
    }

    /// Delete a task that has no live dependents.
    pub async fn delete(&self, id: &TaskId) -> Result<Task, TaskStoreError> {
        let mut graph = self.graph.write().await;
        if !graph.tasks.contains_key(id) {
            return Err(TaskStoreError::NotFound(id.clone()));
        }
        let count = graph.live_dependents(id);
        if count > 0 {
            return Err(TaskStoreError::HasLiveDependents {
                id: id.clone(),
                count,
            });
        }
        graph
            .remove(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.clone()))
    }

    /// Remove every task of a run. Returns how many were removed.
    pub async fn delete_run(&self, run_id: &RunId) -> usize {
        let mut graph = self.graph.write().await;
        let ids: Vec<TaskId> = graph
            .tasks
            .values()
            .filter(|t| &t.run_id == run_id)
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            graph.remove(id);
        }
        ids.len()
    }

    /// Drop the input and output text of a run's terminal tasks. Status,
    /// metrics and errors stay. Returns how many tasks were released.
    pub async fn release_payloads(&self, run_id: &RunId) -> usize {
        let mut graph = self.graph.write().await;
        let mut released = 0;
        for task in graph
            .tasks
            .values_mut()
            .filter(|t| &t.run_id == run_id && t.is_terminal())
        {
            task.input.clear_text();
            if let Some(output) = task.output.as_mut() {
                output.clear_text();
            }
            released += 1;
        }
        if released > 0 {
            debug!(run_id = %run_id, tasks = released, "Task payloads released");
        }
        released
    }

    /// Task counts per status.
    pub async fn counts_by_status(&self) -> HashMap<TaskStatus, usize> {
        let graph = self.graph.read().await;
        let mut counts = HashMap::new();
        for task in graph.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.graph.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.graph.read().await.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainrun_core::{ChainId, TaskInput};

    fn task(run: &str) -> Task {
        Task::new(
            RunId::new(run),
            ChainId::new("chain"),
            TaskInput::Preprocessing {
                text: String::new(),
            },
        )
    }

    fn text(s: &str) -> TaskOutput {
        TaskOutput::Text {
            text: s.to_string(),
        }
    }

    async fn run_to_completion(store: &TaskStore, id: &TaskId) -> Vec<TaskId> {
        store.mark_running(id).await.unwrap();
        store
            .complete(id, text("done"), TaskMetrics::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ready_iff_dependencies_completed() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        let b = store.insert(task("r")).await.unwrap();
        let c = store
            .insert(task("r").with_dependency(a.clone()).with_dependency(b.clone()))
            .await
            .unwrap();

        assert_eq!(store.status(&a).await.unwrap(), TaskStatus::Ready);
        assert_eq!(store.status(&c).await.unwrap(), TaskStatus::Pending);

        assert!(run_to_completion(&store, &a).await.is_empty());
        assert_eq!(store.status(&c).await.unwrap(), TaskStatus::Pending);

        assert_eq!(run_to_completion(&store, &b).await, vec![c.clone()]);
        assert_eq!(store.status(&c).await.unwrap(), TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_dependent_of_completed_task_starts_ready() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        run_to_completion(&store, &a).await;

        let b = store.insert(task("r").with_dependency(a)).await.unwrap();
        assert_eq!(store.status(&b).await.unwrap(), TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let store = TaskStore::new();
        let err = store
            .insert(task("r").with_dependency(TaskId::new("ghost")))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::UnknownDependency { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_cannot_run_pending_task() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        let b = store.insert(task("r").with_dependency(a)).await.unwrap();
        let err = store.mark_running(&b).await.unwrap_err();
        assert!(matches!(
            err,
            TaskStoreError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_blocked_by_live_dependents() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        let b = store.insert(task("r").with_dependency(a.clone())).await.unwrap();

        let err = store.delete(&a).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::HasLiveDependents { count: 1, .. }));

        store.cancel(&b).await.unwrap();
        store.delete(&a).await.unwrap();
        assert!(matches!(
            store.get(&a).await,
            Err(TaskStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        store.pause(&a).await.unwrap();
        assert_eq!(store.status(&a).await.unwrap(), TaskStatus::Paused);
        assert!(store.mark_running(&a).await.is_err());
        assert_eq!(store.resume(&a).await.unwrap(), TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        run_to_completion(&store, &a).await;
        assert!(!store.cancel(&a).await.unwrap());
        assert_eq!(store.status(&a).await.unwrap(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_dependency_outputs_in_declared_order() {
        let store = TaskStore::new();
        let a = store.insert(task("r")).await.unwrap();
        let b = store.insert(task("r")).await.unwrap();
        let c = store
            .insert(task("r").with_dependency(b.clone()).with_dependency(a.clone()))
            .await
            .unwrap();
        run_to_completion(&store, &a).await;

        let outputs = store.dependency_outputs(&c).await.unwrap();
        assert_eq!(outputs[0].0, b);
        assert_eq!(outputs[0].1, TaskStatus::Ready);
        assert_eq!(outputs[1].0, a);
        assert_eq!(outputs[1].2, Some(text("done")));
    }

    #[tokio::test]
    async fn test_delete_run_only_touches_that_run() {
        let store = TaskStore::new();
        store.insert(task("r1")).await.unwrap();
        store.insert(task("r1")).await.unwrap();
        store.insert(task("r2")).await.unwrap();

        assert_eq!(store.delete_run(&RunId::new("r1")).await, 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.list_by_run(&RunId::new("r2")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_payloads_skips_live_tasks() {
        let store = TaskStore::new();
        let payload = |run: &str| {
            Task::new(
                RunId::new(run),
                ChainId::new("chain"),
                TaskInput::Preprocessing {
                    text: "x".repeat(64),
                },
            )
        };
        let done = store.insert(payload("r1")).await.unwrap();
        let live = store.insert(payload("r1")).await.unwrap();
        let other = store.insert(payload("r2")).await.unwrap();
        run_to_completion(&store, &done).await;
        run_to_completion(&store, &other).await;

        assert_eq!(store.release_payloads(&RunId::new("r1")).await, 1);

        let released = store.get(&done).await.unwrap();
        assert_eq!(released.status, TaskStatus::Completed);
        assert_eq!(released.input.text(), Some(""));
        assert_eq!(released.output.unwrap().text(), Some(""));

        let live = store.get(&live).await.unwrap();
        assert_eq!(live.input.text().map(str::len), Some(64));
        let other = store.get(&other).await.unwrap();
        assert_eq!(other.output, Some(text("done")));
    }
}
