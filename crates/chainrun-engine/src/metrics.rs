//! Prometheus metrics collection and formatting.
//!
//! This module renders run and task gauges in Prometheus text exposition format.

use std::fmt::Write;

use chainrun_core::{RunStatus, TaskStatus};

use crate::coordinator::RunCoordinator;

const RUN_STATUSES: [(RunStatus, &str); 6] = [
    (RunStatus::Pending, "pending"),
    (RunStatus::Running, "running"),
    (RunStatus::Processing, "processing"),
    (RunStatus::Completed, "completed"),
    (RunStatus::Failed, "failed"),
    (RunStatus::Cancelled, "cancelled"),
];

const TASK_STATUSES: [(TaskStatus, &str); 7] = [
    (TaskStatus::Pending, "pending"),
    (TaskStatus::Ready, "ready"),
    (TaskStatus::Running, "running"),
    (TaskStatus::Completed, "completed"),
    (TaskStatus::Failed, "failed"),
    (TaskStatus::Paused, "paused"),
    (TaskStatus::Cancelled, "cancelled"),
];

/// Collect all metrics from the coordinator and format as Prometheus text.
pub async fn collect_metrics(coordinator: &RunCoordinator) -> String {
    let mut output = String::new();

    collect_run_metrics(coordinator, &mut output).await;
    collect_task_metrics(coordinator, &mut output).await;

    output
}

/// Collect run metrics by status.
async fn collect_run_metrics(coordinator: &RunCoordinator, output: &mut String) {
    let counts = coordinator.runs().counts_by_status().await;

    writeln!(output, "# HELP chainrun_runs_total Number of runs by status").ok();
    writeln!(output, "# TYPE chainrun_runs_total gauge").ok();
    for (status, label) in RUN_STATUSES {
        let n = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "chainrun_runs_total{{status=\"{label}\"}} {n}").ok();
    }
}

/// Collect task metrics by status, plus the in-flight gauge.
async fn collect_task_metrics(coordinator: &RunCoordinator, output: &mut String) {
    let scheduler = coordinator.scheduler();
    let counts = scheduler.tasks().counts_by_status().await;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP chainrun_tasks_total Total number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE chainrun_tasks_total gauge").ok();
    for (status, label) in TASK_STATUSES {
        let n = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "chainrun_tasks_total{{status=\"{label}\"}} {n}").ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP chainrun_tasks_in_flight Tasks currently executing"
    )
    .ok();
    writeln!(output, "# TYPE chainrun_tasks_in_flight gauge").ok();
    writeln!(output, "chainrun_tasks_in_flight {}", scheduler.in_flight()).ok();
}
