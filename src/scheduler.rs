//! Local build-graph execution
//!
//! ## Table of Contents
//! - **TaskRunner**: Executes one task
//! - **LocalScheduler**: Runs a graph in topological order on one control thread
//! - **TaskOutcome**: Result of one task
//! - **RunReport**: End-of-run summary

use crate::error::Result;
use crate::graph::{BuildGraph, BuildTask, TaskKind, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Executes a single build task
pub trait TaskRunner: Send + Sync {
    /// Run `task`; any error fails the task
    fn run(&self, task: &BuildTask) -> Result<()>;
}

/// Shared runner handle
pub type BoxedTaskRunner = Arc<dyn TaskRunner>;

/// Result of one task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Task id
    pub id: String,
    /// Task kind
    pub kind: TaskKind,
    /// Final status
    pub status: TaskStatus,
    /// Failure or skip reason
    pub error: Option<String>,
    /// When the task started, if it ran
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached its final status
    pub finished_at: DateTime<Utc>,
}

/// Summary of one local run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// One outcome per task, in execution order
    pub outcomes: Vec<TaskOutcome>,
    /// Whether a required task failed and the run stopped
    pub aborted: bool,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Outcome of a task
    pub fn outcome(&self, id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Tasks that failed
    pub fn failed(&self) -> Vec<&TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Failed)
            .collect()
    }

    /// Whether every required task succeeded
    pub fn is_success(&self) -> bool {
        !self.aborted
            && self
                .outcomes
                .iter()
                .filter(|o| o.kind.is_required())
                .all(|o| o.status == TaskStatus::Succeeded)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = |status: TaskStatus| self.outcomes.iter().filter(|o| o.status == status).count();
        writeln!(
            f,
            "publish run {} in {}s: {} succeeded, {} failed, {} skipped{}",
            if self.is_success() { "finished" } else { "FAILED" },
            (self.finished_at - self.started_at).num_seconds(),
            count(TaskStatus::Succeeded),
            count(TaskStatus::Failed),
            count(TaskStatus::Skipped),
            if self.aborted { " (aborted)" } else { "" }
        )?;
        for outcome in &self.outcomes {
            match &outcome.error {
                Some(reason) => writeln!(f, "  {:<20} {:?}: {}", outcome.id, outcome.status, reason)?,
                None => writeln!(f, "  {:<20} {:?}", outcome.id, outcome.status)?,
            }
        }
        Ok(())
    }
}

/// Runs every task of a graph sequentially
pub struct LocalScheduler {
    runner: BoxedTaskRunner,
}

impl LocalScheduler {
    /// Scheduler delegating to `runner`
    pub fn new(runner: BoxedTaskRunner) -> Self {
        Self { runner }
    }

    /// Run `graph` to completion.
    ///
    /// A failed `export_base` stops the run. Other optional failures skip
    /// their dependents, except the sink, which runs with whatever exists.
    pub fn run(&self, graph: &mut BuildGraph) -> Result<RunReport> {
        let order = graph.topological_order()?;
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(order.len());
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        let mut aborted = false;

        for id in &order {
            let Some(task) = graph.get(id).cloned() else {
                continue;
            };

            if aborted || (blocked.contains(id) && task.kind != TaskKind::Assemble) {
                let reason = if aborted {
                    "run aborted".to_string()
                } else {
                    "upstream task failed".to_string()
                };
                warn!(task = %id, reason = %reason, "Task skipped");
                graph.set_status(id, TaskStatus::Skipped);
                outcomes.push(TaskOutcome {
                    id: id.clone(),
                    kind: task.kind,
                    status: TaskStatus::Skipped,
                    error: Some(reason),
                    started_at: None,
                    finished_at: Utc::now(),
                });
                continue;
            }

            graph.set_status(id, TaskStatus::Running);
            let task_start = Utc::now();
            info!(task = %id, "Task started");
            let result = self.runner.run(&task);
            let finished_at = Utc::now();

            let (status, reason) = match result {
                Ok(()) => {
                    info!(
                        task = %id,
                        elapsed_ms = (finished_at - task_start).num_milliseconds(),
                        "Task succeeded"
                    );
                    (TaskStatus::Succeeded, None)
                }
                Err(e) if task.kind.is_required() => {
                    error!(task = %id, error = %e, "Required task failed");
                    if task.kind == TaskKind::ExportBase {
                        aborted = true;
                    }
                    (TaskStatus::Failed, Some(e.to_string()))
                }
                Err(e) => {
                    warn!(task = %id, error = %e, "Optional task failed, artifact omitted");
                    blocked.extend(graph.dependents_of(id));
                    (TaskStatus::Failed, Some(e.to_string()))
                }
            };
            graph.set_status(id, status);
            outcomes.push(TaskOutcome {
                id: id.clone(),
                kind: task.kind,
                status,
                error: reason,
                started_at: Some(task_start),
                finished_at,
            });
        }

        let report = RunReport {
            outcomes,
            aborted,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            success = report.is_success(),
            failed = report.failed().len(),
            "Local run finished"
        );
        Ok(report)
    }
}
