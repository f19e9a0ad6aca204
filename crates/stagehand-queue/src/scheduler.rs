//! Pipeline task queue.
//!
//! [`TaskQueue`] tracks which stage each project has reached and hands out
//! work to worker slots. Claiming enforces the pipeline rules:
//!
//! - DOCUMENT tasks go to the sequential slot, render tasks to parallel slots
//! - a project's stages run strictly in order
//! - at most one task per project is running
//! - at most one sequential task is running across the whole pool
//!
//! Ties are broken by queue order. A failed task goes to the back of the
//! queue; a successful one is retired and its successor stage is enqueued.

use crate::task::{Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use stagehand_core::types::{ProjectCode, Stage, WorkerKind};
use stagehand_core::{Result, StagehandError};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What happened to a task passed to [`TaskQueue::complete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// Task retired; `next` is the stage enqueued after it, if any
    Advanced { next: Option<Stage> },
    /// Task failed and went back to the end of the queue
    Requeued { retry_count: u32 },
    /// Task failed past the retry ceiling and is parked as FAILED
    Parked { retry_count: u32 },
}

/// Queue counters for the console summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub completed: u64,
}

/// In-memory task queue and pipeline progress.
#[derive(Debug)]
pub struct TaskQueue {
    /// Open tasks in claim order
    tasks: Vec<Task>,
    /// Last completed stage per project
    progress: HashMap<ProjectCode, Stage>,
    /// Next task id
    next_id: TaskId,
    /// Failed attempts before a task is parked; `None` retries forever
    max_retries: Option<u32>,
    /// Tasks retired successfully
    completed_count: u64,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new(max_retries: Option<u32>) -> Self {
        Self {
            tasks: Vec::new(),
            progress: HashMap::new(),
            next_id: 1,
            max_retries,
            completed_count: 0,
        }
    }

    /// Add a pending task for `code` at `stage`.
    ///
    /// Returns `false` without changing anything when a task for the same
    /// code and stage already exists, or when the project has already
    /// completed that stage or a later one.
    pub fn enqueue(&mut self, code: impl Into<ProjectCode>, stage: Stage) -> bool {
        let code = code.into();

        if self.progress.get(&code).is_some_and(|done| stage <= *done) {
            debug!(project = %code, %stage, "stage already completed, not enqueuing");
            return false;
        }
        if self
            .tasks
            .iter()
            .any(|t| t.project_code == code && t.stage == stage)
        {
            debug!(project = %code, %stage, "task already queued");
            return false;
        }

        let id = self.next_id;
        self.next_id += 1;
        info!(task_id = id, project = %code, %stage, "task enqueued");
        self.tasks.push(Task::new(id, code, stage));
        true
    }

    /// Claim the next eligible task for a slot of `kind`.
    pub fn claim(&mut self, kind: WorkerKind, slot_id: &str) -> Option<Task> {
        if kind == WorkerKind::Sequential
            && self.tasks.iter().any(|t| {
                t.status == TaskStatus::Running && t.stage.worker_kind() == WorkerKind::Sequential
            })
        {
            return None;
        }

        let index = self.tasks.iter().position(|t| {
            t.status == TaskStatus::Pending && t.stage.worker_kind() == kind && self.is_eligible(t)
        })?;

        let task = &mut self.tasks[index];
        task.status = TaskStatus::Running;
        task.assigned_slot = Some(slot_id.to_string());
        task.started_at = Some(chrono::Utc::now());
        info!(
            task_id = task.id,
            project = %task.project_code,
            stage = %task.stage,
            slot = slot_id,
            "task claimed"
        );
        Some(task.clone())
    }

    /// No running task for the same project and no open earlier stage.
    fn is_eligible(&self, candidate: &Task) -> bool {
        !self.tasks.iter().any(|t| {
            t.id != candidate.id
                && t.project_code == candidate.project_code
                && (t.status == TaskStatus::Running || t.stage < candidate.stage)
        })
    }

    /// Report the result of a running task.
    pub fn complete(
        &mut self,
        task_id: TaskId,
        success: bool,
        error: Option<String>,
    ) -> Result<CompletionOutcome> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or(StagehandError::TaskNotFound { task_id })?;

        if self.tasks[index].status != TaskStatus::Running {
            return Err(StagehandError::TaskNotRunning {
                task_id,
                status: self.tasks[index].status.to_string(),
            });
        }

        if success {
            let task = self.tasks.remove(index);
            self.completed_count += 1;
            let done = self.progress.entry(task.project_code.clone()).or_insert(task.stage);
            if task.stage > *done {
                *done = task.stage;
            }
            info!(task_id, project = %task.project_code, stage = %task.stage, "task completed");

            let next = task.stage.next();
            if let Some(next_stage) = next {
                self.enqueue(task.project_code, next_stage);
            }
            return Ok(CompletionOutcome::Advanced { next });
        }

        let mut task = self.tasks.remove(index);
        task.status = TaskStatus::Failed;
        task.retry_count += 1;
        task.assigned_slot = None;
        task.last_error = error;
        let retry_count = task.retry_count;

        let parked = self.max_retries.is_some_and(|max| retry_count > max);
        if parked {
            warn!(
                task_id,
                project = %task.project_code,
                stage = %task.stage,
                retry_count,
                "task exceeded retry limit, parked"
            );
            self.tasks.push(task);
            return Ok(CompletionOutcome::Parked { retry_count });
        }

        warn!(
            task_id,
            project = %task.project_code,
            stage = %task.stage,
            retry_count,
            error = task.last_error.as_deref().unwrap_or(""),
            "task failed, requeued"
        );
        task.status = TaskStatus::Pending;
        self.tasks.push(task);
        Ok(CompletionOutcome::Requeued { retry_count })
    }

    /// Return every task running on `slot_id` to PENDING.
    ///
    /// Does not count as a retry. Returns the ids that were released.
    pub fn release_slot(&mut self, slot_id: &str) -> Vec<TaskId> {
        let mut released = Vec::new();
        for task in self.tasks.iter_mut().filter(|t| {
            t.status == TaskStatus::Running && t.assigned_slot.as_deref() == Some(slot_id)
        }) {
            task.status = TaskStatus::Pending;
            task.assigned_slot = None;
            released.push(task.id);
        }
        if !released.is_empty() {
            info!(slot = slot_id, tasks = ?released, "released running tasks back to pending");
        }
        released
    }

    /// Look up a task by id.
    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Copy of all open tasks in queue order.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.clone()
    }

    /// Last stage completed by `code`.
    pub fn progress(&self, code: &str) -> Option<Stage> {
        self.progress.get(code).copied()
    }

    /// Number of open tasks (pending, running or parked).
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks waiting to be claimed.
    pub fn pending_count(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Counters for the console.
    pub fn summary(&self) -> QueueSummary {
        QueueSummary {
            pending: self.count(TaskStatus::Pending),
            running: self.count(TaskStatus::Running),
            failed: self.count(TaskStatus::Failed),
            completed: self.completed_count,
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(None)
    }
}
