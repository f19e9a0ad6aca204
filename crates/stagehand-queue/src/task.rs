//! Task types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::types::{ProjectCode, SlotId, Stage};
use std::fmt;

/// Queue-local task identifier.
pub type TaskId = u64;

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker
    #[default]
    Pending,
    /// Claimed by a worker slot
    Running,
    /// Finished successfully (retired from the queue)
    Completed,
    /// Failed and parked after exhausting its retries
    Failed,
}

impl TaskStatus {
    /// Returns true while the task still blocks later stages of its project.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work: a project at a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Queue-local identifier
    pub id: TaskId,
    /// Project code, e.g. `AR47-0028`
    pub project_code: ProjectCode,
    /// Pipeline stage
    pub stage: Stage,
    /// Current status
    pub status: TaskStatus,
    /// Slot working on the task while running
    pub assigned_slot: Option<SlotId>,
    /// Number of failed attempts so far
    pub retry_count: u32,
    /// When the task was first enqueued
    pub created_at: DateTime<Utc>,
    /// When the task was last claimed
    pub started_at: Option<DateTime<Utc>>,
    /// Error reported by the last failed attempt
    pub last_error: Option<String>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: TaskId, project_code: impl Into<ProjectCode>, stage: Stage) -> Self {
        Self {
            id,
            project_code: project_code.into(),
            stage,
            status: TaskStatus::Pending,
            assigned_slot: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            last_error: None,
        }
    }

    /// Short display form used by the console.
    pub fn display(&self) -> String {
        format!("{} [{}] {}", self.project_code, self.stage, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(1, "AR47-0028", Stage::Document);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_slot.is_none());
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.display(), "AR47-0028 [document] pending");
    }

    #[test]
    fn test_open_statuses() {
        assert!(TaskStatus::Pending.is_open());
        assert!(TaskStatus::Failed.is_open());
        assert!(!TaskStatus::Completed.is_open());
    }
}
