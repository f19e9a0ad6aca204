//! # stagehand-queue
//!
//! Pipeline task queue for stagehand.
//!
//! - [`task`] - Task and status types
//! - [`scheduler`] - [`TaskQueue`], which enforces stage order and worker-kind
//!   serialization
//! - [`discovery`] - [`ProjectSource`] collaborators that find new projects

pub mod discovery;
pub mod scheduler;
pub mod task;

pub use discovery::{DirectorySource, ProjectSource};
pub use scheduler::{CompletionOutcome, QueueSummary, TaskQueue};
pub use task::{Task, TaskId, TaskStatus};
