//! Worker supervision for stagehand.
//!
//! This crate launches the pipeline's worker processes, watches their
//! output, restarts them when they fail, and resizes the pool of parallel
//! workers on request.
//!
//! # Overview
//!
//! Each worker identity is a [`WorkerSlot`]: one sequential document worker
//! and N interchangeable parallel render workers. A slot owns at most one
//! [`ProcessHandle`]. In attached mode a [`HealthMonitor`] reads the merged
//! output of that process and classifies every line with the
//! [`ErrorClassifier`]:
//!
//! - a fatal line restarts the worker immediately
//! - recoverable lines restart it once they reach the error threshold
//! - a process that exits on its own is restarted
//!
//! Restarts stop the slot, kill the shared browser processes through a
//! [`SiblingCleanup`] strategy, wait the restart delay and relaunch.
//!
//! # Example
//!
//! ```no_run
//! use stagehand_core::StagehandConfig;
//! use stagehand_worker::{Supervisor, cleanup};
//!
//! #[tokio::main]
//! async fn main() -> stagehand_core::Result<()> {
//!     let config = StagehandConfig::load(None)?;
//!     let supervisor = Supervisor::new(config.clone(), cleanup::from_config(&config.cleanup))?;
//!
//!     supervisor.start_all().await?;
//!     supervisor.scale_to(4).await?;
//!
//!     for slot in supervisor.status().await {
//!         println!("{}: {} (restarts: {})", slot.id, slot.status, slot.restart_count);
//!     }
//!
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Worker launch contract
//!
//! Workers run in `tool_dir` as `<interpreter> <script> <args...>` and learn
//! their identity from the environment; see [`launcher`].

pub mod classifier;
pub mod cleanup;
pub mod health;
pub mod launcher;
pub mod process;
pub mod restart;
pub mod slot;
pub mod supervisor;

#[cfg(test)]
mod lifecycle_tests;

pub use classifier::{ErrorClassifier, LineClass};
pub use cleanup::{KillByName, NoCleanup, SiblingCleanup};
pub use health::HealthMonitor;
pub use launcher::LaunchSpec;
pub use process::{OutputStream, ProcessHandle};
pub use restart::{RestartPolicy, RestartReason};
pub use slot::{SlotSnapshot, WorkerSlot};
pub use supervisor::Supervisor;
