//! # stagehand-core
//!
//! Core types, errors, configuration and logging for the stagehand worker
//! supervisor.
//!
//! This crate provides:
//! - [`StagehandError`] - Error type shared by every stagehand crate
//! - [`logging`] - Tracing setup
//! - [`types`] - Worker kinds, slot status and pipeline stages
//! - [`config`] - YAML configuration
//!
//! ## Example
//!
//! ```no_run
//! use stagehand_core::{StagehandConfig, logging};
//!
//! fn main() -> stagehand_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = StagehandConfig::load(None)?;
//!     tracing::info!(parallel = config.workers.parallel, "configuration loaded");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{ExecutionMode, StagehandConfig};
pub use error::{Result, StagehandError};
pub use logging::{LogGuard, init_logging};
pub use types::{ProjectCode, SlotId, SlotStatus, Stage, WorkerKind};
