//! Error types for stagehand operations.
//!
//! This module defines [`StagehandError`], the error enum shared by every
//! stagehand crate. Only errors an operator can act on are returned
//! synchronously: configuration problems, spawn failures and console
//! misuse. Output-classified failures and termination problems are handled
//! inside the restart machinery and surface through logs and `status`.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`StagehandError`].
pub type Result<T> = std::result::Result<T, StagehandError>;

/// Error type for all stagehand operations.
#[derive(Debug, Error)]
pub enum StagehandError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    /// An error pattern failed to compile
    #[error("Invalid {set} pattern '{pattern}': {message}")]
    InvalidPattern {
        set: &'static str,
        pattern: String,
        message: String,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Slot / Process Errors
    // =========================================================================
    /// Slot not found in the registry
    #[error("Worker slot not found: {slot_id}")]
    SlotNotFound { slot_id: String },

    /// The launch target of a slot does not exist
    #[error("Launch target for {slot_id} not found: {path}")]
    ScriptMissing { slot_id: String, path: PathBuf },

    /// OS-level spawn failure
    #[error("Failed to spawn worker {slot_id}: {message}")]
    Spawn { slot_id: String, message: String },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    /// Requested parallel worker count outside the admissible range
    #[error("Cannot scale to {requested} parallel workers (allowed {min}-{max})")]
    ScaleOutOfRange { requested: u32, min: u32, max: u32 },

    /// Supervisor is shutting down and refuses new work
    #[error("Supervisor is shutting down")]
    ShuttingDown,

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// Task not found in the queue
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: u64 },

    /// Task is not in a state that allows the operation
    #[error("Task {task_id} is {status}, expected running")]
    TaskNotRunning { task_id: u64, status: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in stagehand)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StagehandError {
    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a SlotNotFound error
    pub fn slot_not_found(slot_id: impl Into<String>) -> Self {
        Self::SlotNotFound {
            slot_id: slot_id.into(),
        }
    }

    /// Create a spawn error
    pub fn spawn(slot_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            slot_id: slot_id.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigValidation { .. }
                | Self::InvalidPattern { .. }
        )
    }

    /// Returns true if the error came from launching a worker process
    pub fn is_spawn_error(&self) -> bool {
        matches!(self, Self::ScriptMissing { .. } | Self::Spawn { .. })
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Create ~/.stagehand/config.yaml or pass --config <path>")
            }
            Self::ConfigInvalid { .. } => Some("Check YAML syntax in the configuration file"),
            Self::InvalidPattern { .. } => {
                Some("Patterns are regular expressions; escape literal brackets and dots")
            }
            Self::ScriptMissing { .. } => {
                Some("Check tool_dir and the launch script names in the configuration")
            }
            Self::SlotNotFound { .. } => Some("Run 'status' to list worker slots"),
            Self::ScaleOutOfRange { .. } => {
                Some("Adjust workers.min_parallel / workers.max_parallel to widen the range")
            }
            _ => None,
        }
    }
}
