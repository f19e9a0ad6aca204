//! Shared type definitions used across stagehand crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identity of a worker slot ("sequential", "parallel-2").
pub type SlotId = String;

/// Project code such as `AR47-0028`.
pub type ProjectCode = String;

/// The two kinds of worker the pool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// The single worker that produces documents, one project at a time
    Sequential,
    /// One of N interchangeable rendering workers
    Parallel,
}

impl WorkerKind {
    /// Build the slot id for this kind.
    ///
    /// Sequential slots have no ordinal; parallel slots always do.
    pub fn slot_id(&self, ordinal: Option<u32>) -> SlotId {
        match (self, ordinal) {
            (Self::Sequential, _) => "sequential".to_string(),
            (Self::Parallel, Some(n)) => format!("parallel-{n}"),
            (Self::Parallel, None) => "parallel".to_string(),
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    /// Accepts the kind names plus the legacy aliases operators still type.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "seq" | "excel" | "document" => Ok(Self::Sequential),
            "parallel" | "par" | "chrome" | "render" => Ok(Self::Parallel),
            other => Err(format!("unknown worker kind '{other}'")),
        }
    }
}

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// No process; initial state
    #[default]
    Stopped,
    /// Launch in progress
    Starting,
    /// Process is live
    Running,
    /// Last start failed, or the restart ceiling was hit
    Error,
    /// Restart sequence in progress
    Restarting,
}

impl SlotStatus {
    /// Returns true if a process is expected to be live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }

    /// Status indicator for the console table.
    pub fn indicator(&self) -> &'static str {
        match self {
            Self::Stopped => "■",
            Self::Starting => "↻",
            Self::Running => "●",
            Self::Error => "✗",
            Self::Restarting => "↻",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Restarting => write!(f, "restarting"),
        }
    }
}

/// Pipeline stage of a project. Ordered; projects advance left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Build the project document
    Document,
    /// Render still images
    RenderImage,
    /// Render video
    RenderVideo,
}

impl Stage {
    /// Kind of worker that executes this stage.
    pub fn worker_kind(&self) -> WorkerKind {
        match self {
            Self::Document => WorkerKind::Sequential,
            Self::RenderImage | Self::RenderVideo => WorkerKind::Parallel,
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Document => Some(Self::RenderImage),
            Self::RenderImage => Some(Self::RenderVideo),
            Self::RenderVideo => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::RenderImage => write!(f, "render_image"),
            Self::RenderVideo => write!(f, "render_video"),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "excel" => Ok(Self::Document),
            "render_image" | "image" => Ok(Self::RenderImage),
            "render_video" | "video" => Ok(Self::RenderVideo),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}
