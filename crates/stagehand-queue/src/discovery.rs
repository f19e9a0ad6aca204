//! Project discovery.
//!
//! A [`ProjectSource`] supplies `(project code, stage)` pairs that the
//! supervisor feeds into [`TaskQueue::enqueue`](crate::TaskQueue::enqueue).
//! Sources only report; the queue decides what is new.
//!
//! [`DirectorySource`] treats every subdirectory of a projects folder whose
//! name looks like a project code (`AR47-0028`, `KA2-0001`) as a project
//! waiting for its DOCUMENT stage:
//!
//! ```text
//! projects/
//! ├── AR47-0028/      -> ("AR47-0028", document)
//! ├── KA2-0001/       -> ("KA2-0001", document), or skipped with channel = AR47
//! └── notes/          -> ignored
//! ```

use async_trait::async_trait;
use regex::Regex;
use stagehand_core::types::{ProjectCode, Stage};
use stagehand_core::{Result, StagehandError};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, instrument};

static PROJECT_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{2}\d*-\d+$").expect("project code pattern is valid")
});

/// Returns true if `name` looks like a project code.
pub fn is_project_code(name: &str) -> bool {
    PROJECT_CODE.is_match(name)
}

/// Channel of a project code: the part before the first `-`.
pub fn channel_of(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

/// Supplies project codes pending a stage.
#[async_trait]
pub trait ProjectSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Scan for projects. Results are ordered; duplicates are harmless.
    async fn scan(&self) -> Result<Vec<(ProjectCode, Stage)>>;
}

/// Scans immediate subdirectories of a projects folder.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    channel: Option<String>,
}

impl DirectorySource {
    /// Create a source over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            channel: None,
        }
    }

    /// Only report codes from `channel` (compared case-insensitively).
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    fn in_channel(&self, code: &str) -> bool {
        match &self.channel {
            Some(channel) => channel_of(code).eq_ignore_ascii_case(channel),
            None => true,
        }
    }
}

#[async_trait]
impl ProjectSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    #[instrument(level = "debug", skip(self), fields(root = %self.root.display()))]
    async fn scan(&self) -> Result<Vec<(ProjectCode, Stage)>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StagehandError::io("reading projects directory", &self.root, e))?;

        let mut codes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StagehandError::io("reading projects directory", &self.root, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_project_code(&name) && self.in_channel(&name) {
                codes.push(name);
            }
        }

        codes.sort();
        debug!(found = codes.len(), "project scan complete");
        Ok(codes.into_iter().map(|c| (c, Stage::Document)).collect())
    }
}
