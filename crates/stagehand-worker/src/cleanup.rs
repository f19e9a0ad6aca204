//! Sibling process cleanup.
//!
//! Parallel render workers share a system-wide pool of browser processes
//! that outlive their parent when it crashes. Before relaunching a parallel
//! worker, and at pool start and shutdown, the supervisor kills that pool by
//! executable name. The kill is coarse: it also hits siblings belonging to
//! healthy slots, which relaunch their own browsers on demand.

use async_trait::async_trait;
use stagehand_core::config::{CleanupConfig, CleanupStrategy};
use std::fmt::Debug;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Strategy for killing the shared sibling-process pool.
#[async_trait]
pub trait SiblingCleanup: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Kill sibling processes. Failures are logged, never returned.
    async fn kill_siblings(&self);
}

/// Build the cleanup strategy selected in configuration.
pub fn from_config(config: &CleanupConfig) -> Arc<dyn SiblingCleanup> {
    match config.strategy {
        CleanupStrategy::KillByName => Arc::new(KillByName::new(
            config.process_names.clone(),
            config.timeout,
        )),
        CleanupStrategy::None => Arc::new(NoCleanup),
    }
}

/// Kills every process whose name matches one of `names`.
///
/// Uses `taskkill /F /IM <name>` on Windows and `pkill -f <name>` elsewhere.
#[derive(Debug, Clone)]
pub struct KillByName {
    names: Vec<String>,
    timeout: Duration,
}

impl KillByName {
    pub fn new(names: Vec<String>, timeout: Duration) -> Self {
        Self { names, timeout }
    }

    fn command_for(name: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("taskkill");
            cmd.args(["/F", "/IM", name]);
            cmd
        } else {
            let mut cmd = Command::new("pkill");
            cmd.args(["-f", name]);
            cmd
        }
    }
}

#[async_trait]
impl SiblingCleanup for KillByName {
    fn name(&self) -> &str {
        "kill_by_name"
    }

    #[instrument(level = "debug", skip(self), fields(names = ?self.names))]
    async fn kill_siblings(&self) {
        for name in &self.names {
            let mut cmd = Self::command_for(name);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            match timeout(self.timeout, cmd.status()).await {
                // pkill exits 1 when nothing matched
                Ok(Ok(status)) => debug!(process = %name, %status, "sibling kill finished"),
                Ok(Err(e)) => warn!(process = %name, error = %e, "sibling kill failed to run"),
                Err(_) => warn!(process = %name, timeout = ?self.timeout, "sibling kill timed out"),
            }
        }
        info!(processes = ?self.names, "sibling processes killed");
    }
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCleanup;

#[async_trait]
impl SiblingCleanup for NoCleanup {
    fn name(&self) -> &str {
        "none"
    }

    async fn kill_siblings(&self) {}
}

/// Counts cleanup calls.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingCleanup {
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RecordingCleanup {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl SiblingCleanup for RecordingCleanup {
    fn name(&self) -> &str {
        "recording"
    }

    async fn kill_siblings(&self) {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
