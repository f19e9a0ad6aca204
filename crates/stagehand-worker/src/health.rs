//! Output-based health monitoring.
//!
//! One monitor runs per attached worker process. It reads the merged output
//! stream line by line, logs each line under the `stagehand::output` target,
//! and classifies it:
//!
//! 1. fatal match: restart now, regardless of the error counter
//! 2. recoverable match: bump the consecutive error counter; restart when it
//!    reaches the threshold
//! 3. anything else: ignored
//!
//! When the stream ends the monitor waits for the process to exit and then
//! asks for a restart, unless the handle was replaced or a restart is already
//! running. A monitor never outlives its process. The slot aborts it on
//! `stop`, and it stops reading once the slot's generation moves on, even if
//! a descendant still holds the pipe open.

use crate::classifier::{ErrorClassifier, LineClass};
use crate::process::OutputStream;
use crate::restart::RestartReason;
use crate::slot::{ExitPoll, WorkerSlot};
use async_trait::async_trait;
use stagehand_core::logging::OUTPUT_TARGET;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receiver of automatic restart requests.
#[async_trait]
pub trait RestartRequester: Send + Sync {
    /// Begin an automatic restart of `slot`.
    ///
    /// Must decide synchronously (before returning) whether the restart goes
    /// ahead, so that later lines of the same burst see the slot restarting.
    async fn request_restart(&self, slot: &Arc<WorkerSlot>, reason: RestartReason);

    /// Whether the pool is shutting down.
    fn is_shutting_down(&self) -> bool;
}

/// Classifies worker output and triggers restarts.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    classifier: Arc<ErrorClassifier>,
    threshold: u32,
}

impl HealthMonitor {
    pub fn new(classifier: Arc<ErrorClassifier>, threshold: u32) -> Self {
        Self {
            classifier,
            threshold: threshold.max(1),
        }
    }

    /// Record and classify one line of `slot`'s output.
    ///
    /// Returns the restart reason when the line calls for a restart.
    pub async fn evaluate(&self, slot: &WorkerSlot, line: &str) -> Option<RestartReason> {
        slot.record_output(line).await;
        info!(target: OUTPUT_TARGET, slot = %slot.id(), "{line}");

        match self.classifier.classify(line) {
            LineClass::Fatal => {
                error!(slot = %slot.id(), line, "fatal error in worker output");
                Some(RestartReason::FatalOutput)
            }
            LineClass::Recoverable => {
                let count = slot.note_recoverable_error().await;
                warn!(
                    slot = %slot.id(),
                    line,
                    count,
                    threshold = self.threshold,
                    "recoverable error in worker output"
                );
                (count >= self.threshold).then_some(RestartReason::ErrorThreshold)
            }
            LineClass::Normal => None,
        }
    }

    /// Watch one process generation of `slot` until it is gone.
    pub async fn run<R>(
        &self,
        requester: &R,
        slot: Arc<WorkerSlot>,
        generation: u64,
        mut output: OutputStream,
        exit_poll: Duration,
    ) where
        R: RestartRequester + ?Sized,
    {
        while let Some(line) = output.read_line().await {
            // a descendant can keep the pipe open past a relaunch
            if slot.generation() != generation {
                debug!(slot = %slot.id(), generation, "process replaced, monitor exiting");
                return;
            }
            if let Some(reason) = self.evaluate(&slot, &line).await {
                requester.request_restart(&slot, reason).await;
            }
        }
        debug!(slot = %slot.id(), generation, "worker output closed");

        let status = loop {
            match slot.poll_exit(generation).await {
                ExitPoll::Alive => tokio::time::sleep(exit_poll).await,
                ExitPoll::Exited(status) => break status,
                ExitPoll::Superseded => {
                    debug!(slot = %slot.id(), generation, "process replaced, monitor exiting");
                    return;
                }
            }
        };

        if !slot.mark_exited(generation).await {
            return;
        }
        warn!(
            slot = %slot.id(),
            exit_code = ?status.and_then(|s| s.code()),
            "worker process exited"
        );
        if requester.is_shutting_down() {
            return;
        }
        requester
            .request_restart(&slot, RestartReason::ProcessExit)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::{RestartDecision, RestartOrigin, RestartPolicy};
    use stagehand_core::config::HealthConfig;
    use stagehand_core::types::{SlotStatus, WorkerKind};
    use tokio::sync::Mutex;

    fn monitor() -> HealthMonitor {
        let classifier = ErrorClassifier::from_config(&HealthConfig::default()).unwrap();
        HealthMonitor::new(Arc::new(classifier), 3)
    }

    /// Applies the restart decision and records what went ahead.
    #[derive(Default)]
    struct Recorder {
        proceeded: Mutex<Vec<RestartReason>>,
    }

    #[async_trait]
    impl RestartRequester for Recorder {
        async fn request_restart(&self, slot: &Arc<WorkerSlot>, reason: RestartReason) {
            let decision = slot
                .begin_restart(RestartOrigin::Automatic(reason), &RestartPolicy::default())
                .await;
            if matches!(decision, RestartDecision::Proceed { .. }) {
                self.proceeded.lock().await.push(reason);
            }
        }

        fn is_shutting_down(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_fatal_bypasses_counter() {
        let monitor = monitor();
        let slot = WorkerSlot::new(WorkerKind::Parallel, Some(1));
        assert_eq!(
            monitor.evaluate(&slot, "Chrome attempt 3/3 failed").await,
            Some(RestartReason::FatalOutput)
        );
        let snapshot = slot.snapshot().await;
        assert_eq!(snapshot.consecutive_errors, 0);
        assert_eq!(
            snapshot.last_output_line.as_deref(),
            Some("Chrome attempt 3/3 failed")
        );
    }

    #[tokio::test]
    async fn test_threshold() {
        let monitor = monitor();
        let slot = WorkerSlot::new(WorkerKind::Parallel, Some(2));
        assert_eq!(monitor.evaluate(&slot, "✗ Chrome error").await, None);
        assert_eq!(monitor.evaluate(&slot, "rendering frame 12").await, None);
        assert_eq!(monitor.evaluate(&slot, "✗ Chrome error").await, None);
        assert_eq!(
            monitor.evaluate(&slot, "reCAPTCHA evaluation failed").await,
            Some(RestartReason::ErrorThreshold)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_one_restart_per_burst() {
        use crate::launcher::LaunchSpec;
        use stagehand_core::StagehandConfig;
        use stagehand_core::config::ExecutionMode;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("worker.sh"),
            "for i in 1 2 3 4 5 6; do echo 'Chrome attempt 1/3 failed'; done\n\
             echo 'Chrome attempt 3/3 failed'\n",
        )
        .unwrap();
        let mut config = StagehandConfig::default();
        config.tool_dir = dir.path().to_path_buf();
        config.interpreter = "sh".to_string();
        config.execution_mode = ExecutionMode::Attached;
        config.launch.sequential_script = "worker.sh".to_string();
        config.launch.sequential_args = Vec::new();
        let spec = LaunchSpec::for_slot(&config, WorkerKind::Sequential, None, 0);

        let slot = Arc::new(WorkerSlot::new(WorkerKind::Sequential, None));
        let (generation, output) = slot.start(&spec).await.unwrap().unwrap();

        let recorder = Recorder::default();
        monitor()
            .run(
                &recorder,
                slot.clone(),
                generation,
                output.unwrap(),
                Duration::from_millis(10),
            )
            .await;

        // threshold hit on line 3; later errors, the fatal line and the exit
        // all land while the slot is already restarting
        assert_eq!(
            *recorder.proceeded.lock().await,
            vec![RestartReason::ErrorThreshold]
        );
        let snapshot = slot.snapshot().await;
        assert_eq!(snapshot.restart_count, 1);
        assert_eq!(snapshot.status, SlotStatus::Restarting);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_requests_restart() {
        use crate::launcher::LaunchSpec;
        use stagehand_core::StagehandConfig;
        use stagehand_core::config::ExecutionMode;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("worker.sh"), "echo done\nexit 0\n").unwrap();
        let mut config = StagehandConfig::default();
        config.tool_dir = dir.path().to_path_buf();
        config.interpreter = "sh".to_string();
        config.execution_mode = ExecutionMode::Attached;
        config.launch.sequential_script = "worker.sh".to_string();
        config.launch.sequential_args = Vec::new();
        let spec = LaunchSpec::for_slot(&config, WorkerKind::Sequential, None, 0);

        let slot = Arc::new(WorkerSlot::new(WorkerKind::Sequential, None));
        let (generation, output) = slot.start(&spec).await.unwrap().unwrap();

        let recorder = Recorder::default();
        monitor()
            .run(
                &recorder,
                slot.clone(),
                generation,
                output.unwrap(),
                Duration::from_millis(10),
            )
            .await;

        assert_eq!(
            *recorder.proceeded.lock().await,
            vec![RestartReason::ProcessExit]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaced_generation_stops_reading() {
        use crate::launcher::LaunchSpec;
        use stagehand_core::StagehandConfig;
        use stagehand_core::config::ExecutionMode;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("worker.sh"),
            "echo 'Chrome attempt 3/3 failed'\nexec sleep 30\n",
        )
        .unwrap();
        let mut config = StagehandConfig::default();
        config.tool_dir = dir.path().to_path_buf();
        config.interpreter = "sh".to_string();
        config.execution_mode = ExecutionMode::Attached;
        config.launch.sequential_script = "worker.sh".to_string();
        config.launch.sequential_args = Vec::new();
        let spec = LaunchSpec::for_slot(&config, WorkerKind::Sequential, None, 0);

        let slot = Arc::new(WorkerSlot::new(WorkerKind::Sequential, None));
        let (generation, output) = slot.start(&spec).await.unwrap().unwrap();

        // a monitor left over from the previous generation
        let recorder = Recorder::default();
        tokio::time::timeout(
            Duration::from_secs(5),
            monitor().run(
                &recorder,
                slot.clone(),
                generation - 1,
                output.unwrap(),
                Duration::from_millis(10),
            ),
        )
        .await
        .unwrap();

        assert!(recorder.proceeded.lock().await.is_empty());
        let snapshot = slot.snapshot().await;
        assert!(snapshot.last_output_line.is_none());
        assert_eq!(snapshot.status, SlotStatus::Running);
        slot.stop(Duration::from_secs(2)).await;
    }
}
