//! End-to-end tests for slot and pool lifecycle.
//!
//! These tests run a real pool against small `sh` worker scripts in a
//! temporary tool directory:
//! - Start, status and shutdown of a mixed pool
//! - Automatic restarts (threshold, fatal line, process exit)
//! - Restart ceiling
//! - Scaling up and down
//! - Task queue pass-through and discovery
//!
//! Sibling cleanup is replaced by a recording double so no real process is
//! ever killed by name.

#[cfg(all(test, unix))]
mod tests {
    use crate::cleanup::RecordingCleanup;
    use crate::slot::SlotSnapshot;
    use crate::supervisor::Supervisor;
    use stagehand_core::config::ExecutionMode;
    use stagehand_core::types::{SlotStatus, Stage};
    use stagehand_core::{StagehandConfig, StagehandError};
    use stagehand_queue::{DirectorySource, TaskStatus};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const IDLE: &str = "exec sleep 30\n";

    /// Writes `excel.sh` and `chrome1.sh`..`chrome10.sh`, all idling.
    fn tool_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "excel.sh", IDLE);
        for n in 1..=10 {
            write_script(dir.path(), &format!("chrome{n}.sh"), IDLE);
        }
        dir
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    /// Script that runs `first_run` once, then idles on every relaunch.
    fn once_then_idle(first_run: &str) -> String {
        format!(
            "if [ ! -f \"$0.ran\" ]; then\n  touch \"$0.ran\"\n{first_run}\nfi\n{IDLE}"
        )
    }

    fn test_config(dir: &TempDir, parallel: u32) -> StagehandConfig {
        let mut config = StagehandConfig::default();
        config.tool_dir = dir.path().to_path_buf();
        config.interpreter = "sh".to_string();
        config.execution_mode = ExecutionMode::Attached;
        config.workers.parallel = parallel;
        config.launch.sequential_script = "excel.sh".to_string();
        config.launch.sequential_args = Vec::new();
        config.launch.parallel_script = "chrome{ordinal}.sh".to_string();
        config.restart.delay = Duration::from_millis(50);
        config.restart.max_delay = Duration::from_millis(200);
        config.cleanup.settle = Duration::ZERO;
        config.timing.start_stagger = Duration::ZERO;
        config.timing.grace_timeout = Duration::from_secs(1);
        config.timing.exit_poll = Duration::from_millis(10);
        config
    }

    fn pool(config: StagehandConfig) -> (Supervisor, Arc<RecordingCleanup>) {
        let cleanup = Arc::new(RecordingCleanup::default());
        let supervisor = Supervisor::new(config, cleanup.clone()).unwrap();
        (supervisor, cleanup)
    }

    /// Poll a slot every 20ms for up to 5s until `predicate` holds.
    async fn wait_for_slot<P>(supervisor: &Supervisor, slot_id: &str, predicate: P) -> SlotSnapshot
    where
        P: Fn(&SlotSnapshot) -> bool,
    {
        for _ in 0..250 {
            let current = snapshot(supervisor, slot_id).await;
            if predicate(&current) {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "{slot_id} never reached the expected state: {:?}",
            snapshot(supervisor, slot_id).await
        );
    }

    async fn snapshot(supervisor: &Supervisor, slot_id: &str) -> SlotSnapshot {
        supervisor
            .status()
            .await
            .into_iter()
            .find(|s| s.id == slot_id)
            .unwrap()
    }

    // =========================================================================
    // Pool start / stop
    // =========================================================================

    #[tokio::test]
    async fn test_start_all_status_and_shutdown() {
        let dir = tool_dir();
        let (supervisor, cleanup) = pool(test_config(&dir, 2));

        supervisor.start_all().await.unwrap();
        assert_eq!(cleanup.calls(), 1);

        let status = supervisor.status().await;
        let ids: Vec<_> = status.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["sequential", "parallel-1", "parallel-2"]);
        assert!(status.iter().all(|s| s.status == SlotStatus::Running));
        assert!(status.iter().all(|s| s.pid.is_some()));

        supervisor.shutdown().await;
        let status = supervisor.status().await;
        assert!(status.iter().all(|s| s.status == SlotStatus::Stopped));
        assert_eq!(cleanup.calls(), 2);

        // idempotent, and the pool refuses new work
        supervisor.shutdown().await;
        assert_eq!(cleanup.calls(), 2);
        assert!(matches!(
            supervisor.start_all().await,
            Err(StagehandError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_worker_environment() {
        let dir = tool_dir();
        write_script(
            dir.path(),
            "chrome2.sh",
            &format!("echo \"$PARALLEL_CHROME $STAGEHAND_SLOT_ID\" > env2.txt\n{IDLE}"),
        );
        let (supervisor, _cleanup) = pool(test_config(&dir, 2));
        supervisor.start_all().await.unwrap();

        let env_file = dir.path().join("env2.txt");
        for _ in 0..250 {
            if std::fs::read_to_string(&env_file).is_ok_and(|s| s.contains("parallel-2")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            std::fs::read_to_string(&env_file).unwrap().trim(),
            "2/2 parallel-2"
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_script_does_not_abort_start_all() {
        let dir = tool_dir();
        std::fs::remove_file(dir.path().join("chrome1.sh")).unwrap();
        let (supervisor, _cleanup) = pool(test_config(&dir, 2));

        supervisor.start_all().await.unwrap();
        assert_eq!(snapshot(&supervisor, "parallel-1").await.status, SlotStatus::Error);
        assert_eq!(snapshot(&supervisor, "parallel-2").await.status, SlotStatus::Running);

        let err = supervisor.start_slot("parallel-1").await.unwrap_err();
        assert!(matches!(err, StagehandError::ScriptMissing { .. }));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_slot() {
        let dir = tool_dir();
        let (supervisor, _cleanup) = pool(test_config(&dir, 1));
        assert!(matches!(
            supervisor.restart_slot("parallel-9").await,
            Err(StagehandError::SlotNotFound { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_single_live_process_across_transitions() {
        let dir = tool_dir();
        let (supervisor, _cleanup) = pool(test_config(&dir, 1));

        supervisor.start_slot("parallel-1").await.unwrap();
        supervisor.start_slot("parallel-1").await.unwrap();
        let first = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(first.generation, 1);

        supervisor.restart_slot("parallel-1").await.unwrap();
        supervisor.start_slot("parallel-1").await.unwrap();
        let second = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(second.generation, 2);
        assert_ne!(first.pid, second.pid);

        // the first process was terminated and reaped
        let old = format!("/proc/{}", first.pid.unwrap());
        assert!(!Path::new(&old).exists());

        supervisor.stop_slot("parallel-1").await.unwrap();
        supervisor.stop_slot("parallel-1").await.unwrap();
        assert_eq!(
            snapshot(&supervisor, "parallel-1").await.status,
            SlotStatus::Stopped
        );
    }

    // =========================================================================
    // Automatic restarts
    // =========================================================================

    #[tokio::test]
    async fn test_threshold_restart_only_affects_failing_slot() {
        let dir = tool_dir();
        write_script(
            dir.path(),
            "chrome2.sh",
            &once_then_idle(
                "  echo 'Chrome attempt 1/3 failed'\n  echo '✗ Chrome error'\n  echo 'The browser connection fails'",
            ),
        );
        let (supervisor, cleanup) = pool(test_config(&dir, 2));
        supervisor.start_all().await.unwrap();

        let failing = wait_for_slot(&supervisor, "parallel-2", |s| {
            s.restart_count == 1 && s.status == SlotStatus::Running && s.generation == 2
        })
        .await;
        assert_eq!(failing.consecutive_errors, 0);
        for id in ["sequential", "parallel-1"] {
            let other = snapshot(&supervisor, id).await;
            assert_eq!(other.restart_count, 0, "{id}");
            assert_eq!(other.generation, 1, "{id}");
            assert_eq!(other.status, SlotStatus::Running, "{id}");
        }
        // start_all plus one sibling kill for the parallel restart
        assert_eq!(cleanup.calls(), 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_recoverable_lines_do_not_restart() {
        let dir = tool_dir();
        write_script(
            dir.path(),
            "chrome1.sh",
            &format!("echo '✗ Chrome error'\necho '✗ Chrome error'\n{IDLE}"),
        );
        let (supervisor, _cleanup) = pool(test_config(&dir, 1));
        supervisor.start_slot("parallel-1").await.unwrap();

        wait_for_slot(&supervisor, "parallel-1", |s| s.consecutive_errors == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let s = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(s.restart_count, 0);
        assert_eq!(s.status, SlotStatus::Running);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_line_restarts_immediately() {
        let dir = tool_dir();
        write_script(
            dir.path(),
            "chrome1.sh",
            &once_then_idle("  echo '✗ Không restart được Chrome'"),
        );
        let (supervisor, _cleanup) = pool(test_config(&dir, 1));
        supervisor.start_slot("parallel-1").await.unwrap();

        let s = wait_for_slot(&supervisor, "parallel-1", |s| {
            s.restart_count == 1 && s.status == SlotStatus::Running
        })
        .await;
        assert_eq!(s.consecutive_errors, 0);
        assert_eq!(s.auto_restart_streak, 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_exit_restarts() {
        let dir = tool_dir();
        write_script(dir.path(), "excel.sh", &once_then_idle("  exit 1"));
        let (supervisor, cleanup) = pool(test_config(&dir, 1));
        supervisor.start_slot("sequential").await.unwrap();

        wait_for_slot(&supervisor, "sequential", |s| {
            s.restart_count == 1 && s.status == SlotStatus::Running && s.generation == 2
        })
        .await;
        // sequential restarts never kill siblings
        assert_eq!(cleanup.calls(), 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_ceiling_leaves_slot_in_error() {
        let dir = tool_dir();
        write_script(dir.path(), "chrome1.sh", "exit 1\n");
        let mut config = test_config(&dir, 1);
        config.restart.max_attempts = Some(2);
        let (supervisor, _cleanup) = pool(config);
        supervisor.start_slot("parallel-1").await.unwrap();

        let s = wait_for_slot(&supervisor, "parallel-1", |s| s.status == SlotStatus::Error).await;
        assert_eq!(s.restart_count, 2);
        assert_eq!(s.generation, 3);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_suppresses_pending_restart() {
        let dir = tool_dir();
        write_script(dir.path(), "chrome1.sh", "exit 1\n");
        let mut config = test_config(&dir, 1);
        config.restart.delay = Duration::from_millis(300);
        config.restart.max_delay = Duration::from_millis(300);
        let (supervisor, _cleanup) = pool(config);
        supervisor.start_slot("parallel-1").await.unwrap();

        wait_for_slot(&supervisor, "parallel-1", |s| s.restart_count == 1).await;
        supervisor.shutdown().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let s = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(s.generation, 1);
        assert_ne!(s.status, SlotStatus::Running);
    }

    #[tokio::test]
    async fn test_operator_restart_kills_siblings_for_parallel_only() {
        let dir = tool_dir();
        let (supervisor, cleanup) = pool(test_config(&dir, 1));
        supervisor.start_all().await.unwrap();
        assert_eq!(cleanup.calls(), 1);

        supervisor.restart_slot("sequential").await.unwrap();
        assert_eq!(cleanup.calls(), 1);

        supervisor.restart_slot("parallel-1").await.unwrap();
        assert_eq!(cleanup.calls(), 2);

        let s = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(s.restart_count, 1);
        assert_eq!(s.auto_restart_streak, 0);
        assert_eq!(s.status, SlotStatus::Running);

        supervisor.restart_all().await.unwrap();
        assert!(supervisor.status().await.iter().all(|s| s.generation == 3));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_orphaned_output_does_not_restart_relaunched_worker() {
        let dir = tool_dir();
        // the first run leaves a child behind that writes a fatal line to
        // the inherited pipe after the worker has been replaced
        write_script(
            dir.path(),
            "chrome1.sh",
            &once_then_idle("  (sleep 0.6; echo 'Chrome attempt 3/3 failed') &"),
        );
        let (supervisor, _cleanup) = pool(test_config(&dir, 1));
        supervisor.start_slot("parallel-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.restart_slot("parallel-1").await.unwrap();
        let s = snapshot(&supervisor, "parallel-1").await;
        assert_eq!((s.generation, s.restart_count), (2, 1));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let s = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(s.generation, 2);
        assert_eq!(s.restart_count, 1);
        assert_eq!(s.status, SlotStatus::Running);
        assert_ne!(s.last_output_line.as_deref(), Some("Chrome attempt 3/3 failed"));

        supervisor.shutdown().await;
    }

    // =========================================================================
    // Scaling
    // =========================================================================

    #[tokio::test]
    async fn test_scale_monotonic_identity() {
        let dir = tool_dir();
        let mut config = test_config(&dir, 2);
        config.workers.sequential = false;
        let (supervisor, _cleanup) = pool(config);
        supervisor.start_all().await.unwrap();

        supervisor.scale_to(5).await.unwrap();
        let pid_before = snapshot(&supervisor, "parallel-4").await.pid;

        supervisor.scale_to(3).await.unwrap();
        let ids: Vec<_> = supervisor.status().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["parallel-1", "parallel-2", "parallel-3"]);

        supervisor.scale_to(5).await.unwrap();
        let status = supervisor.status().await;
        let ids: Vec<_> = status.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["parallel-1", "parallel-2", "parallel-3", "parallel-4", "parallel-5"]
        );
        // 4 and 5 are new slots, not the old ones brought back
        let fresh = snapshot(&supervisor, "parallel-4").await;
        assert_eq!(fresh.generation, 1);
        assert_eq!(fresh.restart_count, 0);
        assert_ne!(fresh.pid, pid_before);
        assert!(status.iter().all(|s| s.status == SlotStatus::Running));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_scale_out_of_range() {
        let dir = tool_dir();
        let (supervisor, _cleanup) = pool(test_config(&dir, 2));
        for n in [0, 11] {
            let err = supervisor.scale_to(n).await.unwrap_err();
            assert!(matches!(err, StagehandError::ScaleOutOfRange { requested, min: 1, max: 10 } if requested == n));
        }
        assert_eq!(supervisor.status().await.len(), 3);
    }

    #[tokio::test]
    async fn test_scale_down_releases_running_tasks() {
        let dir = tool_dir();
        let (supervisor, _cleanup) = pool(test_config(&dir, 3));
        supervisor.start_all().await.unwrap();

        supervisor.enqueue("AR47-0001", Stage::RenderImage).await;
        supervisor.enqueue("AR47-0002", Stage::RenderImage).await;
        supervisor.claim_for("parallel-1").await.unwrap().unwrap();
        let task = supervisor.claim_for("parallel-3").await.unwrap().unwrap();

        supervisor.scale_to(2).await.unwrap();
        let tasks = supervisor.tasks().await;
        let released = tasks.iter().find(|t| t.id == task.id).unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert!(released.assigned_slot.is_none());
        assert_eq!(released.retry_count, 0);
        assert_eq!(supervisor.queue_summary().await.running, 1);

        supervisor.shutdown().await;
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    #[tokio::test]
    async fn test_task_completion_counts_toward_slot() {
        let dir = tool_dir();
        let (supervisor, _cleanup) = pool(test_config(&dir, 1));

        assert!(supervisor.enqueue("AR47-0028", Stage::Document).await);
        assert!(supervisor.claim_for("parallel-1").await.unwrap().is_none());

        let task = supervisor.claim_for("sequential").await.unwrap().unwrap();
        supervisor.complete(task.id, true, None).await.unwrap();

        assert_eq!(snapshot(&supervisor, "sequential").await.completed_tasks, 1);
        let tasks = supervisor.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].stage, Stage::RenderImage);
        assert_eq!(tasks[0].status, TaskStatus::Pending);

        let render = supervisor.claim_for("parallel-1").await.unwrap().unwrap();
        supervisor
            .complete(render.id, false, Some("timeout".into()))
            .await
            .unwrap();
        assert_eq!(snapshot(&supervisor, "parallel-1").await.completed_tasks, 0);
    }

    #[tokio::test]
    async fn test_discovery_feeds_queue() {
        let dir = tool_dir();
        let projects = TempDir::new().unwrap();
        std::fs::create_dir(projects.path().join("AR47-0028")).unwrap();
        std::fs::create_dir(projects.path().join("KA2-0001")).unwrap();

        let mut config = test_config(&dir, 1);
        config.discovery.scan_interval = Duration::from_millis(50);
        let (supervisor, _cleanup) = pool(config);

        let source = Arc::new(DirectorySource::new(projects.path()).with_channel("AR47"));
        let handle = supervisor.spawn_discovery(source);

        for _ in 0..250 {
            if !supervisor.tasks().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // rescans do not duplicate
        tokio::time::sleep(Duration::from_millis(150)).await;
        let tasks = supervisor.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].project_code, "AR47-0028");
        assert_eq!(tasks[0].stage, Stage::Document);

        supervisor.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_detached_mode_runs_without_monitor() {
        let dir = tool_dir();
        write_script(dir.path(), "chrome1.sh", "echo 'Chrome attempt 3/3 failed'\nexec sleep 30\n");
        let mut config = test_config(&dir, 1);
        config.execution_mode = ExecutionMode::Detached;
        let (supervisor, _cleanup) = pool(config);

        supervisor.start_slot("parallel-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // no output stream, so the fatal line goes unseen
        let s = snapshot(&supervisor, "parallel-1").await;
        assert_eq!(s.status, SlotStatus::Running);
        assert_eq!(s.restart_count, 0);
        assert!(s.last_output_line.is_none());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_detached_exit_shows_stopped_in_status() {
        let dir = tool_dir();
        write_script(dir.path(), "chrome1.sh", "exit 0\n");
        let mut config = test_config(&dir, 1);
        config.execution_mode = ExecutionMode::Detached;
        let (supervisor, _cleanup) = pool(config);

        supervisor.start_slot("parallel-1").await.unwrap();
        let s = wait_for_slot(&supervisor, "parallel-1", |s| s.status == SlotStatus::Stopped).await;
        assert!(s.pid.is_none());
        assert_eq!(s.restart_count, 0);

        // the operator can start it again from what status shows
        supervisor.start_slot("parallel-1").await.unwrap();
        assert_eq!(snapshot(&supervisor, "parallel-1").await.generation, 2);

        supervisor.shutdown().await;
    }
}
