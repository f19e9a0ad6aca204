//! Worker slots.
//!
//! A [`WorkerSlot`] is a stable worker identity (`sequential`, `parallel-2`)
//! that owns at most one live [`ProcessHandle`]. Every spawn replaces the
//! handle and bumps the slot's generation, which lets a monitor attached to
//! an older handle notice that it has been superseded.
//!
//! State machine:
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING | ERROR
//! RUNNING -> RESTARTING -> STOPPED -> STARTING -> RUNNING
//! ERROR   -> RESTARTING            (operator restart only)
//! ```
//!
//! Start and stop serialize through the lock that owns the handle.

use crate::launcher::LaunchSpec;
use crate::process::{OutputStream, ProcessHandle};
use crate::restart::{RestartDecision, RestartOrigin, RestartPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::Result;
use stagehand_core::log_slot_event;
use stagehand_core::types::{SlotId, SlotStatus, WorkerKind};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, instrument};

/// Mutable counters and status of a slot.
#[derive(Debug, Default)]
struct SlotState {
    status: SlotStatus,
    started_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
    consecutive_errors: u32,
    restart_count: u32,
    auto_restart_streak: u32,
    completed_tasks: u64,
    last_output_line: Option<String>,
}

/// Point-in-time view of a slot for the console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub kind: WorkerKind,
    pub ordinal: Option<u32>,
    pub status: SlotStatus,
    pub pid: Option<u32>,
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub restart_count: u32,
    pub auto_restart_streak: u32,
    pub completed_tasks: u64,
    pub last_output_line: Option<String>,
}

impl SlotSnapshot {
    /// Time since the last successful start, while running.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status != SlotStatus::Running {
            return None;
        }
        self.started_at
            .and_then(|started| (now - started).to_std().ok())
    }
}

/// Result of polling a slot's process after its output closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPoll {
    /// Still running
    Alive,
    /// Exited on its own
    Exited(Option<ExitStatus>),
    /// The handle was stopped or replaced
    Superseded,
}

/// One logical worker.
#[derive(Debug)]
pub struct WorkerSlot {
    id: SlotId,
    kind: WorkerKind,
    ordinal: Option<u32>,
    process: Mutex<Option<ProcessHandle>>,
    state: Mutex<SlotState>,
    generation: AtomicU64,
    /// Output monitor of the current generation
    monitor: Mutex<Option<AbortHandle>>,
}

impl WorkerSlot {
    /// Create a stopped slot.
    pub fn new(kind: WorkerKind, ordinal: Option<u32>) -> Self {
        Self {
            id: kind.slot_id(ordinal),
            kind,
            ordinal,
            process: Mutex::new(None),
            state: Mutex::new(SlotState::default()),
            generation: AtomicU64::new(0),
            monitor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.ordinal
    }

    /// Number of spawns so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Launch the worker process.
    ///
    /// A slot whose process is alive is left untouched and `Ok(None)` is
    /// returned. Otherwise the new handle's output stream is returned along
    /// with the generation it belongs to (`None` stream in detached mode).
    #[instrument(level = "info", skip(self, spec), fields(slot = %self.id))]
    pub async fn start(&self, spec: &LaunchSpec) -> Result<Option<(u64, Option<OutputStream>)>> {
        let mut process = self.process.lock().await;
        if let Some(handle) = process.as_mut()
            && handle.is_alive()
        {
            debug!("worker already running, start is a no-op");
            return Ok(None);
        }

        self.state.lock().await.status = SlotStatus::Starting;

        let mut handle = match ProcessHandle::spawn(spec) {
            Ok(handle) => handle,
            Err(e) => {
                *process = None;
                let mut state = self.state.lock().await;
                state.status = SlotStatus::Error;
                state.pid = None;
                state.started_at = None;
                error!(error = %e, "worker failed to start");
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let output = handle.take_output();
        let pid = handle.pid();
        *process = Some(handle);

        {
            let mut state = self.state.lock().await;
            state.status = SlotStatus::Running;
            state.started_at = Some(Utc::now());
            state.pid = pid;
            state.consecutive_errors = 0;
        }

        log_slot_event!(self.id, "started", pid = ?pid, generation);
        Ok(Some((generation, output)))
    }

    /// Register the output monitor of `generation`.
    ///
    /// A monitor registered after its generation was replaced is aborted
    /// on the spot; otherwise it replaces (and aborts) any older one.
    pub async fn attach_monitor(&self, generation: u64, monitor: AbortHandle) {
        let mut current = self.monitor.lock().await;
        if self.generation() != generation {
            monitor.abort();
            return;
        }
        if let Some(old) = current.replace(monitor) {
            old.abort();
        }
    }

    /// Terminate the process, if any, and mark the slot stopped.
    ///
    /// The output monitor goes with the process, even when a descendant
    /// still holds the output pipe open.
    #[instrument(level = "info", skip(self), fields(slot = %self.id))]
    pub async fn stop(&self, grace: Duration) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }
        let mut process = self.process.lock().await;
        if let Some(mut handle) = process.take() {
            handle.terminate(grace).await;
            log_slot_event!(self.id, "stopped", pid = ?handle.pid());
        }

        let mut state = self.state.lock().await;
        state.status = SlotStatus::Stopped;
        state.pid = None;
        state.started_at = None;
    }

    /// Poll the process of `generation` after its output stream ended.
    pub async fn poll_exit(&self, generation: u64) -> ExitPoll {
        let mut process = self.process.lock().await;
        if self.generation() != generation {
            return ExitPoll::Superseded;
        }
        match process.as_mut() {
            None => ExitPoll::Superseded,
            Some(handle) => {
                if handle.is_alive() {
                    ExitPoll::Alive
                } else {
                    ExitPoll::Exited(handle.exit_status())
                }
            }
        }
    }

    /// Record that the process of `generation` exited on its own.
    ///
    /// Returns false, changing nothing, when the handle was replaced or a
    /// restart is already under way.
    pub async fn mark_exited(&self, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        let mut state = self.state.lock().await;
        if state.status == SlotStatus::Restarting {
            return false;
        }
        state.status = SlotStatus::Stopped;
        state.pid = None;
        state.started_at = None;
        true
    }

    /// Ask to begin a restart.
    ///
    /// Operator restarts always proceed and reset the automatic streak.
    /// Automatic restarts are skipped while one is in flight and refused,
    /// leaving the slot in ERROR, once the policy ceiling is reached.
    /// `restart_count` is bumped for every restart that proceeds.
    pub async fn begin_restart(
        &self,
        origin: RestartOrigin,
        policy: &RestartPolicy,
    ) -> RestartDecision {
        let mut state = self.state.lock().await;

        let delay = match origin {
            RestartOrigin::Operator => {
                state.auto_restart_streak = 0;
                policy.delay_for(0)
            }
            RestartOrigin::Automatic(reason) => {
                if state.status == SlotStatus::Restarting {
                    debug!(slot = %self.id, %reason, "restart already in progress");
                    return RestartDecision::AlreadyRestarting;
                }
                if !policy.allows(state.auto_restart_streak) {
                    state.status = SlotStatus::Error;
                    error!(
                        slot = %self.id,
                        %reason,
                        streak = state.auto_restart_streak,
                        "automatic restart limit reached, slot left in error"
                    );
                    return RestartDecision::CeilingReached;
                }
                state.auto_restart_streak += 1;
                policy.delay_for(state.auto_restart_streak)
            }
        };

        state.status = SlotStatus::Restarting;
        state.restart_count += 1;
        log_slot_event!(
            self.id,
            "restarting",
            restart_count = state.restart_count,
            streak = state.auto_restart_streak,
            delay = ?delay
        );
        RestartDecision::Proceed { delay }
    }

    /// Remember the latest output line.
    pub async fn record_output(&self, line: &str) {
        self.state.lock().await.last_output_line = Some(line.to_string());
    }

    /// Count one recoverable error; returns the new consecutive count.
    pub async fn note_recoverable_error(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.consecutive_errors += 1;
        state.consecutive_errors
    }

    /// Count one successfully completed task.
    pub async fn record_completed_task(&self) {
        self.state.lock().await.completed_tasks += 1;
    }

    pub async fn status(&self) -> SlotStatus {
        self.state.lock().await.status
    }

    /// Mark a live slot stopped when its process has exited unobserved.
    ///
    /// Detached workers have no monitor, so this is the only place their
    /// exit is noticed. Returns true if the slot changed.
    pub async fn reap_exited(&self) -> bool {
        let mut process = self.process.lock().await;
        let Some(handle) = process.as_mut() else {
            return false;
        };
        if handle.supports_output_stream() || handle.is_alive() {
            return false;
        }
        let exit = handle.exit_status();

        let mut state = self.state.lock().await;
        if !state.status.is_live() {
            return false;
        }
        state.status = SlotStatus::Stopped;
        state.pid = None;
        state.started_at = None;
        log_slot_event!(self.id, "exited", exit_code = ?exit.and_then(|s| s.code()));
        true
    }

    /// Whether the slot currently owns a live process.
    pub async fn is_process_alive(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(handle) => handle.is_alive(),
            None => false,
        }
    }

    pub async fn snapshot(&self) -> SlotSnapshot {
        let state = self.state.lock().await;
        SlotSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            ordinal: self.ordinal,
            status: state.status,
            pid: state.pid,
            generation: self.generation(),
            started_at: state.started_at,
            consecutive_errors: state.consecutive_errors,
            restart_count: state.restart_count,
            auto_restart_streak: state.auto_restart_streak,
            completed_tasks: state.completed_tasks,
            last_output_line: state.last_output_line.clone(),
        }
    }
}
