//! Worker pool supervisor.
//!
//! The [`Supervisor`] owns the slot registry and the task queue and is the
//! single command surface used by the console. It is cheap to clone; clones
//! share the same pool.
//!
//! ```text
//!            ┌──────────────┐
//!  console ─▶│  Supervisor  │◀── discovery scan loop
//!            └──┬────────┬──┘
//!               │        │
//!       registry│        │queue
//!               ▼        ▼
//!        WorkerSlot…   TaskQueue
//!               │
//!               ├─▶ ProcessHandle ─▶ OutputStream ─▶ HealthMonitor
//!               │                                        │
//!               └──────────── restart sequence ◀─────────┘
//! ```
//!
//! Restart sequence: stop the slot, return its running task to the queue,
//! kill sibling processes (parallel slots only), wait the restart delay,
//! then relaunch unless the pool is shutting down or the slot was scaled
//! away in the meantime.

use crate::classifier::ErrorClassifier;
use crate::cleanup::SiblingCleanup;
use crate::health::{HealthMonitor, RestartRequester};
use crate::launcher::LaunchSpec;
use crate::process::OutputStream;
use crate::restart::{RestartDecision, RestartOrigin, RestartPolicy, RestartReason, ShutdownFlag};
use crate::slot::{SlotSnapshot, WorkerSlot};
use async_trait::async_trait;
use futures_util::future::join_all;
use stagehand_core::types::{ProjectCode, SlotStatus, Stage, WorkerKind};
use stagehand_core::{Result, StagehandConfig, StagehandError};
use stagehand_queue::{CompletionOutcome, ProjectSource, QueueSummary, Task, TaskId, TaskQueue};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Slots by kind. Parallel ordinals are always `1..=len`.
#[derive(Debug, Default)]
struct Registry {
    sequential: Option<Arc<WorkerSlot>>,
    parallel: BTreeMap<u32, Arc<WorkerSlot>>,
}

impl Registry {
    fn all(&self) -> Vec<Arc<WorkerSlot>> {
        self.sequential
            .iter()
            .chain(self.parallel.values())
            .cloned()
            .collect()
    }

    fn find(&self, slot_id: &str) -> Option<Arc<WorkerSlot>> {
        self.all().into_iter().find(|s| s.id() == slot_id)
    }

    fn parallel_count(&self) -> u32 {
        self.parallel.len() as u32
    }

    fn contains(&self, slot: &Arc<WorkerSlot>) -> bool {
        self.all().iter().any(|s| Arc::ptr_eq(s, slot))
    }
}

#[derive(Debug)]
struct Inner {
    config: StagehandConfig,
    policy: RestartPolicy,
    health: HealthMonitor,
    cleanup: Arc<dyn SiblingCleanup>,
    registry: Mutex<Registry>,
    queue: Mutex<TaskQueue>,
    shutdown: ShutdownFlag,
}

/// Elastic pool of worker slots plus the pipeline task queue.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build the pool from configuration. No process is started.
    pub fn new(config: StagehandConfig, cleanup: Arc<dyn SiblingCleanup>) -> Result<Self> {
        config.validate()?;
        let classifier = ErrorClassifier::from_config(&config.health)?;
        let health = HealthMonitor::new(Arc::new(classifier), config.health.error_threshold);

        let mut registry = Registry::default();
        if config.workers.sequential {
            registry.sequential = Some(Arc::new(WorkerSlot::new(WorkerKind::Sequential, None)));
        }
        for ordinal in 1..=config.workers.parallel {
            registry
                .parallel
                .insert(ordinal, Arc::new(WorkerSlot::new(WorkerKind::Parallel, Some(ordinal))));
        }

        info!(
            sequential = config.workers.sequential,
            parallel = config.workers.parallel,
            cleanup = cleanup.name(),
            mode = ?config.execution_mode,
            "supervisor created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                policy: RestartPolicy::from_config(&config.restart),
                queue: Mutex::new(TaskQueue::new(config.scheduler.max_task_retries)),
                health,
                cleanup,
                registry: Mutex::new(registry),
                shutdown: ShutdownFlag::new(),
                config,
            }),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_set()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        self.inner.shutdown.wait().await;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(StagehandError::ShuttingDown);
        }
        Ok(())
    }

    async fn slot(&self, slot_id: &str) -> Result<Arc<WorkerSlot>> {
        self.inner
            .registry
            .lock()
            .await
            .find(slot_id)
            .ok_or_else(|| StagehandError::slot_not_found(slot_id))
    }

    async fn slots(&self) -> Vec<Arc<WorkerSlot>> {
        self.inner.registry.lock().await.all()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Kill siblings, then start the sequential slot and each parallel slot,
    /// pausing between launches. Start failures are logged, not returned.
    #[instrument(level = "info", skip(self))]
    pub async fn start_all(&self) -> Result<()> {
        self.ensure_running()?;
        self.kill_all().await;

        let slots = self.slots().await;
        let stagger = self.inner.config.timing.start_stagger;
        for (i, slot) in slots.iter().enumerate() {
            if i > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.launch(slot).await {
                error!(slot = %slot.id(), error = %e, "failed to start worker");
            }
        }

        info!(slots = slots.len(), "worker pool started");
        Ok(())
    }

    /// Start one slot. Starting a running slot is a no-op.
    pub async fn start_slot(&self, slot_id: &str) -> Result<()> {
        self.ensure_running()?;
        let slot = self.slot(slot_id).await?;
        self.launch(&slot).await
    }

    /// Stop one slot and return its running task to the queue.
    pub async fn stop_slot(&self, slot_id: &str) -> Result<()> {
        let slot = self.slot(slot_id).await?;
        self.stop_and_release(&slot).await;
        Ok(())
    }

    /// Operator restart of one slot. Waits for the relaunch.
    #[instrument(level = "info", skip(self))]
    pub async fn restart_slot(&self, slot_id: &str) -> Result<()> {
        self.ensure_running()?;
        let slot = self.slot(slot_id).await?;
        match slot
            .begin_restart(RestartOrigin::Operator, &self.inner.policy)
            .await
        {
            RestartDecision::Proceed { delay } => self.run_restart(&slot, delay).await,
            other => Err(StagehandError::internal(format!(
                "operator restart of {slot_id} refused: {other:?}"
            ))),
        }
    }

    /// Operator restart of every slot, concurrently.
    pub async fn restart_all(&self) -> Result<()> {
        self.ensure_running()?;
        let slots = self.slots().await;
        let results = join_all(slots.iter().map(|slot| self.restart_slot(slot.id()))).await;
        for (slot, result) in slots.iter().zip(results) {
            if let Err(e) = result {
                error!(slot = %slot.id(), error = %e, "restart failed");
            }
        }
        Ok(())
    }

    /// Resize the parallel pool to `n` slots.
    ///
    /// Growing creates and starts ordinals `current+1..=n`. Shrinking stops
    /// and removes the highest ordinals without draining; their running
    /// tasks go back to the queue.
    #[instrument(level = "info", skip(self))]
    pub async fn scale_to(&self, n: u32) -> Result<()> {
        self.ensure_running()?;
        let workers = &self.inner.config.workers;
        if n < workers.min_parallel || n > workers.max_parallel {
            return Err(StagehandError::ScaleOutOfRange {
                requested: n,
                min: workers.min_parallel,
                max: workers.max_parallel,
            });
        }

        let (added, removed) = {
            let mut registry = self.inner.registry.lock().await;
            let current = registry.parallel_count();
            let mut added = Vec::new();
            for ordinal in current + 1..=n {
                let slot = Arc::new(WorkerSlot::new(WorkerKind::Parallel, Some(ordinal)));
                registry.parallel.insert(ordinal, slot.clone());
                added.push(slot);
            }
            let removed: Vec<_> = registry
                .parallel
                .split_off(&(n + 1))
                .into_values()
                .collect();
            (added, removed)
        };

        for slot in &removed {
            warn!(slot = %slot.id(), "removing worker without draining");
            self.stop_and_release(slot).await;
        }

        let stagger = self.inner.config.timing.start_stagger;
        for (i, slot) in added.iter().enumerate() {
            if i > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            if let Err(e) = self.launch(slot).await {
                error!(slot = %slot.id(), error = %e, "failed to start worker");
            }
        }

        info!(parallel = n, added = added.len(), removed = removed.len(), "pool scaled");
        Ok(())
    }

    /// Kill the sibling-process pool and wait for the OS to settle.
    pub async fn kill_all(&self) {
        self.inner.cleanup.kill_siblings().await;
        let settle = self.inner.config.cleanup.settle;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
    }

    /// Stop everything. Later calls are no-ops.
    #[instrument(level = "info", skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.shutdown.trigger() {
            debug!("shutdown already requested");
            return;
        }
        info!("shutting down worker pool");

        let slots = self.slots().await;
        join_all(slots.iter().map(|slot| self.stop_and_release(slot))).await;
        self.kill_all().await;

        info!("worker pool stopped");
    }

    /// Snapshots of every slot, sequential first, parallel by ordinal.
    ///
    /// Detached workers that exited since the last call show as stopped.
    pub async fn status(&self) -> Vec<SlotSnapshot> {
        let slots = self.slots().await;
        join_all(slots.iter().map(|slot| async move {
            slot.reap_exited().await;
            slot.snapshot().await
        }))
        .await
    }

    // =========================================================================
    // Task queue
    // =========================================================================

    /// Enqueue `code` at `stage`; false if nothing changed.
    pub async fn enqueue(&self, code: impl Into<ProjectCode>, stage: Stage) -> bool {
        self.inner.queue.lock().await.enqueue(code, stage)
    }

    /// Claim the next task for a slot, according to the slot's kind.
    pub async fn claim_for(&self, slot_id: &str) -> Result<Option<Task>> {
        let slot = self.slot(slot_id).await?;
        Ok(self.inner.queue.lock().await.claim(slot.kind(), slot.id()))
    }

    /// Report a task result. Success counts toward the slot's completed tasks.
    pub async fn complete(
        &self,
        task_id: TaskId,
        success: bool,
        error: Option<String>,
    ) -> Result<CompletionOutcome> {
        let (outcome, slot_id) = {
            let mut queue = self.inner.queue.lock().await;
            let slot_id = queue.get(task_id).and_then(|t| t.assigned_slot.clone());
            (queue.complete(task_id, success, error)?, slot_id)
        };

        if success
            && let Some(slot_id) = slot_id
            && let Ok(slot) = self.slot(&slot_id).await
        {
            slot.record_completed_task().await;
        }
        Ok(outcome)
    }

    /// Open tasks in queue order.
    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.queue.lock().await.snapshot()
    }

    pub async fn queue_summary(&self) -> QueueSummary {
        self.inner.queue.lock().await.summary()
    }

    /// Periodically scan `source` and enqueue what it reports.
    pub fn spawn_discovery(&self, source: Arc<dyn ProjectSource>) -> JoinHandle<()> {
        let this = self.clone();
        let interval = self.inner.config.discovery.scan_interval;
        tokio::spawn(async move {
            info!(source = source.name(), interval = ?interval, "project discovery started");
            loop {
                if this.is_shutting_down() {
                    break;
                }
                match source.scan().await {
                    Ok(found) => {
                        let mut queue = this.inner.queue.lock().await;
                        let added = found
                            .into_iter()
                            .filter(|(code, stage)| queue.enqueue(code.clone(), *stage))
                            .count();
                        if added > 0 {
                            info!(added, "new projects queued");
                        }
                    }
                    Err(e) => warn!(source = source.name(), error = %e, "project scan failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = this.inner.shutdown.wait() => break,
                }
            }
            debug!("project discovery stopped");
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Start a slot with a freshly built spec and attach its monitor.
    async fn launch(&self, slot: &Arc<WorkerSlot>) -> Result<()> {
        let total = self.inner.registry.lock().await.parallel_count();
        let spec = LaunchSpec::for_slot(&self.inner.config, slot.kind(), slot.ordinal(), total);

        match slot.start(&spec).await? {
            Some((generation, Some(output))) => {
                let monitor = self.spawn_monitor(slot.clone(), generation, output);
                slot.attach_monitor(generation, monitor.abort_handle()).await;
            }
            Some((_, None)) => {
                debug!(slot = %slot.id(), "detached worker, output monitoring disabled");
            }
            None => {}
        }
        Ok(())
    }

    async fn stop_and_release(&self, slot: &Arc<WorkerSlot>) {
        slot.stop(self.inner.config.timing.grace_timeout).await;
        self.inner.queue.lock().await.release_slot(slot.id());
    }

    fn spawn_monitor(
        &self,
        slot: Arc<WorkerSlot>,
        generation: u64,
        output: OutputStream,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let exit_poll = self.inner.config.timing.exit_poll;
        tokio::spawn(async move {
            let monitor = this.inner.health.clone();
            monitor.run(&this, slot, generation, output, exit_poll).await;
        })
    }

    fn spawn_restart(&self, slot: Arc<WorkerSlot>, delay: Duration) {
        let this = self.clone();
        let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            if let Err(e) = this.run_restart(&slot, delay).await {
                error!(slot = %slot.id(), error = %e, "automatic restart failed");
            }
        });
        tokio::spawn(task);
    }

    /// Stop, clean up, wait, relaunch.
    async fn run_restart(&self, slot: &Arc<WorkerSlot>, delay: Duration) -> Result<()> {
        self.stop_and_release(slot).await;

        if self.inner.policy.kill_siblings && slot.kind() == WorkerKind::Parallel {
            self.inner.cleanup.kill_siblings().await;
        }

        tokio::time::sleep(delay).await;

        if self.is_shutting_down() {
            info!(slot = %slot.id(), "shutdown requested, not relaunching");
            return Ok(());
        }
        if !self.inner.registry.lock().await.contains(slot) {
            info!(slot = %slot.id(), "slot removed by scaling, not relaunching");
            return Ok(());
        }

        self.launch(slot).await?;
        if self.is_shutting_down() {
            // raced with shutdown after the check above
            slot.stop(self.inner.config.timing.grace_timeout).await;
            return Ok(());
        }
        if slot.status().await == SlotStatus::Running {
            info!(slot = %slot.id(), "worker restarted");
        }
        Ok(())
    }
}

#[async_trait]
impl RestartRequester for Supervisor {
    async fn request_restart(&self, slot: &Arc<WorkerSlot>, reason: RestartReason) {
        if self.is_shutting_down() {
            return;
        }
        match slot
            .begin_restart(RestartOrigin::Automatic(reason), &self.inner.policy)
            .await
        {
            RestartDecision::Proceed { delay } => {
                warn!(slot = %slot.id(), %reason, delay = ?delay, "scheduling automatic restart");
                self.spawn_restart(slot.clone(), delay);
            }
            RestartDecision::AlreadyRestarting => {
                debug!(slot = %slot.id(), %reason, "restart already scheduled");
            }
            RestartDecision::CeilingReached => {}
        }
    }

    fn is_shutting_down(&self) -> bool {
        Supervisor::is_shutting_down(self)
    }
}
