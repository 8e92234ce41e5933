//! Task queue and admission loop.
//!
//! Tasks wait in a FIFO queue and are admitted one at a time. While a task runs
//! the scheduler forwards its progress to the [`ProgressSink`], mirrors its
//! state into the shared status snapshot and watches for stalls. A stall is
//! only flagged; the phase's own timeouts decide whether the task fails.

use crate::metrics::{ActiveTaskStatus, SharedStatus};
use crate::pipeline::{self, PhaseExecutors, PipelineContext};
use crate::progress::{ProgressEvent, ProgressRecord, ProgressReporter, ProgressSink};
use crate::task::{current_timestamp_ms, Task, TaskId, TaskReport, TaskStatus};
use relay_daemon_config::Config;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a task was not queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("task requests no quality profiles")]
    NoProfiles,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Watchdog timing.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub stall_threshold: Duration,
    pub watchdog_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stall_threshold: Duration::from_secs(config.scheduler.stall_threshold_secs),
            watchdog_interval: Duration::from_secs(config.scheduler.watchdog_interval_secs),
        }
    }
}

/// What the scheduler knows about the task in the pipeline.
struct ActiveEntry {
    id: TaskId,
    source: String,
    status: TaskStatus,
    cancel: CancellationToken,
    last_record: Option<ProgressRecord>,
    /// Last time the phase or byte count moved.
    last_progress: Instant,
    last_progress_unix_ms: i64,
    stalled: bool,
}

impl ActiveEntry {
    fn new(task: &Task) -> Self {
        Self {
            id: task.id,
            source: task.source.display_name(),
            status: task.status().clone(),
            cancel: task.cancel_token(),
            last_record: None,
            last_progress: Instant::now(),
            last_progress_unix_ms: current_timestamp_ms(),
            stalled: false,
        }
    }

    fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
        self.last_progress_unix_ms = current_timestamp_ms();
        if self.stalled {
            info!(task_id = %self.id, "progress resumed");
            self.stalled = false;
        }
    }

    /// Repeated records with the same phase and byte count are not progress.
    fn observe(&mut self, record: ProgressRecord) {
        let moved = match &self.last_record {
            Some(prev) => prev.phase != record.phase || prev.bytes_done != record.bytes_done,
            None => true,
        };
        if moved {
            self.mark_progress();
        }
        self.last_record = Some(record);
    }

    fn to_status(&self) -> ActiveTaskStatus {
        let record = self.last_record.as_ref();
        ActiveTaskStatus {
            id: self.id.to_string(),
            source: self.source.clone(),
            status: self.status.to_string(),
            phase: record.map(|r| r.phase.to_string()),
            percent: record.map(|r| r.percent).unwrap_or(0.0),
            rate_bytes_per_sec: record.map(|r| r.rate).unwrap_or(0),
            eta_secs: record.and_then(|r| r.eta).map(|d| d.as_secs()),
            stalled: self.stalled,
            last_progress_unix_ms: self.last_progress_unix_ms,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Task>,
    active: Option<ActiveEntry>,
}

/// Single-slot task scheduler.
pub struct Scheduler {
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
    ctx: PipelineContext,
    settings: SchedulerSettings,
    sink: Arc<dyn ProgressSink>,
    status: SharedStatus,
}

impl Scheduler {
    pub fn new(
        ctx: PipelineContext,
        settings: SchedulerSettings,
        sink: Arc<dyn ProgressSink>,
        status: SharedStatus,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            ctx,
            settings,
            sink,
            status,
        }
    }

    pub fn from_config(config: &Config, sink: Arc<dyn ProgressSink>, status: SharedStatus) -> Self {
        Self::new(
            PipelineContext::from_config(config),
            SchedulerSettings::from_config(config),
            sink,
            status,
        )
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a task to the queue.
    pub async fn enqueue(&self, task: Task) -> Result<TaskId, EnqueueError> {
        if task.profiles.is_empty() {
            return Err(EnqueueError::NoProfiles);
        }
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::ShuttingDown);
        }
        let id = task.id;
        let position = {
            let mut state = self.lock();
            state.queue.push_back(task);
            state.queue.len() + usize::from(state.active.is_some())
        };
        info!(task_id = %id, position, "task queued");
        self.notify.notify_one();
        self.publish().await;
        Ok(id)
    }

    /// Request cancellation. Returns false if the task is unknown or already
    /// terminal. A queued task is finished as cancelled right away; the active
    /// task stops at its next cancellation check.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let queued = {
            let mut state = self.lock();
            if let Some(active) = state.active.as_ref().filter(|a| a.id == id) {
                if active.status.is_terminal() || active.cancel.is_cancelled() {
                    return false;
                }
                active.cancel.cancel();
                info!(task_id = %id, "cancellation requested for active task");
                return true;
            }
            match state.queue.iter().position(|t| t.id == id) {
                Some(index) => state.queue.remove(index),
                None => return false,
            }
        };
        let Some(task) = queued else {
            return false;
        };
        self.finish_queued(task, "cancelled while queued").await;
        true
    }

    /// Report a task that never left the queue as cancelled.
    async fn finish_queued(&self, mut task: Task, reason: &str) -> TaskReport {
        let id = task.id;
        task.cancel_token().cancel();
        if let Err(err) = task.transition(TaskStatus::Cancelled) {
            warn!(task_id = %id, error = %err, "could not cancel queued task");
        }
        let report = TaskReport::from_task(&task, Vec::new(), Some(reason.to_string()));
        info!(task_id = %id, reason, "queued task cancelled");
        self.complete(&report).await;
        report
    }

    /// Cancel everything still queued once shutdown has been requested.
    async fn drain_queue(&self) -> Vec<TaskReport> {
        let queued: Vec<Task> = self.lock().queue.drain(..).collect();
        if !queued.is_empty() {
            warn!(count = queued.len(), "cancelling queued tasks on shutdown");
        }
        let mut reports = Vec::with_capacity(queued.len());
        for task in queued {
            reports.push(self.finish_queued(task, "cancelled by shutdown").await);
        }
        reports
    }

    /// `Some(0)` for the active task, `Some(n)` for the n-th queued task.
    pub fn position(&self, id: TaskId) -> Option<usize> {
        let state = self.lock();
        if state.active.as_ref().is_some_and(|a| a.id == id) {
            return Some(0);
        }
        state.queue.iter().position(|t| t.id == id).map(|i| i + 1)
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Stop admitting tasks and cancel the active one.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(active) = &self.lock().active {
            active.cancel.cancel();
        }
        self.notify.notify_one();
    }

    /// Admission loop; returns after [`Scheduler::shutdown`].
    pub async fn run(&self, executors: &PhaseExecutors) {
        info!("scheduler started");
        while !self.shutdown.is_cancelled() {
            if self.run_once(executors).await.is_none() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
        self.drain_queue().await;
        info!("scheduler stopped");
    }

    /// Run queued tasks until the queue is empty (or shutdown). Tasks still
    /// queued at shutdown are reported as cancelled.
    pub async fn run_until_idle(&self, executors: &PhaseExecutors) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        while !self.shutdown.is_cancelled() {
            match self.run_once(executors).await {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        if self.shutdown.is_cancelled() {
            reports.extend(self.drain_queue().await);
        }
        reports
    }

    /// Admit the next queued task and drive it to a terminal state.
    pub async fn run_once(&self, executors: &PhaseExecutors) -> Option<TaskReport> {
        let mut task = {
            let mut state = self.lock();
            let task = state.queue.pop_front()?;
            state.active = Some(ActiveEntry::new(&task));
            task
        };
        let id = task.id;
        info!(task_id = %id, source = %task.source.display_name(), profiles = ?task.profiles, "task admitted");
        self.publish().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(id, tx);
        let hook = |status: &TaskStatus| self.on_status(id, status);

        let report = {
            let pipeline = pipeline::run_task(&mut task, executors, &self.ctx, &reporter, &hook);
            tokio::pin!(pipeline);
            let mut watchdog = tokio::time::interval(self.settings.watchdog_interval);
            watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    report = &mut pipeline => break report,
                    Some(event) = rx.recv() => self.forward(event).await,
                    _ = watchdog.tick() => self.check_stall().await,
                }
            }
        };
        drop(reporter);
        while let Ok(event) = rx.try_recv() {
            self.forward(event).await;
        }

        self.lock().active = None;
        self.complete(&report).await;
        Some(report)
    }

    fn on_status(&self, id: TaskId, status: &TaskStatus) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut().filter(|a| a.id == id) {
            active.status = status.clone();
            active.mark_progress();
        }
    }

    async fn forward(&self, event: ProgressEvent) {
        self.sink.progress(event.task_id, &event.record).await;
        {
            let mut state = self.lock();
            if let Some(active) = state.active.as_mut().filter(|a| a.id == event.task_id) {
                active.observe(event.record);
            }
        }
        self.publish().await;
    }

    /// Watchdog tick: flag the active task once progress has been silent for
    /// the stall threshold.
    async fn check_stall(&self) {
        {
            let mut state = self.lock();
            if let Some(active) = state.active.as_mut() {
                let silent = active.last_progress.elapsed();
                if !active.stalled && silent >= self.settings.stall_threshold {
                    active.stalled = true;
                    warn!(
                        task_id = %active.id,
                        status = %active.status,
                        phase = ?active.last_record.as_ref().map(|r| r.phase),
                        silent_secs = silent.as_secs(),
                        "no progress observed, task flagged as stalled"
                    );
                }
            }
        }
        self.publish().await;
    }

    async fn complete(&self, report: &TaskReport) {
        self.sink.finished(report).await;
        self.status.write().await.record_finished(report);
        self.publish().await;
    }

    /// Copy queue and active task state into the shared snapshot.
    async fn publish(&self) {
        let (queue_len, active) = {
            let state = self.lock();
            (state.queue.len(), state.active.as_ref().map(ActiveEntry::to_status))
        };
        let mut snapshot = self.status.write().await;
        snapshot.queue_len = queue_len;
        snapshot.active = active;
        snapshot.timestamp_unix_ms = current_timestamp_ms();
    }
}
