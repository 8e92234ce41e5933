//! Download coordinator.
//!
//! Drives one source to a verified file on disk. Remote sources go through the
//! supervised aria2 daemon: submit, wait for metadata when the source needs it,
//! poll progress, nudge a stalled transfer once with a pause/resume, then
//! verify the file. Local sources only need to exist.

use crate::aria2::{Aria2Client, DaemonSupervisor, RpcError, TransferOptions, TransferStatus};
use crate::progress::{Phase, ProgressRecord, ProgressReporter};
use crate::retry::{sleep_or_cancel, RetryPolicy};
use crate::stability::{verify_download, VerifyOutcome};
use crate::task::Source;
use relay_daemon_config::Config;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for the download phase
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The transfer could not be submitted or its metadata never resolved.
    #[error("Failed to start download: {0}")]
    Init(String),

    /// The transfer failed while running.
    #[error("Download failed: {0}")]
    Progress(String),

    #[error("Download verification failed: {0}")]
    Verification(String),

    #[error("Download did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Download made no progress for {0:?}, even after a pause/resume")]
    Stalled(Duration),

    #[error("Metadata not resolved within {0:?}")]
    MetadataTimeout(Duration),

    #[error("Source file not found: {0}")]
    NotFound(PathBuf),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

/// A verified input file.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// The file belongs to the user and must never be deleted.
    pub is_local: bool,
}

impl DownloadedFile {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub verify_window: Duration,
    pub verify_attempts: u32,
    /// Per-transfer options; `dir` is replaced for every download.
    pub transfer: TransferOptions,
}

impl DownloadSettings {
    pub fn from_config(config: &Config) -> Self {
        let download = &config.download;
        Self {
            poll_interval: Duration::from_millis(download.poll_interval_ms),
            stall_timeout: Duration::from_secs(download.stall_timeout_secs),
            metadata_timeout: Duration::from_secs(download.metadata_timeout_secs),
            download_timeout: Duration::from_secs(download.download_timeout_secs),
            verify_window: Duration::from_millis(download.verify_window_ms),
            verify_attempts: download.verify_attempts,
            transfer: TransferOptions::new(&config.paths.downloads_dir, download, &config.aria2),
        }
    }
}

/// Tracks byte-level progress of a transfer.
#[derive(Debug, Clone)]
pub struct StallDetector {
    timeout: Duration,
    last_sample: Option<(u64, u64)>,
    last_change: Instant,
}

impl StallDetector {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_sample: None,
            last_change: now,
        }
    }

    /// Record `(completed bytes, rate)`; true once neither has changed for the timeout.
    pub fn observe(&mut self, completed: u64, rate: u64, now: Instant) -> bool {
        let sample = (completed, rate);
        if self.last_sample != Some(sample) {
            self.last_sample = Some(sample);
            self.last_change = now;
            return false;
        }
        now.saturating_duration_since(self.last_change) >= self.timeout
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_sample = None;
        self.last_change = now;
    }
}

/// One remote transfer as the coordinator sees it.
struct Session<'a> {
    uri: &'a str,
    options: TransferOptions,
    gid: String,
    /// Supervisor generation the handle was issued under.
    generation: u64,
    resubmitted: bool,
    needs_metadata: bool,
    awaiting_metadata: bool,
    deadline: Instant,
}

pub struct DownloadCoordinator {
    supervisor: Arc<DaemonSupervisor>,
    settings: DownloadSettings,
    retry: RetryPolicy,
}

impl DownloadCoordinator {
    pub fn new(supervisor: Arc<DaemonSupervisor>, settings: DownloadSettings, retry: RetryPolicy) -> Self {
        Self {
            supervisor,
            settings,
            retry,
        }
    }

    pub fn from_config(supervisor: Arc<DaemonSupervisor>, config: &Config) -> Self {
        Self::new(
            supervisor,
            DownloadSettings::from_config(config),
            RetryPolicy::from_config(&config.retry),
        )
    }

    /// Bring `source` into `dest_dir` (local sources stay where they are).
    pub async fn download(
        &self,
        source: &Source,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<DownloadedFile, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match source {
            Source::Local(path) => self.local(path, progress).await,
            Source::Url(uri) | Source::Magnet(uri) => {
                self.remote(uri, source.requires_metadata(), dest_dir, cancel, progress)
                    .await
            }
        }
    }

    async fn local(&self, path: &Path, progress: &ProgressReporter) -> Result<DownloadedFile, DownloadError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(DownloadError::NotFound(path.to_path_buf())),
        };
        if meta.len() == 0 {
            return Err(DownloadError::Verification(format!("{} is empty", path.display())));
        }
        progress.report(ProgressRecord::from_bytes(Phase::Downloading, meta.len(), Some(meta.len()), 0));
        info!(path = %path.display(), size_bytes = meta.len(), "using local source");
        Ok(DownloadedFile {
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            is_local: true,
        })
    }

    async fn remote(
        &self,
        uri: &str,
        needs_metadata: bool,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<DownloadedFile, DownloadError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| DownloadError::Init(format!("cannot create {}: {}", dest_dir.display(), e)))?;

        let options = TransferOptions {
            dir: dest_dir.to_path_buf(),
            ..self.settings.transfer.clone()
        };
        let deadline = Instant::now() + self.settings.download_timeout;
        let generation = self.supervisor.generation();
        let gid = self
            .bounded(deadline, cancel, self.submit(uri, &options, cancel))
            .await?;
        info!(gid = %gid, uri, "download submitted");

        let mut session = Session {
            uri,
            options,
            gid,
            generation,
            resubmitted: false,
            needs_metadata,
            awaiting_metadata: needs_metadata,
            deadline,
        };

        let driven = {
            let drive = self.drive(&mut session, cancel, progress);
            self.bounded(deadline, cancel, drive).await
        };
        match driven {
            Ok(file) => {
                self.forget_result(&session.gid).await;
                Ok(file)
            }
            Err(err) => {
                warn!(gid = %session.gid, error = %err, "download failed, removing transfer");
                self.discard(&session.gid).await;
                Err(err)
            }
        }
    }

    /// Run `work` against the overall deadline and the cancellation token.
    /// Whatever `work` is waiting on (a poll, a verification pass, an RPC
    /// backoff) is dropped as soon as either fires.
    async fn bounded<T>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T, DownloadError>>,
    ) -> Result<T, DownloadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            outcome = timeout_at(deadline, work) => outcome
                .unwrap_or_else(|_| Err(DownloadError::Timeout(self.settings.download_timeout))),
        }
    }

    async fn drive(
        &self,
        session: &mut Session<'_>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<DownloadedFile, DownloadError> {
        let mut stall = StallDetector::new(self.settings.stall_timeout, Instant::now());
        let mut nudged = false;

        let finished = loop {
            if session.awaiting_metadata {
                self.resolve_metadata(session, cancel, progress).await?;
                stall.reset(Instant::now());
            }
            self.checkpoint(session, cancel)?;

            let status = self.poll_status(session, cancel).await?;
            if session.awaiting_metadata {
                // Resubmitted after a restart; the new handle needs resolving again.
                continue;
            }
            if status.has_failed() {
                return Err(DownloadError::Progress(status.failure_reason()));
            }
            progress.report(ProgressRecord::from_bytes(
                Phase::Downloading,
                status.completed_length,
                status.total(),
                status.download_speed,
            ));
            if status.is_complete() {
                break status;
            }

            let now = Instant::now();
            if stall.observe(status.completed_length, status.download_speed, now) {
                if nudged {
                    return Err(DownloadError::Stalled(self.settings.stall_timeout));
                }
                warn!(gid = %session.gid, completed = status.completed_length, "download stalled, pausing and resuming");
                self.nudge(&session.gid, cancel).await?;
                nudged = true;
                stall.reset(Instant::now());
            }

            self.pause(cancel).await?;
        };

        let path = finished
            .primary_file()
            .map(|p| if p.is_absolute() { p } else { session.options.dir.join(p) })
            .ok_or_else(|| DownloadError::Verification("daemon reported no output file".to_string()))?;

        progress.report(ProgressRecord::started(Phase::Verifying));
        let outcome = verify_download(
            &path,
            self.settings.verify_window,
            self.settings.verify_attempts,
            cancel,
        )
        .await
        .map_err(|_| DownloadError::Cancelled)?;
        match outcome {
            VerifyOutcome::Verified { size } => {
                info!(gid = %session.gid, path = %path.display(), size_bytes = size, "download verified");
                Ok(DownloadedFile {
                    path,
                    size_bytes: size,
                    is_local: false,
                })
            }
            other => Err(DownloadError::Verification(format!("{}: {:?}", path.display(), other))),
        }
    }

    /// Wait for the daemon to turn a metadata transfer into the real one.
    async fn resolve_metadata(
        &self,
        session: &mut Session<'_>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<(), DownloadError> {
        progress.report(ProgressRecord::started(Phase::ResolvingMetadata));
        let limit = self.settings.metadata_timeout;
        let metadata_deadline = Instant::now() + limit;
        loop {
            self.checkpoint(session, cancel)?;
            let status = self.poll_status(session, cancel).await?;
            if let Some(next) = status.followed_by.first() {
                info!(gid = %session.gid, follow_up = %next, "metadata resolved");
                let finished = std::mem::replace(&mut session.gid, next.clone());
                self.forget_result(&finished).await;
                session.awaiting_metadata = false;
                return Ok(());
            }
            if status.has_failed() {
                return Err(DownloadError::Init(format!(
                    "metadata resolution failed: {}",
                    status.failure_reason()
                )));
            }
            if Instant::now() >= metadata_deadline {
                return Err(DownloadError::MetadataTimeout(limit));
            }
            self.pause(cancel).await?;
        }
    }

    fn checkpoint(&self, session: &Session<'_>, cancel: &CancellationToken) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if Instant::now() >= session.deadline {
            return Err(DownloadError::Timeout(self.settings.download_timeout));
        }
        Ok(())
    }

    /// Sleep one polling interval unless cancelled first.
    async fn pause(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        sleep_or_cancel(self.settings.poll_interval, cancel)
            .await
            .map_err(|_| DownloadError::Cancelled)
    }

    async fn submit(
        &self,
        uri: &str,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let uri = uri.to_string();
        let options = options.clone();
        self.rpc("aria2.addUri", cancel, move |client| {
            let uri = uri.clone();
            let options = options.clone();
            async move { client.add_uri(&uri, &options).await }
        })
        .await
        .map_err(rpc_failure(DownloadError::Init))
    }

    /// Status of the current handle. A handle the daemon forgot across a
    /// restart is resubmitted once; `continue` picks up the bytes on disk.
    async fn poll_status(
        &self,
        session: &mut Session<'_>,
        cancel: &CancellationToken,
    ) -> Result<TransferStatus, DownloadError> {
        let first = self.tell_status(&session.gid, cancel).await;
        let err = match first {
            Ok(status) => return Ok(status),
            Err(err) => err,
        };
        let restarted = self.supervisor.generation() != session.generation;
        if !(err.is_unknown_handle() && restarted && !session.resubmitted) {
            return Err(rpc_failure(DownloadError::Progress)(err));
        }

        warn!(gid = %session.gid, "transfer unknown after daemon restart, resubmitting");
        session.resubmitted = true;
        session.generation = self.supervisor.generation();
        session.gid = self.submit(session.uri, &session.options, cancel).await?;
        session.awaiting_metadata = session.needs_metadata;
        self.tell_status(&session.gid, cancel)
            .await
            .map_err(rpc_failure(DownloadError::Progress))
    }

    async fn tell_status(&self, gid: &str, cancel: &CancellationToken) -> Result<TransferStatus, RpcError> {
        let gid = gid.to_string();
        self.rpc("aria2.tellStatus", cancel, move |client| {
            let gid = gid.clone();
            async move { client.tell_status(&gid).await }
        })
        .await
    }

    async fn nudge(&self, gid: &str, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let owned = gid.to_string();
        self.rpc("aria2.forcePause", cancel, move |client| {
            let gid = owned.clone();
            async move { client.pause(&gid).await }
        })
        .await
        .map_err(rpc_failure(DownloadError::Progress))?;
        let owned = gid.to_string();
        self.rpc("aria2.unpause", cancel, move |client| {
            let gid = owned.clone();
            async move { client.unpause(&gid).await }
        })
        .await
        .map_err(rpc_failure(DownloadError::Progress))
    }

    /// Best-effort removal of a finished transfer's result.
    async fn forget_result(&self, gid: &str) {
        let Ok(client) = self.supervisor.client() else {
            return;
        };
        if let Err(e) = client.remove_download_result(gid).await {
            debug!(gid, error = %e, "removeDownloadResult failed");
        }
    }

    /// Best-effort removal of a transfer and its result from the daemon.
    async fn discard(&self, gid: &str) {
        let Ok(client) = self.supervisor.client() else {
            return;
        };
        if let Err(e) = client.remove(gid).await {
            debug!(gid, error = %e, "remove failed");
        }
        if let Err(e) = client.remove_download_result(gid).await {
            debug!(gid, error = %e, "removeDownloadResult failed");
        }
    }

    /// Run one RPC through the retry policy. A daemon-side error is only
    /// trusted while the daemon passes a health check; otherwise the daemon
    /// is restarted and the call tried once more on the new instance.
    async fn rpc<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, op: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<Aria2Client>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let generation = self.supervisor.generation();
        let err = match self.call(label, cancel, &op).await {
            Err(err) if err.is_daemon_fault() => err,
            other => return other,
        };
        if self.supervisor.ensure_healthy().await {
            return Err(err);
        }
        warn!(operation = label, error = %err, "error from an unhealthy download daemon, restarting");
        if !self.restart(generation).await {
            return Err(err);
        }
        self.call(label, cancel, &op).await
    }

    /// Transient failures are retried with backoff. Before the first retry
    /// the daemon's health is checked and a restart requested if it is down.
    async fn call<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, op: &F) -> Result<T, RpcError>
    where
        F: Fn(Arc<Aria2Client>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let outcome = self
            .retry
            .run_cancellable(label, cancel, RpcError::is_transient, |attempt| async move {
                if attempt == 2 {
                    self.reconnect().await;
                }
                let client = self
                    .supervisor
                    .client()
                    .map_err(|e| RpcError::Transport(e.to_string()))?;
                op(client).await
            })
            .await?;
        Ok(outcome.result)
    }

    async fn reconnect(&self) {
        let generation = self.supervisor.generation();
        if !self.supervisor.ensure_healthy().await {
            self.restart(generation).await;
        }
    }

    /// Restart on a task of its own so that a caller dropped by cancellation
    /// or the deadline cannot leave the supervisor halfway through.
    async fn restart(&self, generation: u64) -> bool {
        let supervisor = Arc::clone(&self.supervisor);
        let restart = tokio::spawn(async move { supervisor.restart(generation).await.map(|_| ()) });
        match restart.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "download daemon restart failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "download daemon restart task failed");
                false
            }
        }
    }
}

/// Map an RPC failure into the phase error `make` builds, keeping cancellation.
fn rpc_failure(make: fn(String) -> DownloadError) -> impl Fn(RpcError) -> DownloadError {
    move |err| match err {
        RpcError::Cancelled => DownloadError::Cancelled,
        other => make(other.to_string()),
    }
}
