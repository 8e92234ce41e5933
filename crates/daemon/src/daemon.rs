//! Daemon startup, main loop and shutdown
//!
//! Wires the configuration into the download daemon supervisor, the phase
//! executors, the scheduler, the resource monitor and the status server.

use crate::aria2::{DaemonSupervisor, SupervisorError};
use crate::config::{Config, ConfigError, ProfileName};
use crate::download::DownloadCoordinator;
use crate::encode::TranscodeCoordinator;
use crate::metrics::{new_shared_status, SharedStatus};
use crate::metrics_server::{bind_status_listener, serve_status, ServerError};
use crate::monitor::{MonitorSettings, ResourceMonitor};
use crate::pipeline::PhaseExecutors;
use crate::progress::ProgressSink;
use crate::scheduler::{EnqueueError, Scheduler};
use crate::startup::{
    clear_work_dirs, prepare_work_dirs, resolve_video_encoder, run_startup_checks, StartupError,
};
use crate::task::{Source, Task, TaskId, TaskReport};
use crate::upload::{UploadStep, Uploader};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Download daemon could not be brought up
    #[error("Download daemon error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Status server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Task not admitted to the queue
    #[error("Task rejected: {0}")]
    Enqueue(#[from] EnqueueError),
}

/// Handles of the background tasks started by [`Daemon::start`].
struct Background {
    monitor: JoinHandle<()>,
    server: Option<JoinHandle<()>>,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    status: SharedStatus,
    supervisor: Arc<DaemonSupervisor>,
    scheduler: Arc<Scheduler>,
    executors: PhaseExecutors,
    /// Stops the monitor and the status server
    background_stop: CancellationToken,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// 1. Load config from file, apply environment overrides, validate
    /// 2. Run startup checks (ffmpeg, ffprobe, aria2c, hardware encoder)
    /// 3. Build the supervisor, coordinators and scheduler
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    /// * `uploader` - Delivery transport for finished artifacts
    /// * `sink` - Receives progress records and terminal task reports
    pub async fn new<P: AsRef<Path>>(
        config_path: P,
        uploader: Arc<dyn Uploader>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, uploader, sink)
    }

    /// Initialize the daemon with an existing configuration
    ///
    /// The configuration is validated and startup checks are run. A
    /// configured hardware encoder that fails its test encode is dropped in
    /// favour of the software codec.
    pub fn with_config(
        mut config: Config,
        uploader: Arc<dyn Uploader>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config)?;
        let encoder = resolve_video_encoder(&mut config.transcode);
        info!(encoder = %encoder, "video encoder selected");
        Ok(Self::new_without_checks(config, uploader, sink))
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful when external tools are missing (tests, dry runs).
    pub fn new_without_checks(
        config: Config,
        uploader: Arc<dyn Uploader>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let supervisor = DaemonSupervisor::new(&config);
        let executors = PhaseExecutors {
            download: Arc::new(DownloadCoordinator::from_config(Arc::clone(&supervisor), &config)),
            transcode: Arc::new(TranscodeCoordinator::from_config(&config.transcode)),
            upload: Arc::new(UploadStep::from_config(uploader, &config.scheduler)),
        };
        Self::from_parts(config, supervisor, executors, sink)
    }

    /// Assemble a daemon around caller-built executors.
    pub fn from_parts(
        config: Config,
        supervisor: Arc<DaemonSupervisor>,
        executors: PhaseExecutors,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let status = new_shared_status();
        let scheduler = Arc::new(Scheduler::from_config(&config, sink, status.clone()));
        Self {
            config,
            status,
            supervisor,
            scheduler,
            executors,
            background_stop: CancellationToken::new(),
        }
    }

    /// Get the shared status snapshot
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn supervisor(&self) -> Arc<DaemonSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Queue a task for `raw_source` with the given profiles. Fails for an
    /// empty profile list or once shutdown has started.
    pub async fn submit(
        &self,
        submitter: &str,
        raw_source: &str,
        profiles: Vec<ProfileName>,
    ) -> Result<TaskId, DaemonError> {
        let task = Task::new(submitter, Source::parse(raw_source), profiles);
        Ok(self.scheduler.enqueue(task).await?)
    }

    pub async fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id).await
    }

    /// Stop admitting tasks and cancel the active one. [`Daemon::run`] and
    /// [`Daemon::run_until_idle`] return once the pipeline has wound down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.scheduler.shutdown();
    }

    /// Prepare directories, bring up the download daemon, start the monitor
    /// and the status server.
    async fn start(&self) -> Result<Background, DaemonError> {
        prepare_work_dirs(&self.config).await?;
        let listener = if self.config.status.enabled {
            Some(bind_status_listener(&self.config.status.listen).await?)
        } else {
            None
        };
        self.supervisor.start().await?;

        let monitor = ResourceMonitor::new(
            Arc::clone(&self.supervisor),
            self.status.clone(),
            MonitorSettings::from_config(&self.config.monitor),
        );
        let monitor = tokio::spawn(monitor.run(self.background_stop.clone()));

        let server = listener.map(|listener| {
            let status = self.status.clone();
            let stop = self.background_stop.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_status(listener, status, stop).await {
                    error!(error = %e, "status server error");
                }
            })
        });

        Ok(Background { monitor, server })
    }

    /// Stop background tasks and the download daemon, then clear working
    /// directories.
    async fn stop(&self, background: Background) {
        self.background_stop.cancel();
        if let Err(e) = background.monitor.await {
            warn!(error = %e, "resource monitor task ended abnormally");
        }
        if let Some(server) = background.server {
            if let Err(e) = server.await {
                warn!(error = %e, "status server task ended abnormally");
            }
        }
        self.supervisor.stop().await;
        clear_work_dirs(&self.config).await;
        info!("daemon stopped");
    }

    /// Run the admission loop until [`Daemon::shutdown`].
    pub async fn run(&self) -> Result<(), DaemonError> {
        let background = self.start().await?;
        info!("daemon running");
        self.scheduler.run(&self.executors).await;
        self.stop(background).await;
        Ok(())
    }

    /// Process everything queued so far, then shut down.
    pub async fn run_until_idle(&self) -> Result<Vec<TaskReport>, DaemonError> {
        let background = self.start().await?;
        let reports = self.scheduler.run_until_idle(&self.executors).await;
        self.stop(background).await;
        Ok(reports)
    }
}
