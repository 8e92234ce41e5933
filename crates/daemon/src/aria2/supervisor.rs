//! Lifecycle of the external download daemon.
//!
//! `Stopped -> Starting -> Healthy -> (Unhealthy -> Restarting -> Healthy) -> Stopped`.
//! The supervisor is the only writer of the daemon handle; coordinators read
//! it through [`DaemonSupervisor::handle`] and ask for a restart when a call
//! fails, passing the generation they observed so concurrent requests collapse
//! into one restart.

use super::rpc::{Aria2Client, RpcEndpoint, RpcError};
use crate::retry::RetryPolicy;
use relay_daemon_config::{Aria2Config, Config, DownloadConfig};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// How long a liveness probe may take.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
/// Gap between health polls while the daemon starts.
const STARTUP_POLL: Duration = Duration::from_millis(200);
/// Time the daemon gets to exit after an RPC shutdown before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_SESSION_FILE: &str = ".aria2.session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
}

/// Error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Download daemon exited during startup ({0})")]
    ExitedDuringStartup(String),

    #[error("Download daemon did not answer within {0:?}")]
    StartupTimeout(Duration),

    #[error("No free RPC port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Download daemon is not running")]
    NotRunning,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// A missing binary will not appear on its own; everything else may clear up.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SupervisorError::Spawn { .. })
    }
}

/// Live view of the daemon: endpoint plus a client bound to it.
#[derive(Debug)]
pub struct DaemonHandle {
    pub endpoint: RpcEndpoint,
    pub client: Arc<Aria2Client>,
    /// Bumped on every successful (re)start.
    pub generation: u64,
    pub pid: Option<u32>,
}

pub struct DaemonSupervisor {
    config: Aria2Config,
    download: DownloadConfig,
    downloads_dir: PathBuf,
    retry: RetryPolicy,
    rpc_timeout: Duration,
    state: RwLock<DaemonState>,
    handle: RwLock<Option<Arc<DaemonHandle>>>,
    child: Mutex<Option<Child>>,
    /// Serializes start, restart and stop. It stays held through the startup
    /// health polls so that a second restart request waits and then sees the
    /// new generation instead of restarting again. `handle`, `client`, `state`
    /// and `ensure_healthy` never take it, so task RPC never queues behind it.
    restart_lock: Mutex<()>,
    generation: AtomicU64,
}

impl DaemonSupervisor {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            config: config.aria2.clone(),
            download: config.download.clone(),
            downloads_dir: config.paths.downloads_dir.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            rpc_timeout: Duration::from_secs(config.aria2.rpc_timeout_secs),
            state: RwLock::new(DaemonState::Stopped),
            handle: RwLock::new(None),
            child: Mutex::new(None),
            restart_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state.read().map(|s| *s).unwrap_or(DaemonState::Unhealthy)
    }

    fn set_state(&self, next: DaemonState) {
        if let Ok(mut state) = self.state.write() {
            if *state != next {
                debug!(from = ?*state, to = ?next, "daemon state");
                *state = next;
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Current handle, if the daemon has been started.
    pub fn handle(&self) -> Option<Arc<DaemonHandle>> {
        self.handle.read().ok().and_then(|h| h.clone())
    }

    fn set_handle(&self, next: Option<Arc<DaemonHandle>>) {
        if let Ok(mut handle) = self.handle.write() {
            *handle = next;
        }
    }

    pub fn client(&self) -> Result<Arc<Aria2Client>, SupervisorError> {
        self.handle()
            .map(|h| Arc::clone(&h.client))
            .ok_or(SupervisorError::NotRunning)
    }

    /// Bring the daemon up and wait until it answers.
    pub async fn start(&self) -> Result<Arc<DaemonHandle>, SupervisorError> {
        let _guard = self.restart_lock.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<Arc<DaemonHandle>, SupervisorError> {
        self.set_state(DaemonState::Starting);
        let result = if self.config.spawn {
            self.launch().await
        } else {
            self.attach().await
        };
        match result {
            Ok(handle) => {
                info!(
                    port = handle.endpoint.port,
                    generation = handle.generation,
                    pid = ?handle.pid,
                    "download daemon healthy"
                );
                self.set_handle(Some(Arc::clone(&handle)));
                self.set_state(DaemonState::Healthy);
                Ok(handle)
            }
            Err(err) => {
                error!(error = %err, "download daemon failed to start");
                self.kill_child().await;
                self.set_handle(None);
                self.set_state(DaemonState::Stopped);
                Err(err)
            }
        }
    }

    /// Supervise an instance someone else runs.
    async fn attach(&self) -> Result<Arc<DaemonHandle>, SupervisorError> {
        let endpoint = RpcEndpoint::from_config(&self.config);
        let client = Arc::new(Aria2Client::new(endpoint.clone(), self.rpc_timeout)?);
        self.wait_until_healthy(&client).await?;
        Ok(self.new_handle(endpoint, client, None))
    }

    async fn launch(&self) -> Result<Arc<DaemonHandle>, SupervisorError> {
        let binary_stem = Path::new(&self.config.binary)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.binary.clone());
        let killed = kill_stray_instances(&binary_stem);
        if killed > 0 {
            warn!(count = killed, binary = %binary_stem, "terminated stray download daemon instances");
            // Give the OS a moment to release the port.
            sleep(Duration::from_millis(500)).await;
        }

        let span = self.config.port_scan_span;
        let port = find_free_port(&self.config.host, self.config.port, span).ok_or(
            SupervisorError::NoFreePort {
                start: self.config.port,
                end: self.config.port.saturating_add(span),
            },
        )?;
        if port != self.config.port {
            warn!(configured = self.config.port, chosen = port, "RPC port taken, using next free port");
        }

        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        let session_file = self.session_file();
        if tokio::fs::metadata(&session_file).await.is_err() {
            tokio::fs::write(&session_file, b"").await?;
        }

        let args = build_aria2_args(&self.config, &self.download, port, &self.downloads_dir, &session_file);
        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: self.config.binary.clone(),
                source,
            })?;
        let pid = child.id();
        *self.child.lock().await = Some(child);

        let endpoint = RpcEndpoint::from_config(&self.config).with_port(port);
        let client = Arc::new(Aria2Client::new(endpoint.clone(), self.rpc_timeout)?);
        self.wait_until_healthy(&client).await?;
        Ok(self.new_handle(endpoint, client, pid))
    }

    fn new_handle(&self, endpoint: RpcEndpoint, client: Arc<Aria2Client>, pid: Option<u32>) -> Arc<DaemonHandle> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(DaemonHandle {
            endpoint,
            client,
            generation,
            pid,
        })
    }

    fn session_file(&self) -> PathBuf {
        self.config
            .session_file
            .clone()
            .unwrap_or_else(|| self.downloads_dir.join(DEFAULT_SESSION_FILE))
    }

    /// Poll the version call until it answers or the startup timeout elapses.
    /// A child that exits in the meantime fails the attempt immediately.
    async fn wait_until_healthy(&self, client: &Aria2Client) -> Result<(), SupervisorError> {
        let limit = Duration::from_secs(self.config.startup_timeout_secs);
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.child_exit_status().await {
                return Err(SupervisorError::ExitedDuringStartup(status));
            }
            match timeout(HEALTH_TIMEOUT, client.get_version()).await {
                Ok(Ok(version)) => {
                    debug!(version = %version, "download daemon answered");
                    return Ok(());
                }
                Ok(Err(err)) if !err.is_transient() => return Err(err.into()),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::StartupTimeout(limit));
            }
            sleep(STARTUP_POLL).await;
        }
    }

    /// Exit status of the supervised child if it has exited.
    async fn child_exit_status(&self) -> Option<String> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    /// Whether the daemon process exists. External instances count as alive
    /// while they answer RPC.
    pub async fn is_process_alive(&self) -> bool {
        if !self.config.spawn {
            return self.handle().is_some();
        }
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Liveness probe over RPC with a short timeout. Updates the state.
    pub async fn ensure_healthy(&self) -> bool {
        let Some(handle) = self.handle() else {
            return false;
        };
        let healthy = self.is_process_alive().await
            && matches!(timeout(HEALTH_TIMEOUT, handle.client.get_version()).await, Ok(Ok(_)));
        match (healthy, self.state()) {
            (true, _) => self.set_state(DaemonState::Healthy),
            (false, DaemonState::Healthy) => {
                warn!(generation = handle.generation, "download daemon unhealthy");
                self.set_state(DaemonState::Unhealthy);
            }
            _ => {}
        }
        healthy
    }

    /// Restart the daemon unless someone already did since `observed_generation`.
    pub async fn restart(&self, observed_generation: u64) -> Result<Arc<DaemonHandle>, SupervisorError> {
        let _guard = self.restart_lock.lock().await;
        if self.generation() != observed_generation {
            if let Some(handle) = self.handle() {
                debug!(generation = handle.generation, "restart already performed");
                return Ok(handle);
            }
        }

        warn!(generation = observed_generation, "restarting download daemon");
        self.set_state(DaemonState::Restarting);
        if let Some(handle) = self.handle() {
            // Best effort: persist transfer state if the old instance still listens.
            let _ = timeout(HEALTH_TIMEOUT, handle.client.save_session()).await;
        }
        self.kill_child().await;
        self.set_handle(None);

        let outcome = self
            .retry
            .run("download daemon start", SupervisorError::is_retryable, |_| self.start_locked())
            .await?;
        Ok(outcome.result)
    }

    /// Graceful stop: RPC shutdown, then kill after a grace period.
    pub async fn stop(&self) {
        let _guard = self.restart_lock.lock().await;
        if let Some(handle) = self.handle() {
            if self.config.spawn {
                let _ = timeout(HEALTH_TIMEOUT, handle.client.shutdown()).await;
            }
        }
        self.set_handle(None);

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if timeout(STOP_GRACE, child.wait()).await.is_err() {
                warn!("download daemon ignored shutdown, killing");
                let _ = child.kill().await;
            }
        }
        self.set_state(DaemonState::Stopped);
        info!("download daemon stopped");
    }

    async fn kill_child(&self) {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
    }
}

/// Command-line for a supervised aria2 instance.
pub fn build_aria2_args(
    config: &Aria2Config,
    download: &DownloadConfig,
    port: u16,
    downloads_dir: &Path,
    session_file: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--enable-rpc=true".to_string(),
        format!("--rpc-listen-port={}", port),
        "--rpc-listen-all=false".to_string(),
        "--daemon=false".to_string(),
        "--continue=true".to_string(),
        format!("--max-concurrent-downloads={}", config.max_concurrent_downloads),
        format!("--max-connection-per-server={}", download.max_connections_per_server),
        format!("--split={}", download.split),
        format!("--max-overall-upload-limit={}", config.max_upload_limit),
        "--seed-time=0".to_string(),
        "--file-allocation=none".to_string(),
        format!("--dir={}", downloads_dir.display()),
        format!("--save-session={}", session_file.display()),
        format!("--input-file={}", session_file.display()),
        "--save-session-interval=30".to_string(),
        "--quiet=true".to_string(),
    ];
    if !config.secret.is_empty() {
        args.push(format!("--rpc-secret={}", config.secret));
    }
    args
}

/// First port in `start..=start+span` that can be bound on `host`.
pub fn find_free_port(host: &str, start: u16, span: u16) -> Option<u16> {
    let end = start.saturating_add(span);
    (start..=end).find(|port| TcpListener::bind((host, *port)).is_ok())
}

/// Kill every process whose executable stem matches `name`. Returns how many were signalled.
pub fn kill_stray_instances(name: &str) -> usize {
    let sys = System::new_all();
    let own_pid = std::process::id();
    let target = OsStr::new(name);
    sys.processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .filter(|(_, process)| {
            process
                .exe()
                .and_then(|exe| exe.file_stem())
                .map(|stem| stem == target)
                .unwrap_or(false)
        })
        .filter(|(_, process)| process.kill())
        .count()
}
