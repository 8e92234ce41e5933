//! Relay Daemon
//!
//! Fetches media through a supervised aria2 instance, transcodes it to size
//! budgeted quality profiles with ffmpeg and hands the results to a delivery
//! transport, one task at a time.

pub mod aria2;
pub mod daemon;
pub mod download;
pub mod encode;
pub mod metrics;
pub mod metrics_server;
pub mod monitor;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod size_gate;
pub mod stability;
pub mod startup;
pub mod task;
pub mod upload;

pub use relay_daemon_config as config;
pub use relay_daemon_config::{Config, ProfileName, QualityProfile};
pub use aria2::{Aria2Client, DaemonState, DaemonSupervisor, RpcError, SupervisorError};
pub use daemon::{Daemon, DaemonError};
pub use download::{DownloadCoordinator, DownloadError, DownloadedFile};
pub use encode::{
    TranscodeCoordinator, TranscodeError, TranscodeRequest, TranscodedFile, VideoEncoder,
};
pub use metrics::{
    collect_system_metrics, new_shared_status, ActiveTaskStatus, SharedStatus, StatusSnapshot,
    SystemMetrics,
};
pub use metrics_server::{create_status_router, run_status_server, ServerError};
pub use monitor::{MonitorReport, Pressure, ResourceMonitor};
pub use pipeline::{PhaseExecutors, PipelineContext};
pub use progress::{Phase, ProgressRecord, ProgressReporter, ProgressSink, TracingProgressSink};
pub use retry::{Cancelled, RetryOutcome, RetryPolicy};
pub use scheduler::{EnqueueError, Scheduler};
pub use startup::{parse_ffmpeg_version, resolve_video_encoder, run_startup_checks, StartupError};
pub use task::{ProfileOutcome, Source, Task, TaskId, TaskReport, TaskStatus};
pub use upload::{build_caption, DirectoryUploader, UploadError, UploadReceipt, Uploader};
