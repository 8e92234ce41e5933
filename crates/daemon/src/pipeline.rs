//! Phase sequencing for one task.
//!
//! download, then for every requested profile: transcode and upload. A failed
//! profile is recorded and the next one attempted; the task only fails when
//! the download fails or no profile was delivered. Working files are removed on
//! every exit path, except a local source, which belongs to the user.

use crate::download::{DownloadCoordinator, DownloadError, DownloadedFile};
use crate::encode::transcoder::remove_if_exists;
use crate::encode::{TranscodeCoordinator, TranscodeError, TranscodeRequest, TranscodedFile};
use crate::progress::ProgressReporter;
use crate::task::{ProfileOutcome, Source, Task, TaskReport, TaskStatus};
use crate::upload::{build_caption, UploadError, UploadStep};
use async_trait::async_trait;
use relay_daemon_config::{Config, ProfileName, QualityProfile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Download phase executor.
#[async_trait]
pub trait DownloadPhase: Send + Sync {
    async fn download(
        &self,
        source: &Source,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<DownloadedFile, DownloadError>;
}

/// Transcode phase executor.
#[async_trait]
pub trait TranscodePhase: Send + Sync {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<TranscodedFile, TranscodeError>;
}

#[async_trait]
impl DownloadPhase for DownloadCoordinator {
    async fn download(
        &self,
        source: &Source,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<DownloadedFile, DownloadError> {
        DownloadCoordinator::download(self, source, dest_dir, cancel, progress).await
    }
}

#[async_trait]
impl TranscodePhase for TranscodeCoordinator {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<TranscodedFile, TranscodeError> {
        TranscodeCoordinator::transcode(self, request, cancel, progress).await
    }
}

/// The pluggable executors a task runs through.
#[derive(Clone)]
pub struct PhaseExecutors {
    pub download: Arc<dyn DownloadPhase>,
    pub transcode: Arc<dyn TranscodePhase>,
    pub upload: Arc<UploadStep>,
}

/// Working directories and the profile table.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub downloads_dir: PathBuf,
    pub encodes_dir: PathBuf,
    pub profiles: Vec<QualityProfile>,
}

impl PipelineContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            downloads_dir: config.paths.downloads_dir.clone(),
            encodes_dir: config.paths.encodes_dir.clone(),
            profiles: config.profiles.clone(),
        }
    }

    fn profile(&self, name: ProfileName) -> Option<&QualityProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// Status callback; invoked after every accepted transition.
pub type StatusHook<'a> = &'a (dyn Fn(&TaskStatus) + Send + Sync);

/// Drive `task` to a terminal state and return its report.
pub async fn run_task(
    task: &mut Task,
    executors: &PhaseExecutors,
    ctx: &PipelineContext,
    reporter: &ProgressReporter,
    on_status: StatusHook<'_>,
) -> TaskReport {
    let cancel = task.cancel_token();
    let work_dir_name = task.id.short();
    let download_dir = ctx.downloads_dir.join(&work_dir_name);
    let encode_dir = ctx.encodes_dir.join(&work_dir_name);
    let mut outcomes = Vec::new();

    if cancel.is_cancelled() {
        return finish(task, TaskStatus::Cancelled, outcomes, Some("cancelled before start".into()), on_status);
    }

    advance(task, TaskStatus::Downloading, on_status);
    let input = match executors
        .download
        .download(&task.source, &download_dir, &cancel, reporter)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            remove_dir(&download_dir).await;
            let status = if err.is_cancelled() {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Failed
            };
            return finish(task, status, outcomes, Some(err.to_string()), on_status);
        }
    };
    task.touch();

    let source_name = task.source.display_name();
    let stem = Path::new(&source_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| work_dir_name.clone());

    let mut cancelled = false;
    for name in task.profiles.clone() {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let outcome = run_profile(
            task, name, &input, &stem, &source_name, &encode_dir, executors, ctx, reporter, on_status,
        )
        .await;
        match outcome {
            Some(outcome) => outcomes.push(outcome),
            None => {
                cancelled = true;
                break;
            }
        }
    }

    remove_dir(&encode_dir).await;
    if !input.is_local {
        remove_dir(&download_dir).await;
    }

    if cancelled {
        return finish(task, TaskStatus::Cancelled, outcomes, Some("cancelled".into()), on_status);
    }
    if outcomes.iter().any(ProfileOutcome::is_delivered) {
        finish(task, TaskStatus::Completed, outcomes, None, on_status)
    } else {
        finish(
            task,
            TaskStatus::Failed,
            outcomes,
            Some("every requested profile failed".into()),
            on_status,
        )
    }
}

/// One transcode + upload. `None` means the task was cancelled.
#[allow(clippy::too_many_arguments)]
async fn run_profile(
    task: &mut Task,
    name: ProfileName,
    input: &DownloadedFile,
    stem: &str,
    source_name: &str,
    encode_dir: &Path,
    executors: &PhaseExecutors,
    ctx: &PipelineContext,
    reporter: &ProgressReporter,
    on_status: StatusHook<'_>,
) -> Option<ProfileOutcome> {
    let cancel = task.cancel_token();
    let Some(profile) = ctx.profile(name) else {
        return Some(ProfileOutcome::Failed {
            profile: name,
            phase: "planning",
            reason: "profile is not configured".into(),
        });
    };

    advance(task, TaskStatus::Encoding(name), on_status);
    let request = TranscodeRequest {
        input: input.path.clone(),
        output: encode_dir.join(format!("{}_{}.mp4", stem, name)),
        target_size_mb: profile.target_size_mb,
        profile: profile.clone(),
    };
    let encoded = match executors.transcode.transcode(&request, &cancel, reporter).await {
        Ok(encoded) => encoded,
        Err(err) if err.is_cancelled() => return None,
        Err(err) => {
            warn!(task_id = %task.id, profile = %name, error = %err, "encoding failed, moving on");
            return Some(ProfileOutcome::Failed {
                profile: name,
                phase: "encoding",
                reason: err.to_string(),
            });
        }
    };
    task.touch();

    advance(task, TaskStatus::Uploading(name), on_status);
    let caption = build_caption(source_name, name, input.size_bytes, encoded.size_bytes);
    let delivered = executors
        .upload
        .deliver(&encoded.path, &caption, name, &cancel, reporter)
        .await;
    remove_if_exists(&encoded.path).await;

    match delivered {
        Ok(outcome) => {
            task.retries += outcome.attempts.saturating_sub(1);
            task.touch();
            Some(ProfileOutcome::Delivered {
                profile: name,
                output_bytes: encoded.size_bytes,
                uploaded_bytes: outcome.result.bytes,
            })
        }
        Err(UploadError::Cancelled) => None,
        Err(err) => {
            warn!(task_id = %task.id, profile = %name, error = %err, "upload failed, moving on");
            Some(ProfileOutcome::Failed {
                profile: name,
                phase: "uploading",
                reason: err.to_string(),
            })
        }
    }
}

fn advance(task: &mut Task, next: TaskStatus, on_status: StatusHook<'_>) {
    match task.transition(next) {
        Ok(()) => {
            info!(task_id = %task.id, status = %task.status(), "task status");
            on_status(task.status());
        }
        Err(e) => warn!(task_id = %task.id, error = %e, "status change rejected"),
    }
}

fn finish(
    task: &mut Task,
    status: TaskStatus,
    outcomes: Vec<ProfileOutcome>,
    error: Option<String>,
    on_status: StatusHook<'_>,
) -> TaskReport {
    advance(task, status, on_status);
    TaskReport::from_task(task, outcomes, error)
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to clean working directory"),
    }
}
