//! Task model and its status state machine.
//!
//! A task is one request: a source plus the quality profiles to produce from it.
//! Status only ever moves forward through
//! `Queued < Downloading < Encoding(p) < Uploading(p) < Completed`, with
//! `Cancelled` reachable from any non-terminal state and `Failed` from any
//! non-terminal state once work has started.

use relay_daemon_config::ProfileName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex characters, used for file naming.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the input media comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Source {
    /// Direct remote URI handed to the download daemon.
    Url(String),
    /// Descriptor that needs metadata resolution before bytes flow.
    Magnet(String),
    /// File already on this host; no download phase runs against the daemon.
    Local(PathBuf),
}

impl Source {
    /// Classify a raw user-supplied location.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("magnet:") {
            Source::Magnet(trimmed.to_string())
        } else if lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.starts_with("ftp://")
            || lower.starts_with("sftp://")
        {
            Source::Url(trimmed.to_string())
        } else {
            Source::Local(PathBuf::from(trimmed))
        }
    }

    /// True when the daemon resolves the source into a follow-up transfer.
    pub fn requires_metadata(&self) -> bool {
        match self {
            Source::Magnet(_) => true,
            Source::Url(url) => url_path(url).to_ascii_lowercase().ends_with(".torrent"),
            Source::Local(_) => false,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Source::Local(_))
    }

    /// Human-readable name used in captions and reports.
    pub fn display_name(&self) -> String {
        match self {
            Source::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Source::Url(url) => url_path(url)
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .unwrap_or(url.as_str())
                .to_string(),
            Source::Magnet(uri) => magnet_display_name(uri).unwrap_or_else(|| "magnet".to_string()),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Url(url) => write!(f, "{}", url),
            Source::Magnet(uri) => write!(f, "{}", uri),
            Source::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// URL without query string or fragment.
fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

fn magnet_display_name(uri: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "dn")
        .map(|(_, value)| value.replace('+', " "))
        .filter(|name| !name.is_empty())
}

/// Status of a task in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "profile", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Encoding(ProfileName),
    Uploading(ProfileName),
    /// Every profile was attempted and at least one was delivered.
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Encoding(_) => "encoding",
            TaskStatus::Uploading(_) => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Encoding(p) => write!(f, "encoding({})", p),
            TaskStatus::Uploading(p) => write!(f, "uploading({})", p),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task is already terminal ({0})")]
    AlreadyTerminal(TaskStatus),

    #[error("profile {0} was not requested by this task")]
    UnknownProfile(ProfileName),

    #[error("illegal transition {from} -> {to}")]
    Backwards { from: TaskStatus, to: TaskStatus },
}

/// A unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Who asked for it; reported back, never interpreted.
    pub submitter: String,
    pub source: Source,
    /// Requested profiles, in processing order.
    pub profiles: Vec<ProfileName>,
    status: TaskStatus,
    cancel: CancellationToken,
    /// Phase-level retries spent so far (download resubmits, upload retries).
    pub retries: u32,
    /// Unix timestamp (milliseconds) when the task was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last observed progress.
    pub last_progress_at: i64,
}

impl Task {
    /// Create a queued task. Duplicate profiles are dropped, first occurrence wins.
    pub fn new(submitter: impl Into<String>, source: Source, profiles: Vec<ProfileName>) -> Self {
        let mut unique: Vec<ProfileName> = Vec::with_capacity(profiles.len());
        for profile in profiles {
            if !unique.contains(&profile) {
                unique.push(profile);
            }
        }
        let now = current_timestamp_ms();
        Self {
            id: TaskId::new(),
            submitter: submitter.into(),
            source,
            profiles: unique,
            status: TaskStatus::Queued,
            cancel: CancellationToken::new(),
            retries: 0,
            created_at: now,
            last_progress_at: now,
        }
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    /// Handle observed by coordinators; cancelling it requests cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn touch(&mut self) {
        self.last_progress_at = current_timestamp_ms();
    }

    /// Position of a status on the forward-only ladder. Terminal failure
    /// states have no rank.
    fn rank(&self, status: &TaskStatus) -> Result<Option<usize>, TransitionError> {
        let profile_index = |p: &ProfileName| {
            self.profiles
                .iter()
                .position(|q| q == p)
                .ok_or(TransitionError::UnknownProfile(*p))
        };
        Ok(match status {
            TaskStatus::Queued => Some(0),
            TaskStatus::Downloading => Some(1),
            TaskStatus::Encoding(p) => Some(2 + 2 * profile_index(p)?),
            TaskStatus::Uploading(p) => Some(3 + 2 * profile_index(p)?),
            TaskStatus::Completed => Some(usize::MAX),
            TaskStatus::Failed | TaskStatus::Cancelled => None,
        })
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status.clone()));
        }
        let allowed = match &next {
            TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.status != TaskStatus::Queued,
            other => {
                let from = self.rank(&self.status)?;
                let to = self.rank(other)?;
                matches!((from, to), (Some(a), Some(b)) if b > a)
            }
        };
        if !allowed {
            return Err(TransitionError::Backwards {
                from: self.status.clone(),
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }
}

/// Result of one requested profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProfileOutcome {
    Delivered {
        profile: ProfileName,
        output_bytes: u64,
        uploaded_bytes: u64,
    },
    Failed {
        profile: ProfileName,
        phase: &'static str,
        reason: String,
    },
}

impl ProfileOutcome {
    pub fn profile(&self) -> ProfileName {
        match self {
            ProfileOutcome::Delivered { profile, .. } | ProfileOutcome::Failed { profile, .. } => *profile,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, ProfileOutcome::Delivered { .. })
    }
}

/// Terminal summary handed to the progress sink.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub submitter: String,
    pub source_name: String,
    pub status: TaskStatus,
    pub outcomes: Vec<ProfileOutcome>,
    /// Task-level error (download failure, cancellation).
    pub error: Option<String>,
    pub retries: u32,
}

impl TaskReport {
    pub fn from_task(task: &Task, outcomes: Vec<ProfileOutcome>, error: Option<String>) -> Self {
        Self {
            task_id: task.id,
            submitter: task.submitter.clone(),
            source_name: task.source.display_name(),
            status: task.status().clone(),
            outcomes,
            error,
            retries: task.retries,
        }
    }

    /// Completed but at least one profile failed.
    pub fn has_warnings(&self) -> bool {
        self.status == TaskStatus::Completed && self.outcomes.iter().any(|o| !o.is_delivered())
    }
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match (&self.status, self.has_warnings()) {
            (TaskStatus::Completed, true) => "completed with warnings",
            (status, _) => status.as_str(),
        };
        writeln!(f, "task {} ({}): {}", self.task_id, self.source_name, headline)?;
        if let Some(err) = &self.error {
            writeln!(f, "  error: {}", err)?;
        }
        for outcome in &self.outcomes {
            match outcome {
                ProfileOutcome::Delivered {
                    profile,
                    output_bytes,
                    ..
                } => writeln!(
                    f,
                    "  {}: delivered ({:.1} MB)",
                    profile,
                    *output_bytes as f64 / MIB
                )?,
                ProfileOutcome::Failed {
                    profile,
                    phase,
                    reason,
                } => writeln!(f, "  {}: failed during {}: {}", profile, phase, reason)?,
            }
        }
        Ok(())
    }
}

const MIB: f64 = 1024.0 * 1024.0;

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
