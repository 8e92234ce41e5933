//! Download completion verification.
//!
//! A download counts as finished on disk once the file exists with a non-zero
//! size, that size holds across a short re-check window, and aria2's
//! `<file>.aria2` control file is gone. Checks only read metadata, so running
//! them again over the same file gives the same answer. Every wait races the
//! caller's cancellation token.

use crate::retry::{sleep_or_cancel, Cancelled};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of comparing two size observations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the window.
    Stable,
    /// File size changed during the window.
    Unstable {
        initial_size: u64,
        current_size: u64,
    },
}

/// Outcome of one verification pass over a downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified { size: u64 },
    Missing,
    Empty,
    /// The download client's in-progress marker still exists.
    MarkerPresent,
    Unstable { initial_size: u64, current_size: u64 },
}

impl VerifyOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified { .. })
    }

    /// Missing and empty files won't fix themselves by waiting, the others might.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            VerifyOutcome::MarkerPresent | VerifyOutcome::Unstable { .. } | VerifyOutcome::Missing
        )
    }
}

/// Compare two file sizes.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

/// Path of aria2's control file for `path`.
pub fn marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".aria2");
    PathBuf::from(name)
}

async fn current_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Single verification pass: existence, marker, then a size re-check after `window`.
pub async fn verify_once(
    path: &Path,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<VerifyOutcome, Cancelled> {
    let Some(initial_size) = current_size(path).await else {
        return Ok(VerifyOutcome::Missing);
    };
    if initial_size == 0 {
        return Ok(VerifyOutcome::Empty);
    }
    if tokio::fs::try_exists(marker_path(path)).await.unwrap_or(false) {
        return Ok(VerifyOutcome::MarkerPresent);
    }

    sleep_or_cancel(window, cancel).await?;

    let Some(size) = current_size(path).await else {
        return Ok(VerifyOutcome::Missing);
    };
    Ok(match compare_sizes(initial_size, size) {
        StabilityResult::Stable => VerifyOutcome::Verified { size },
        StabilityResult::Unstable {
            initial_size,
            current_size,
        } => VerifyOutcome::Unstable {
            initial_size,
            current_size,
        },
    })
}

/// Repeat [`verify_once`] until the file verifies, a non-recoverable outcome is
/// seen, or `attempts` passes have been made. Returns the last outcome.
pub async fn verify_download(
    path: &Path,
    window: Duration,
    attempts: u32,
    cancel: &CancellationToken,
) -> Result<VerifyOutcome, Cancelled> {
    let attempts = attempts.max(1);
    let mut outcome = VerifyOutcome::Missing;
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        outcome = verify_once(path, window, cancel).await?;
        if outcome.is_verified() || !outcome.is_pending() {
            break;
        }
        debug!(path = %path.display(), attempt, ?outcome, "download not settled yet");
        if attempt < attempts {
            sleep_or_cancel(window, cancel).await?;
        }
    }
    Ok(outcome)
}
