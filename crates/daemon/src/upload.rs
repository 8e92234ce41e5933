//! Delivery of finished artifacts.
//!
//! The transport is a caller-supplied [`Uploader`]. [`UploadStep`] wraps it with
//! the shared retry policy and checks that the receipt accounts for every byte
//! of the file. [`DirectoryUploader`] is a transport that copies artifacts into
//! an outbox directory.

use crate::progress::{Phase, ProgressRecord, ProgressReporter};
use crate::retry::{Cancelled, RetryOutcome, RetryPolicy};
use async_trait::async_trait;
use relay_daemon_config::{ProfileName, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

const COPY_CHUNK: usize = 1024 * 1024;

/// Error type for uploads
#[derive(Debug, Error)]
pub enum UploadError {
    /// Throttling, disconnects and similar; worth another attempt.
    #[error("Upload transport error: {0}")]
    Transport(String),

    #[error("Upload rejected: {0}")]
    Rejected(String),

    /// The transport reported fewer (or more) bytes than the file holds.
    #[error("Upload verification failed: sent {uploaded} of {expected} bytes")]
    Verification { expected: u64, uploaded: u64 },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Cancelled> for UploadError {
    fn from(_: Cancelled) -> Self {
        UploadError::Cancelled
    }
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transport(_) | UploadError::Io(_))
    }
}

/// What the transport reports after a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bytes: u64,
    /// Where the artifact ended up, in the transport's terms.
    pub location: String,
}

/// Progress callback handed to the transport.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    reporter: ProgressReporter,
    profile: ProfileName,
    started: Instant,
}

impl UploadProgress {
    pub fn new(reporter: ProgressReporter, profile: ProfileName) -> Self {
        Self {
            reporter,
            profile,
            started: Instant::now(),
        }
    }

    pub fn update(&self, sent: u64, total: u64) {
        let secs = self.started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { (sent as f64 / secs) as u64 } else { 0 };
        self.reporter.report(ProgressRecord::from_bytes(
            Phase::Uploading(self.profile),
            sent,
            Some(total),
            rate,
        ));
    }
}

/// Delivery transport.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        path: &Path,
        caption: &str,
        progress: &UploadProgress,
    ) -> Result<UploadReceipt, UploadError>;
}

/// Upload with retries and post-upload verification.
pub struct UploadStep {
    uploader: Arc<dyn Uploader>,
    policy: RetryPolicy,
}

impl UploadStep {
    pub fn new(uploader: Arc<dyn Uploader>, policy: RetryPolicy) -> Self {
        Self { uploader, policy }
    }

    pub fn from_config(uploader: Arc<dyn Uploader>, config: &SchedulerConfig) -> Self {
        Self::new(
            uploader,
            RetryPolicy::fixed(
                config.upload_attempts,
                Duration::from_secs(config.upload_retry_delay_secs),
            ),
        )
    }

    pub async fn deliver(
        &self,
        path: &Path,
        caption: &str,
        profile: ProfileName,
        cancel: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<RetryOutcome<UploadReceipt>, UploadError> {
        let expected = tokio::fs::metadata(path).await?.len();
        let progress = UploadProgress::new(reporter.clone(), profile);
        progress.update(0, expected);

        let progress = &progress;
        let outcome = self
            .policy
            .run_cancellable("upload", cancel, UploadError::is_transient, move |_| {
                self.uploader.upload(path, caption, progress)
            })
            .await?;

        let receipt = &outcome.result;
        if receipt.bytes != expected {
            return Err(UploadError::Verification {
                expected,
                uploaded: receipt.bytes,
            });
        }
        info!(
            profile = %profile,
            bytes = receipt.bytes,
            attempts = outcome.attempts,
            location = %receipt.location,
            "upload verified"
        );
        Ok(outcome)
    }
}

/// Caption sent along with an artifact.
pub fn build_caption(name: &str, profile: ProfileName, original_bytes: u64, encoded_bytes: u64) -> String {
    let mb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);
    let mut caption = format!(
        "{}\nQuality: {}\nSize: {:.1} MB -> {:.1} MB",
        name,
        profile,
        mb(original_bytes),
        mb(encoded_bytes)
    );
    if original_bytes > 0 && encoded_bytes < original_bytes {
        let reduction = (1.0 - encoded_bytes as f64 / original_bytes as f64) * 100.0;
        caption.push_str(&format!(" ({:.1}% smaller)", reduction));
    }
    caption
}

/// Copies artifacts (and a caption file) into an outbox directory.
#[derive(Debug, Clone)]
pub struct DirectoryUploader {
    outbox: PathBuf,
}

impl DirectoryUploader {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self { outbox: outbox.into() }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }
}

#[async_trait]
impl Uploader for DirectoryUploader {
    async fn upload(
        &self,
        path: &Path,
        caption: &str,
        progress: &UploadProgress,
    ) -> Result<UploadReceipt, UploadError> {
        let name = path
            .file_name()
            .ok_or_else(|| UploadError::Rejected(format!("{} has no file name", path.display())))?;
        tokio::fs::create_dir_all(&self.outbox).await?;
        let target = self.outbox.join(name);

        let mut input = tokio::fs::File::open(path).await?;
        let total = input.metadata().await?.len();
        let mut output = tokio::fs::File::create(&target).await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut sent = 0u64;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n]).await?;
            sent += n as u64;
            progress.update(sent, total);
        }
        output.flush().await?;

        let mut caption_path = target.clone().into_os_string();
        caption_path.push(".txt");
        tokio::fs::write(PathBuf::from(caption_path), caption).await?;

        Ok(UploadReceipt {
            bytes: sent,
            location: target.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails `failures` times with the given error, then succeeds.
    struct ScriptedUploader {
        failures: u32,
        error: fn() -> UploadError,
        short_by: u64,
        calls: AtomicU32,
        captions: Mutex<Vec<String>>,
    }

    impl ScriptedUploader {
        fn new(failures: u32, error: fn() -> UploadError) -> Self {
            Self {
                failures,
                error,
                short_by: 0,
                calls: AtomicU32::new(0),
                captions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Uploader for ScriptedUploader {
        async fn upload(
            &self,
            path: &Path,
            caption: &str,
            _progress: &UploadProgress,
        ) -> Result<UploadReceipt, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.captions.lock().unwrap().push(caption.to_string());
            if call < self.failures {
                return Err((self.error)());
            }
            let len = tokio::fs::metadata(path).await?.len();
            Ok(UploadReceipt {
                bytes: len - self.short_by,
                location: "remote".into(),
            })
        }
    }

    fn artifact() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out_720p.mp4");
        std::fs::write(&path, vec![3u8; 2048]).unwrap();
        (dir, path)
    }

    fn step(uploader: Arc<dyn Uploader>) -> UploadStep {
        UploadStep::new(uploader, RetryPolicy::fixed(3, Duration::from_millis(5)))
    }

    async fn deliver(step: &UploadStep, path: &Path) -> Result<UploadReceipt, UploadError> {
        step.deliver(
            path,
            "caption",
            ProfileName::Hd720,
            &CancellationToken::new(),
            &ProgressReporter::detached(),
        )
        .await
        .map(|outcome| outcome.result)
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (_dir, path) = artifact();
        let uploader = Arc::new(ScriptedUploader::new(2, || UploadError::Transport("429".into())));
        let receipt = deliver(&step(uploader.clone()), &path).await.unwrap();
        assert_eq!(receipt.bytes, 2048);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
        assert!(uploader.captions.lock().unwrap().iter().all(|c| c == "caption"));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let (_dir, path) = artifact();
        let uploader = Arc::new(ScriptedUploader::new(10, || UploadError::Transport("reset".into())));
        let err = deliver(&step(uploader.clone()), &path).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (_dir, path) = artifact();
        let uploader = Arc::new(ScriptedUploader::new(1, || UploadError::Rejected("too big".into())));
        let err = deliver(&step(uploader.clone()), &path).await.unwrap_err();
        assert!(matches!(err, UploadError::Rejected(_)));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let (_dir, path) = artifact();
        let uploader = Arc::new(ScriptedUploader::new(10, || UploadError::Transport("429".into())));
        let step = UploadStep::new(uploader.clone(), RetryPolicy::fixed(3, Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = step
            .deliver(&path, "caption", ProfileName::Hd720, &cancel, &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_receipt_fails_verification() {
        let (_dir, path) = artifact();
        let mut uploader = ScriptedUploader::new(0, || UploadError::Transport(String::new()));
        uploader.short_by = 48;
        let err = deliver(&step(Arc::new(uploader)), &path).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Verification {
                expected: 2048,
                uploaded: 2000
            }
        ));
    }

    #[tokio::test]
    async fn test_directory_uploader_copies_with_caption() {
        let (dir, path) = artifact();
        let outbox = dir.path().join("outbox");
        let uploader = Arc::new(DirectoryUploader::new(&outbox));
        let receipt = deliver(&step(uploader), &path).await.unwrap();

        assert_eq!(receipt.bytes, 2048);
        assert_eq!(std::fs::read(outbox.join("out_720p.mp4")).unwrap().len(), 2048);
        assert_eq!(
            std::fs::read_to_string(outbox.join("out_720p.mp4.txt")).unwrap(),
            "caption"
        );
    }

    #[test]
    fn test_caption_reports_reduction() {
        let caption = build_caption("Movie", ProfileName::Hd720, 400 * 1024 * 1024, 100 * 1024 * 1024);
        assert_eq!(
            caption,
            "Movie\nQuality: 720p\nSize: 400.0 MB -> 100.0 MB (75.0% smaller)"
        );
        let grown = build_caption("Clip", ProfileName::Sd480, 1024 * 1024, 2 * 1024 * 1024);
        assert!(!grown.contains("smaller"));
    }
}
