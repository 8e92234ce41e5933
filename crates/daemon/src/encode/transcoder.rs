//! Transcode coordinator.
//!
//! Runs one ffmpeg pass for a (task, profile) pair and supervises it: progress
//! from the stderr stats stream, output growth for stall detection, in-flight
//! size enforcement and a hard wall-clock limit. The child never outlives the
//! call, and a failed or cancelled pass leaves no output file behind.

use super::ffmpeg::{
    build_ffmpeg_command, parse_progress_line, percent_from_time, FfmpegParams, FfmpegProgress,
    LineSplitter, VideoEncoder,
};
use super::plan::{plan_bitrate, BitratePlan, PlanError, PlanLimits};
use super::probe::{probe_file, ProbeError};
use crate::progress::{Phase, ProgressRecord, ProgressReporter};
use crate::size_gate::{check_in_flight, check_size_budget, size_limit, Overrun, SizeGateResult};
use relay_daemon_config::{QualityProfile, TranscodeConfig};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Diagnostic lines kept from the transcoder's stderr.
const DIAGNOSTIC_TAIL: usize = 20;

/// Error type for transcode operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Rejected before the transcoder was started.
    #[error("Invalid transcode request: {0}")]
    InvalidRequest(String),

    #[error("Bitrate planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),

    #[error("Input is {size_mb:.1} MB, above the {limit_mb:.0} MB limit")]
    InputTooLarge { size_mb: f64, limit_mb: f64 },

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Failed to start transcoder: {0}")]
    Spawn(std::io::Error),

    /// Non-zero exit; carries the tail of the diagnostic output.
    #[error("Transcoder exited with {status}: {diagnostics}")]
    ProcessFailed { status: String, diagnostics: String },

    #[error("Output stopped growing for {0:?}")]
    Stalled(Duration),

    #[error("Transcoder exceeded the {0:?} process timeout")]
    Timeout(Duration),

    #[error("Output exceeds size budget: {0}")]
    OverBudget(String),

    #[error("Output failed verification: {0}")]
    Verification(String),

    #[error("Transcode cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TranscodeError::Cancelled)
    }
}

/// One transcode to perform.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub target_size_mb: f64,
    pub profile: QualityProfile,
}

/// A verified transcoder output.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub plan: BitratePlan,
    pub duration_secs: f64,
}

/// Timing and limits, with durations resolved from configuration.
#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub encoder: VideoEncoder,
    pub audio_codec: String,
    pub threads: u32,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    pub process_timeout: Duration,
    pub grace_period: Duration,
    pub tolerance: f64,
    pub max_input_bytes: u64,
    pub limits: PlanLimits,
}

impl TranscodeSettings {
    /// A configured `hw_encoder` wins; startup clears it when the test
    /// encode fails so the software codec is used instead.
    pub fn from_config(config: &TranscodeConfig) -> Self {
        let encoder = match &config.hw_encoder {
            Some(codec) => VideoEncoder::Hardware(codec.clone()),
            None => VideoEncoder::Software(config.video_codec.clone()),
        };
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            encoder,
            audio_codec: config.audio_codec.clone(),
            threads: config.threads.unwrap_or(num_cpus::get() as u32).max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            process_timeout: Duration::from_secs(config.process_timeout_secs),
            grace_period: Duration::from_secs(config.grace_period_secs),
            tolerance: config.tolerance_factor,
            max_input_bytes: (config.max_input_mb * 1024.0 * 1024.0) as u64,
            limits: PlanLimits::from_config(config),
        }
    }
}

/// How the monitoring loop ended.
enum Supervised {
    Exited(ExitStatus),
    Aborted(TranscodeError),
}

pub struct TranscodeCoordinator {
    settings: TranscodeSettings,
}

impl TranscodeCoordinator {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self::new(TranscodeSettings::from_config(config))
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    /// Transcode `request.input` into `request.output` within the size budget.
    pub async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<TranscodedFile, TranscodeError> {
        let profile = &request.profile;
        if !request.target_size_mb.is_finite() || request.target_size_mb <= 0.0 {
            return Err(TranscodeError::InvalidRequest(format!(
                "target size must be positive, got {} MB",
                request.target_size_mb
            )));
        }
        profile.check().map_err(TranscodeError::InvalidRequest)?;
        if cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled);
        }

        let input_meta = match tokio::fs::metadata(&request.input).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(TranscodeError::InputMissing(request.input.clone())),
        };
        if input_meta.len() > self.settings.max_input_bytes {
            return Err(TranscodeError::InputTooLarge {
                size_mb: input_meta.len() as f64 / (1024.0 * 1024.0),
                limit_mb: self.settings.max_input_bytes as f64 / (1024.0 * 1024.0),
            });
        }

        let probe = probe_file(&self.settings.ffprobe, &request.input).await?;
        if !probe.has_video() {
            return Err(TranscodeError::InvalidRequest("input has no video stream".to_string()));
        }
        let duration_secs = probe.format.duration_secs;
        let input_codec = probe.video_codec();
        let plan = plan_bitrate(
            request.target_size_mb,
            duration_secs,
            profile,
            input_codec.as_deref(),
            &self.settings.limits,
        )?;
        info!(
            profile = %profile.name,
            input = %request.input.display(),
            duration_secs,
            input_codec = input_codec.as_deref().unwrap_or("unknown"),
            video_bps = plan.video_bps,
            preset = %plan.preset,
            clamped = plan.clamped,
            "starting transcode"
        );

        // Every pass starts from a clean output path.
        remove_if_exists(&request.output).await;
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let params = FfmpegParams {
            ffmpeg: self.settings.ffmpeg.clone(),
            input: request.input.clone(),
            output: request.output.clone(),
            encoder: self.settings.encoder.clone(),
            audio_codec: self.settings.audio_codec.clone(),
            threads: self.settings.threads,
        };
        let mut child = build_ffmpeg_command(&params, &plan)
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let (progress_tx, progress_rx) = watch::channel(FfmpegProgress::default());
        let reader = child.stderr.take().map(|stderr| spawn_stderr_reader(stderr, progress_tx));

        let phase = Phase::Encoding(profile.name);
        progress.report(ProgressRecord::from_bytes(phase, 0, Some(plan.budget_bytes), 0));

        let supervised = self
            .supervise(&mut child, request, &plan, duration_secs, &progress_rx, cancel, progress)
            .await;

        let status = match supervised {
            Supervised::Exited(status) => status,
            Supervised::Aborted(err) => {
                warn!(profile = %profile.name, error = %err, "stopping transcoder");
                self.terminate(&mut child).await;
                collect_diagnostics(reader).await;
                remove_if_exists(&request.output).await;
                return Err(err);
            }
        };

        let diagnostics = collect_diagnostics(reader).await;
        if !status.success() {
            remove_if_exists(&request.output).await;
            return Err(TranscodeError::ProcessFailed {
                status: status.to_string(),
                diagnostics: diagnostics.join(" | "),
            });
        }

        match self.verify_output(&request.output, &plan).await {
            Ok(size_bytes) => {
                progress.report(ProgressRecord::from_bytes(phase, size_bytes, Some(size_bytes), 0));
                info!(profile = %profile.name, size_bytes, "transcode verified");
                Ok(TranscodedFile {
                    path: request.output.clone(),
                    size_bytes,
                    plan,
                    duration_secs,
                })
            }
            Err(err) => {
                remove_if_exists(&request.output).await;
                Err(err)
            }
        }
    }

    /// Watch the running child until it exits or must be stopped. A size
    /// overrun takes precedence over a stall observed in the same tick.
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        child: &mut Child,
        request: &TranscodeRequest,
        plan: &BitratePlan,
        duration_secs: f64,
        progress_rx: &watch::Receiver<FfmpegProgress>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Supervised {
        let started = Instant::now();
        let deadline = started + self.settings.process_timeout;
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_size = 0u64;
        let mut last_growth = started;
        let mut last_tick = started;
        let phase = Phase::Encoding(request.profile.name);

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => Supervised::Exited(status),
                        Err(e) => Supervised::Aborted(TranscodeError::Io(e)),
                    };
                }
                _ = cancel.cancelled() => {
                    return Supervised::Aborted(TranscodeError::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    return Supervised::Aborted(TranscodeError::Timeout(self.settings.process_timeout));
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let size = file_size(&request.output).await;
                    let stats = progress_rx.borrow().clone();
                    let fraction = stats
                        .time_secs
                        .filter(|_| duration_secs > 0.0)
                        .map(|t| t / duration_secs);

                    if let Some(overrun) = check_in_flight(plan.budget_bytes, self.settings.tolerance, size, fraction) {
                        return Supervised::Aborted(TranscodeError::OverBudget(describe_overrun(&overrun)));
                    }

                    let elapsed = now.duration_since(last_tick).as_secs_f64();
                    let rate = if size > last_size && elapsed > 0.0 {
                        ((size - last_size) as f64 / elapsed) as u64
                    } else {
                        0
                    };
                    if size > last_size {
                        last_size = size;
                        last_growth = now;
                    } else if now.duration_since(last_growth) >= self.settings.stall_timeout {
                        return Supervised::Aborted(TranscodeError::Stalled(self.settings.stall_timeout));
                    }
                    last_tick = now;

                    let percent = stats
                        .time_secs
                        .map(|t| percent_from_time(t, duration_secs))
                        .unwrap_or(0.0);
                    let eta = match (stats.time_secs, stats.speed) {
                        (Some(t), Some(speed)) if speed > 0.0 && duration_secs > t => {
                            Some(Duration::from_secs_f64((duration_secs - t) / speed))
                        }
                        _ => None,
                    };
                    progress.report(ProgressRecord {
                        phase,
                        percent,
                        bytes_done: size,
                        bytes_total: Some(plan.budget_bytes),
                        rate,
                        eta,
                    });
                }
            }
        }
    }

    /// Ask ffmpeg to quit (`q` on stdin), then kill it after the grace period.
    async fn terminate(&self, child: &mut Child) {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        match timeout(self.settings.grace_period, child.wait()).await {
            Ok(_) => debug!("transcoder exited after quit request"),
            Err(_) => {
                debug!("transcoder ignored quit request, killing");
                let _ = child.kill().await;
            }
        }
    }

    /// Non-empty, probes, has a video stream, and fits the budget.
    async fn verify_output(&self, output: &Path, plan: &BitratePlan) -> Result<u64, TranscodeError> {
        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(_) => return Err(TranscodeError::Verification("output file missing".to_string())),
        };
        if size == 0 {
            return Err(TranscodeError::Verification("output file is empty".to_string()));
        }
        let probe = probe_file(&self.settings.ffprobe, output)
            .await
            .map_err(|e| TranscodeError::Verification(format!("output does not probe: {}", e)))?;
        if !probe.has_video() {
            return Err(TranscodeError::Verification("output has no video stream".to_string()));
        }
        match check_size_budget(plan.budget_bytes, size, self.settings.tolerance) {
            SizeGateResult::Accept => Ok(size),
            SizeGateResult::Reject {
                budget_bytes,
                output_bytes,
                ratio,
            } => Err(TranscodeError::OverBudget(format!(
                "{} bytes is {:.2}x the {} byte budget (limit {} bytes)",
                output_bytes,
                ratio,
                budget_bytes,
                size_limit(budget_bytes, self.settings.tolerance)
            ))),
        }
    }
}

fn describe_overrun(overrun: &Overrun) -> String {
    match overrun {
        Overrun::Reached {
            current_bytes,
            limit_bytes,
        } => format!("output reached {} bytes, limit {} bytes", current_bytes, limit_bytes),
        Overrun::Projected {
            projected_bytes,
            limit_bytes,
        } => format!("output projected to {} bytes, limit {} bytes", projected_bytes, limit_bytes),
    }
}

/// Read stderr until EOF, publishing parsed stats and keeping the last diagnostic lines.
fn spawn_stderr_reader(
    mut stderr: ChildStderr,
    tx: watch::Sender<FfmpegProgress>,
) -> JoinHandle<VecDeque<String>> {
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
        let mut buf = [0u8; 4096];
        let handle_line = |line: String, tail: &mut VecDeque<String>| match parse_progress_line(&line) {
            Some(stats) => {
                let _ = tx.send(stats);
            }
            None => {
                if tail.len() == DIAGNOSTIC_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        };
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        handle_line(line, &mut tail);
                    }
                }
            }
        }
        if let Some(line) = splitter.finish() {
            handle_line(line, &mut tail);
        }
        tail
    })
}

async fn collect_diagnostics(reader: Option<JoinHandle<VecDeque<String>>>) -> Vec<String> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    match timeout(Duration::from_secs(2), reader).await {
        Ok(Ok(tail)) => tail.into_iter().collect(),
        _ => Vec::new(),
    }
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

pub(crate) async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

#[cfg(all(test, unix))]
pub(crate) mod fakes {
    //! Shell-script stand-ins for ffmpeg and ffprobe.

    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// ffprobe reporting a 10 second h264 video for any input.
    pub fn ffprobe(dir: &Path) -> PathBuf {
        write_script(
            dir,
            "ffprobe",
            r#"cat <<'JSON'
{"streams":[{"codec_type":"video","codec_name":"h264","width":1280,"height":720},{"codec_type":"audio","codec_name":"aac","channels":2}],"format":{"duration":"10.0","size":"1000"}}
JSON"#,
        )
    }

    /// ffmpeg that writes `bytes` to its output, reports progress, then runs `tail`.
    pub fn ffmpeg(dir: &Path, bytes: u64, tail: &str) -> PathBuf {
        write_script(
            dir,
            "ffmpeg",
            &format!(
                r#"for last; do :; done
printf 'frame=  100 fps=50 q=28.0 size=  100kB time=00:00:05.00 bitrate=1000kbits/s speed=2.0x\r' >&2
head -c {} /dev/zero > "$last"
{}"#,
                bytes, tail
            ),
        )
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::fakes;
    use super::*;
    use relay_daemon_config::ProfileName;
    use std::time::Instant as StdInstant;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        dir: TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.mkv");
        std::fs::write(&input, vec![0u8; 4096]).unwrap();
        let output = dir.path().join("encodes").join("out.mp4");
        Fixture { dir, input, output }
    }

    fn settings(fx: &Fixture, ffmpeg: PathBuf) -> TranscodeSettings {
        let mut s = TranscodeSettings::from_config(&TranscodeConfig::default());
        s.ffmpeg = ffmpeg.display().to_string();
        s.ffprobe = fakes::ffprobe(fx.dir.path()).display().to_string();
        s.poll_interval = Duration::from_millis(50);
        s.stall_timeout = Duration::from_millis(600);
        s.process_timeout = Duration::from_secs(20);
        s.grace_period = Duration::from_millis(100);
        s
    }

    fn request(fx: &Fixture, target_mb: f64) -> TranscodeRequest {
        TranscodeRequest {
            input: fx.input.clone(),
            output: fx.output.clone(),
            target_size_mb: target_mb,
            profile: QualityProfile::builtin(ProfileName::Hd720),
        }
    }

    #[tokio::test]
    async fn test_successful_transcode_is_verified() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 500_000, "exit 0");
        let coordinator = TranscodeCoordinator::new(settings(&fx, ffmpeg));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(crate::task::TaskId::new(), tx);

        let out = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &reporter)
            .await
            .unwrap();

        assert_eq!(out.size_bytes, 500_000);
        assert!(fx.output.exists());
        assert!((out.duration_secs - 10.0).abs() < 1e-9);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.record.phase, Phase::Encoding(ProfileName::Hd720));
    }

    #[tokio::test]
    async fn test_configured_encoder_reaches_ffmpeg() {
        let fx = fixture();
        // Exits non-zero unless invoked with the GPU rate control flags.
        let ffmpeg = fakes::ffmpeg(
            fx.dir.path(),
            500_000,
            r#"case " $* " in *" -c:v h264_nvenc -preset p5 "*" -rc vbr "*) exit 0 ;; *) exit 1 ;; esac"#,
        );

        let mut config = TranscodeConfig::default();
        config.hw_encoder = Some("h264_nvenc".into());
        let mut s = settings(&fx, ffmpeg.clone());
        s.encoder = TranscodeSettings::from_config(&config).encoder;
        assert_eq!(s.encoder, VideoEncoder::Hardware("h264_nvenc".into()));
        let out = TranscodeCoordinator::new(s)
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap();
        assert_eq!(out.size_bytes, 500_000);

        let software = settings(&fx, ffmpeg);
        assert_eq!(software.encoder, VideoEncoder::Software("libx264".into()));
        let err = TranscodeCoordinator::new(software)
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::ProcessFailed { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_non_positive_budget_rejected_before_spawn() {
        let fx = fixture();
        let coordinator = TranscodeCoordinator::new(settings(&fx, fx.dir.path().join("missing-ffmpeg")));
        for budget in [0.0, -5.0] {
            let err = coordinator
                .transcode(&request(&fx, budget), &CancellationToken::new(), &ProgressReporter::detached())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::InvalidRequest(_)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_missing_input() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 10, "exit 0");
        let coordinator = TranscodeCoordinator::new(settings(&fx, ffmpeg));
        let mut req = request(&fx, 1.0);
        req.input = fx.dir.path().join("nope.mkv");
        let err = coordinator
            .transcode(&req, &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::InputMissing(_)));
    }

    #[tokio::test]
    async fn test_input_over_limit_rejected() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 10, "exit 0");
        let mut s = settings(&fx, ffmpeg);
        s.max_input_bytes = 1024;
        let coordinator = TranscodeCoordinator::new(s);
        let err = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::InputTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_diagnostics_and_cleans_up() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(
            fx.dir.path(),
            1000,
            "echo 'Conversion failed!' >&2\nexit 1",
        );
        let coordinator = TranscodeCoordinator::new(settings(&fx, ffmpeg));
        let err = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        match err {
            TranscodeError::ProcessFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("Conversion failed!"), "{}", diagnostics)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_stall_detected_after_timeout() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 1000, "exec sleep 30");
        let s = settings(&fx, ffmpeg);
        let stall = s.stall_timeout;
        let coordinator = TranscodeCoordinator::new(s);

        let started = StdInstant::now();
        let err = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Stalled(_)), "{:?}", err);
        assert!(started.elapsed() >= stall);
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_in_flight_overrun_stops_encode() {
        let fx = fixture();
        // 2 MB against a 1 MB budget, then hang.
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 2 * 1024 * 1024, "exec sleep 30");
        let coordinator = TranscodeCoordinator::new(settings(&fx, ffmpeg));
        let err = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::OverBudget(_)), "{:?}", err);
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_final_size_over_tolerance_fails() {
        let fx = fixture();
        // Exits immediately with an oversized file, before any poll can see it.
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 1_200_000, "exit 0");
        let mut s = settings(&fx, ffmpeg);
        s.poll_interval = Duration::from_secs(10);
        let coordinator = TranscodeCoordinator::new(s);
        let err = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await;
        // The first tick fires immediately, so either check may catch it.
        assert!(matches!(err, Err(TranscodeError::OverBudget(_))), "{:?}", err);
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_cancellation_terminates_and_cleans_up() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(fx.dir.path(), 1000, "exec sleep 30");
        let coordinator = TranscodeCoordinator::new(settings(&fx, ffmpeg));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = StdInstant::now();
        let err = coordinator
            .transcode(&request(&fx, 1.0), &cancel, &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_process_timeout_enforced_despite_growth() {
        let fx = fixture();
        let ffmpeg = fakes::ffmpeg(
            fx.dir.path(),
            10,
            "while true; do printf x >> \"$last\"; sleep 0.05; done",
        );
        let mut s = settings(&fx, ffmpeg);
        s.process_timeout = Duration::from_millis(700);
        let coordinator = TranscodeCoordinator::new(s);
        let err = coordinator
            .transcode(&request(&fx, 1.0), &CancellationToken::new(), &ProgressReporter::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout(_)), "{:?}", err);
        assert!(!fx.output.exists());
    }
}
