//! Startup checks and working directory housekeeping
//!
//! Before the daemon accepts work it verifies the external tools it drives:
//! - `ffmpeg -version` runs and reports a usable major version
//! - `ffprobe -version` runs
//! - `aria2c --version` runs (only when the daemon process is spawned locally)
//!
//! A configured hardware encoder gets a one-frame test encode; when that
//! fails the software codec is used for the rest of the run.
//!
//! Working directories are created on start and emptied on shutdown.

use crate::config::{Config, TranscodeConfig};
use crate::encode::ffmpeg::{test_encode_args, VideoEncoder};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Oldest ffmpeg major version the transcoder arguments are known to work with
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `binary <flag>` and return the first line of its output.
pub fn check_tool(binary: &str, version_flag: &str) -> Result<String, StartupError> {
    let output = Command::new(binary)
        .arg(version_flag)
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: binary.to_string(),
            reason: format!("{} {} failed; is it installed and in PATH? Error: {}", binary, version_flag, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: binary.to_string(),
            reason: format!("{} {} exited with {}", binary, version_flag, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that ffmpeg runs and is recent enough. Builds whose version string
/// can't be parsed (git snapshots) are accepted with a warning.
pub fn check_ffmpeg(binary: &str) -> Result<Option<u32>, StartupError> {
    let line = check_tool(binary, "-version")?;
    match parse_ffmpeg_version(&line) {
        Some(major) if major < MIN_FFMPEG_MAJOR => Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        ))),
        Some(major) => {
            debug!(major, "ffmpeg version ok");
            Ok(Some(major))
        }
        None => {
            warn!(version = %line, "could not parse ffmpeg version, continuing");
            Ok(None)
        }
    }
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability and version
/// 2. ffprobe availability
/// 3. aria2c availability, when the daemon is spawned locally
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg(&cfg.transcode.ffmpeg_path)?;
    let ffprobe = check_tool(&cfg.transcode.ffprobe_path, "-version")?;
    debug!(version = %ffprobe, "ffprobe available");
    if cfg.aria2.spawn {
        let aria2 = check_tool(&cfg.aria2.binary, "--version")?;
        debug!(version = %aria2, "aria2c available");
    }
    info!("startup checks passed");
    Ok(())
}

/// Whether `codec` can encode a single test frame on this host.
pub fn hw_encoder_available(ffmpeg: &str, codec: &str) -> bool {
    match Command::new(ffmpeg).args(test_encode_args(codec)).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(codec, status = %output.status, stderr = %stderr.trim(), "test encode failed");
            false
        }
        Err(e) => {
            debug!(codec, error = %e, "test encode could not run");
            false
        }
    }
}

/// Pick the video encoder once. An unusable `hw_encoder` is cleared from
/// the config so every later consumer sees the software codec.
pub fn resolve_video_encoder(cfg: &mut TranscodeConfig) -> VideoEncoder {
    let Some(codec) = cfg.hw_encoder.clone() else {
        return VideoEncoder::Software(cfg.video_codec.clone());
    };
    if hw_encoder_available(&cfg.ffmpeg_path, &codec) {
        info!(codec = %codec, "hardware encoder available");
        VideoEncoder::Hardware(codec)
    } else {
        warn!(
            codec = %codec,
            fallback = %cfg.video_codec,
            "hardware encoder unusable, falling back to software"
        );
        cfg.hw_encoder = None;
        VideoEncoder::Software(cfg.video_codec.clone())
    }
}

/// Create the download and encode directories.
pub async fn prepare_work_dirs(cfg: &Config) -> Result<(), StartupError> {
    for dir in [&cfg.paths.downloads_dir, &cfg.paths.encodes_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Remove everything inside the working directories, keeping the directories.
/// Returns the number of entries removed.
pub async fn clear_work_dirs(cfg: &Config) -> usize {
    let mut removed = 0;
    for dir in [&cfg.paths.downloads_dir, &cfg.paths.encodes_dir] {
        removed += clear_dir(dir).await;
    }
    if removed > 0 {
        info!(removed, "working directories cleared");
    }
    removed
}

async fn clear_dir(dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let result = match entry.file_type().await {
            Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove leftover"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            suffix in "[a-z0-9]{0,8}",
        ) {
            let version_output = format!("ffmpeg version n{}.{}-{} Copyright", major, minor, suffix);
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = "built with gcc 13\nffmpeg version 6.1.1-3ubuntu5 Copyright\nconfiguration: --enable-libx264";
        assert_eq!(parse_ffmpeg_version(output), Some(6));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-112233-gdeadbeef"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let err = check_tool("definitely-not-a-real-binary-name", "--version").unwrap_err();
        match err {
            StartupError::ToolUnavailable { tool, .. } => {
                assert_eq!(tool, "definitely-not-a-real-binary-name")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        #[test]
        fn test_ffmpeg_version_gate() {
            let dir = tempfile::tempdir().unwrap();
            let modern = script(dir.path(), "ffmpeg6", "echo 'ffmpeg version 6.1 Copyright'");
            let ancient = script(dir.path(), "ffmpeg3", "echo 'ffmpeg version 3.4.8 Copyright'");
            let snapshot = script(dir.path(), "ffmpegN", "echo 'ffmpeg version N-1234-gabc Copyright'");
            let broken = script(dir.path(), "ffmpegX", "exit 1");

            assert_eq!(check_ffmpeg(&modern).unwrap(), Some(6));
            assert!(matches!(check_ffmpeg(&ancient), Err(StartupError::FfmpegVersion(_))));
            assert_eq!(check_ffmpeg(&snapshot).unwrap(), None);
            assert!(matches!(check_ffmpeg(&broken), Err(StartupError::ToolUnavailable { .. })));
        }

        #[test]
        fn test_aria2_only_checked_when_spawned() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = Config::default();
            cfg.transcode.ffmpeg_path = script(dir.path(), "ffmpeg", "echo 'ffmpeg version 7.0'");
            cfg.transcode.ffprobe_path = script(dir.path(), "ffprobe", "echo 'ffprobe version 7.0'");
            cfg.aria2.binary = dir.path().join("missing-aria2c").display().to_string();

            cfg.aria2.spawn = false;
            assert!(run_startup_checks(&cfg).is_ok());

            cfg.aria2.spawn = true;
            assert!(matches!(
                run_startup_checks(&cfg),
                Err(StartupError::ToolUnavailable { .. })
            ));
        }

        #[test]
        fn test_working_hw_encoder_is_kept() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = TranscodeConfig {
                hw_encoder: Some("h264_nvenc".into()),
                ..TranscodeConfig::default()
            };
            // Succeeds only for a one-frame encode with the requested codec.
            cfg.ffmpeg_path = script(
                dir.path(),
                "ffmpeg",
                r#"case " $* " in *" -frames:v 1 "*" -c:v h264_nvenc "*) exit 0 ;; *) exit 1 ;; esac"#,
            );

            let encoder = resolve_video_encoder(&mut cfg);
            assert_eq!(encoder, VideoEncoder::Hardware("h264_nvenc".into()));
            assert_eq!(cfg.hw_encoder.as_deref(), Some("h264_nvenc"));
        }

        #[test]
        fn test_failing_hw_encoder_falls_back_to_software() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = TranscodeConfig {
                hw_encoder: Some("h264_nvenc".into()),
                ..TranscodeConfig::default()
            };
            cfg.ffmpeg_path = script(
                dir.path(),
                "ffmpeg",
                "echo 'Cannot load libcuda.so.1' >&2\nexit 1",
            );

            let encoder = resolve_video_encoder(&mut cfg);
            assert_eq!(encoder, VideoEncoder::Software("libx264".into()));
            assert_eq!(cfg.hw_encoder, None);
        }

        #[test]
        fn test_missing_ffmpeg_means_no_hw_encoder() {
            let dir = tempfile::tempdir().unwrap();
            let missing = dir.path().join("missing-ffmpeg").display().to_string();
            assert!(!hw_encoder_available(&missing, "h264_nvenc"));
        }
    }

    #[test]
    fn test_no_hw_encoder_configured_skips_test_encode() {
        let mut cfg = TranscodeConfig {
            ffmpeg_path: "definitely-not-a-real-binary-name".into(),
            ..TranscodeConfig::default()
        };
        assert_eq!(resolve_video_encoder(&mut cfg), VideoEncoder::Software("libx264".into()));
    }

    #[tokio::test]
    async fn test_prepare_and_clear_work_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.downloads_dir = dir.path().join("downloads");
        cfg.paths.encodes_dir = dir.path().join("encodes");

        prepare_work_dirs(&cfg).await.unwrap();
        assert!(cfg.paths.downloads_dir.is_dir());
        assert!(cfg.paths.encodes_dir.is_dir());

        std::fs::create_dir_all(cfg.paths.downloads_dir.join("abc")).unwrap();
        std::fs::write(cfg.paths.downloads_dir.join("abc/movie.mkv"), b"x").unwrap();
        std::fs::write(cfg.paths.encodes_dir.join("movie_720p.mp4"), b"y").unwrap();

        assert_eq!(clear_work_dirs(&cfg).await, 2);
        assert!(cfg.paths.downloads_dir.is_dir());
        assert_eq!(std::fs::read_dir(&cfg.paths.encodes_dir).unwrap().count(), 0);
        assert_eq!(clear_work_dirs(&cfg).await, 0);
    }
}
