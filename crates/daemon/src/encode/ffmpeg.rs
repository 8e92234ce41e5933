//! ffmpeg command construction and progress-stream parsing.

use super::plan::BitratePlan;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Video encoder chosen at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEncoder {
    /// CPU encoder, rate controlled by CRF under a bitrate cap.
    Software(String),
    /// NVENC style GPU encoder, VBR under the same cap.
    Hardware(String),
}

impl VideoEncoder {
    pub fn codec(&self) -> &str {
        match self {
            Self::Software(codec) | Self::Hardware(codec) => codec,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware(_))
    }
}

impl fmt::Display for VideoEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software(codec) => write!(f, "{} (software)", codec),
            Self::Hardware(codec) => write!(f, "{} (hardware)", codec),
        }
    }
}

/// GPU presets ignore the x264 preset and tune names.
const HW_PRESET: &str = "p5";
const HW_TUNE: &str = "hq";
const HW_LOOKAHEAD: &str = "32";

/// Everything needed to build one transcoder invocation.
#[derive(Debug, Clone)]
pub struct FfmpegParams {
    pub ffmpeg: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub encoder: VideoEncoder,
    pub audio_codec: String,
    pub threads: u32,
}

/// Arguments for a single-pass, bitrate-capped encode scaled to the plan's height.
///
/// Stdin stays open so the process can be asked to quit with `q`.
pub fn build_ffmpeg_args(params: &FfmpegParams, plan: &BitratePlan) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-stats".into(),
        "-y".into(),
        "-i".into(),
        path_arg(&params.input),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a:0?".into(),
        "-c:v".into(),
        params.encoder.codec().to_string(),
    ];
    match &params.encoder {
        VideoEncoder::Software(_) => {
            args.extend(["-preset".to_string(), plan.preset.clone()]);
            if let Some(tune) = &plan.tune {
                args.extend(["-tune".to_string(), tune.clone()]);
            }
            args.extend(["-crf".to_string(), plan.crf.to_string()]);
        }
        VideoEncoder::Hardware(_) => {
            args.extend(
                ["-preset", HW_PRESET, "-tune", HW_TUNE, "-rc", "vbr", "-rc-lookahead", HW_LOOKAHEAD]
                    .map(String::from),
            );
        }
    }
    args.extend([
        "-b:v".to_string(),
        plan.video_bps.to_string(),
        "-maxrate".to_string(),
        plan.maxrate_bps.to_string(),
        "-bufsize".to_string(),
        plan.bufsize_bits.to_string(),
        "-vf".to_string(),
        format!("scale=-2:{}", plan.height),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        params.audio_codec.clone(),
        "-b:a".to_string(),
        plan.audio_bps.to_string(),
        "-threads".to_string(),
        params.threads.to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        path_arg(&params.output),
    ]);
    args
}

/// Arguments for a one-frame test encode with `codec`, discarding the output.
/// Fails on hosts where the encoder is compiled in but no device is usable.
pub fn test_encode_args(codec: &str) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        "-f",
        "lavfi",
        "-i",
        "testsrc=duration=1:size=64x64:rate=1",
        "-frames:v",
        "1",
        "-c:v",
        codec,
        "-f",
        "null",
        "-",
    ]
    .map(String::from)
    .to_vec()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Build the ffmpeg command with piped stdin and stderr.
pub fn build_ffmpeg_command(params: &FfmpegParams, plan: &BitratePlan) -> Command {
    let mut cmd = Command::new(&params.ffmpeg);
    cmd.args(build_ffmpeg_args(params, plan))
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Fields of one `-stats` line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FfmpegProgress {
    pub frame: Option<u64>,
    /// Media time encoded so far.
    pub time_secs: Option<f64>,
    /// Encoding speed relative to realtime.
    pub speed: Option<f64>,
}

/// Value following `key=`, skipping the padding ffmpeg puts after `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

/// Parse `HH:MM:SS.ms` (hours may exceed 24, sign allowed).
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let (negative, value) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    Some(if negative { -total } else { total })
}

/// Parse a progress line. Returns None for lines carrying neither frame nor time.
pub fn parse_progress_line(line: &str) -> Option<FfmpegProgress> {
    let frame = field(line, "frame=").and_then(|v| v.parse().ok());
    let time_secs = field(line, "time=")
        .and_then(parse_timestamp)
        .filter(|t| *t >= 0.0);
    if frame.is_none() && time_secs.is_none() {
        return None;
    }
    let speed = field(line, "speed=")
        .and_then(|v| v.trim_end_matches('x').parse().ok());
    Some(FfmpegProgress {
        frame,
        time_secs,
        speed,
    })
}

/// Percent of the input encoded, from media time.
pub fn percent_from_time(time_secs: f64, duration_secs: f64) -> f64 {
    if duration_secs <= 0.0 {
        return 0.0;
    }
    (time_secs / duration_secs * 100.0).clamp(0.0, 100.0)
}

/// Splits a byte stream into records on `\r` or `\n`; ffmpeg rewrites its
/// stats line with carriage returns.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Remaining partial record at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).trim().to_string();
            self.pending.clear();
            if !line.is_empty() {
                lines.push(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn plan() -> BitratePlan {
        BitratePlan {
            video_bps: 800_000,
            maxrate_bps: 960_000,
            bufsize_bits: 1_600_000,
            audio_bps: 96_000,
            height: 720,
            preset: "medium".into(),
            crf: 24,
            tune: Some("film".into()),
            budget_bytes: 100,
            clamped: false,
        }
    }

    fn params() -> FfmpegParams {
        FfmpegParams {
            ffmpeg: "ffmpeg".into(),
            input: PathBuf::from("/dl/in put.mkv"),
            output: PathBuf::from("/enc/out.mp4"),
            encoder: VideoEncoder::Software("libx264".into()),
            audio_codec: "aac".into(),
            threads: 8,
        }
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_args_complete() {
        let args = build_ffmpeg_args(&params(), &plan());
        assert!(has_flag_with_value(&args, "-i", "/dl/in put.mkv"));
        assert!(has_flag_with_value(&args, "-c:v", "libx264"));
        assert!(has_flag_with_value(&args, "-b:v", "800000"));
        assert!(has_flag_with_value(&args, "-maxrate", "960000"));
        assert!(has_flag_with_value(&args, "-bufsize", "1600000"));
        assert!(has_flag_with_value(&args, "-vf", "scale=-2:720"));
        assert!(has_flag_with_value(&args, "-preset", "medium"));
        assert!(has_flag_with_value(&args, "-tune", "film"));
        assert!(has_flag_with_value(&args, "-crf", "24"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
        assert!(has_flag_with_value(&args, "-b:a", "96000"));
        assert!(has_flag_with_value(&args, "-threads", "8"));
        assert!(args.contains(&"-stats".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/enc/out.mp4"));
        assert!(!args.contains(&"-nostdin".to_string()));
    }

    #[test]
    fn test_args_without_tune() {
        let mut p = plan();
        p.tune = None;
        let args = build_ffmpeg_args(&params(), &p);
        assert!(!args.contains(&"-tune".to_string()));
    }

    #[test]
    fn test_hardware_args_use_vbr_without_crf() {
        let mut p = params();
        p.encoder = VideoEncoder::Hardware("h264_nvenc".into());
        let args = build_ffmpeg_args(&p, &plan());
        assert!(has_flag_with_value(&args, "-c:v", "h264_nvenc"));
        assert!(has_flag_with_value(&args, "-preset", "p5"));
        assert!(has_flag_with_value(&args, "-tune", "hq"));
        assert!(has_flag_with_value(&args, "-rc", "vbr"));
        assert!(has_flag_with_value(&args, "-b:v", "800000"));
        assert!(has_flag_with_value(&args, "-maxrate", "960000"));
        assert!(!args.contains(&"-crf".to_string()));
        assert!(!args.contains(&"film".to_string()));
        assert!(!args.contains(&"medium".to_string()));
    }

    #[test]
    fn test_test_encode_args() {
        let args = test_encode_args("h264_nvenc");
        assert!(has_flag_with_value(&args, "-c:v", "h264_nvenc"));
        assert!(has_flag_with_value(&args, "-frames:v", "1"));
        assert!(has_flag_with_value(&args, "-f", "lavfi"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_parse_stats_line() {
        let line = "frame= 1234 fps= 50 q=28.0 size=   10240kB time=00:01:23.45 bitrate=1005.2kbits/s speed=1.97x";
        let progress = parse_progress_line(line).unwrap();
        assert_eq!(progress.frame, Some(1234));
        assert!((progress.time_secs.unwrap() - 83.45).abs() < 1e-9);
        assert!((progress.speed.unwrap() - 1.97).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ignores_diagnostics() {
        assert_eq!(parse_progress_line("Error opening input file"), None);
        let na = parse_progress_line("frame=    0 fps=0.0 time=N/A bitrate=N/A").unwrap();
        assert_eq!(na.frame, Some(0));
        assert_eq!(na.time_secs, None);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("01:00:00.00"), Some(3600.0));
        assert_eq!(parse_timestamp("bad"), None);
        assert_eq!(parse_timestamp("-00:00:01.00"), Some(-1.0));
    }

    #[test]
    fn test_splitter_handles_carriage_returns_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"frame=  1 time=00:00:0").is_empty());
        let lines = splitter.push(b"1.00\rframe=  2 time=00:00:02.00\r\nwarn");
        assert_eq!(lines, vec!["frame=  1 time=00:00:01.00", "frame=  2 time=00:00:02.00"]);
        assert_eq!(splitter.finish().as_deref(), Some("warn"));
        assert_eq!(splitter.finish(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_timestamp_round_trip(h in 0u32..100, m in 0u32..60, s in 0u32..60, cs in 0u32..100) {
            let text = format!("{:02}:{:02}:{:02}.{:02}", h, m, s, cs);
            let parsed = parse_timestamp(&text).unwrap();
            let expected = h as f64 * 3600.0 + m as f64 * 60.0 + s as f64 + cs as f64 / 100.0;
            prop_assert!((parsed - expected).abs() < 1e-6);
        }

        #[test]
        fn prop_percent_from_time_bounded(t in -10.0f64..1e6, d in -10.0f64..1e6) {
            let p = percent_from_time(t, d);
            prop_assert!((0.0..=100.0).contains(&p));
        }
    }
}
