//! Core configuration structures and loading logic

use crate::profile::{default_profiles, ProfileName, QualityProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but is not usable; the daemon refuses to start
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Download daemon (aria2) connection and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aria2Config {
    #[serde(default = "default_aria2_host")]
    pub host: String,
    #[serde(default = "default_aria2_port")]
    pub port: u16,
    /// RPC secret; sent as `token:<secret>` with every call
    #[serde(default)]
    pub secret: String,
    /// Executable used when the daemon is supervised locally
    #[serde(default = "default_aria2_binary")]
    pub binary: String,
    /// Launch and supervise the daemon (false = attach to an external instance)
    #[serde(default = "default_true")]
    pub spawn: bool,
    /// How long to wait for the RPC endpoint to answer after launch
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Per-request RPC timeout
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// How many ports above `port` to try when it is taken
    #[serde(default = "default_port_scan_span")]
    pub port_scan_span: u16,
    /// Overall upload cap handed to the daemon (it downloads, it does not seed)
    #[serde(default = "default_max_upload_limit")]
    pub max_upload_limit: String,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u32,
    /// Session file that lets transfers survive a daemon restart
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

fn default_aria2_host() -> String {
    "127.0.0.1".to_string()
}

fn default_aria2_port() -> u16 {
    6800
}

fn default_aria2_binary() -> String {
    "aria2c".to_string()
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout_secs() -> u64 {
    15
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

fn default_port_scan_span() -> u16 {
    20
}

fn default_max_upload_limit() -> String {
    "64K".to_string()
}

fn default_max_concurrent_downloads() -> u32 {
    3
}

impl Default for Aria2Config {
    fn default() -> Self {
        Self {
            host: default_aria2_host(),
            port: default_aria2_port(),
            secret: String::new(),
            binary: default_aria2_binary(),
            spawn: true,
            startup_timeout_secs: default_startup_timeout_secs(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            port_scan_span: default_port_scan_span(),
            max_upload_limit: default_max_upload_limit(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            session_file: None,
        }
    }
}

/// Working directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_encodes_dir")]
    pub encodes_dir: PathBuf,
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_encodes_dir() -> PathBuf {
    PathBuf::from("encodes")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            encodes_dir: default_encodes_dir(),
        }
    }
}

/// Download phase thresholds and transfer options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Gap between the two size samples of the stability check
    #[serde(default = "default_verify_window_ms")]
    pub verify_window_ms: u64,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_connections")]
    pub max_connections_per_server: u32,
    #[serde(default = "default_connections")]
    pub split: u32,
    /// Per-transfer retry count handled by the daemon itself
    #[serde(default = "default_daemon_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stall_timeout_secs() -> u64 {
    120
}

fn default_metadata_timeout_secs() -> u64 {
    60
}

fn default_download_timeout_secs() -> u64 {
    600
}

fn default_verify_window_ms() -> u64 {
    2000
}

fn default_verify_attempts() -> u32 {
    30
}

fn default_connections() -> u32 {
    16
}

fn default_daemon_max_tries() -> u32 {
    5
}

fn default_retry_wait_secs() -> u64 {
    3
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            verify_window_ms: default_verify_window_ms(),
            verify_attempts: default_verify_attempts(),
            max_connections_per_server: default_connections(),
            split: default_connections(),
            max_tries: default_daemon_max_tries(),
            retry_wait_secs: default_retry_wait_secs(),
        }
    }
}

/// Transcoder invocation and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Software encoder, also the fallback when the hardware encoder is unusable
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Hardware encoder to prefer, e.g. "h264_nvenc". Checked with a
    /// one-frame test encode at startup.
    #[serde(default)]
    pub hw_encoder: Option<String>,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
    /// Time between the graceful stop request and a forced kill
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Fraction of the size budget the bitrate plan aims for, in (0, 1]
    #[serde(default = "default_size_margin")]
    pub size_margin: f64,
    /// Final output may exceed the budget by this factor before it is a failure
    #[serde(default = "default_tolerance_factor")]
    pub tolerance_factor: f64,
    #[serde(default = "default_min_video_bitrate_kbps")]
    pub min_video_bitrate_kbps: u64,
    #[serde(default = "default_max_video_bitrate_kbps")]
    pub max_video_bitrate_kbps: u64,
    #[serde(default = "default_maxrate_factor")]
    pub maxrate_factor: f64,
    #[serde(default = "default_bufsize_factor")]
    pub bufsize_factor: f64,
    /// Inputs larger than this are rejected before transcoding
    #[serde(default = "default_max_input_mb")]
    pub max_input_mb: f64,
    /// Encoder threads (auto-detected if None)
    #[serde(default)]
    pub threads: Option<u32>,
    /// Preset used when the input codec is already efficient
    #[serde(default = "default_fast_preset")]
    pub fast_preset: String,
    #[serde(default = "default_efficient_codecs")]
    pub efficient_codecs: Vec<String>,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_process_timeout_secs() -> u64 {
    7200
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_size_margin() -> f64 {
    0.97
}

fn default_tolerance_factor() -> f64 {
    1.05
}

fn default_min_video_bitrate_kbps() -> u64 {
    150
}

fn default_max_video_bitrate_kbps() -> u64 {
    20_000
}

fn default_maxrate_factor() -> f64 {
    1.2
}

fn default_bufsize_factor() -> f64 {
    2.0
}

fn default_max_input_mb() -> f64 {
    1500.0
}

fn default_fast_preset() -> String {
    "veryfast".to_string()
}

fn default_efficient_codecs() -> Vec<String> {
    vec!["hevc".to_string(), "av1".to_string(), "vp9".to_string()]
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            video_codec: default_video_codec(),
            hw_encoder: None,
            audio_codec: default_audio_codec(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            process_timeout_secs: default_process_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
            size_margin: default_size_margin(),
            tolerance_factor: default_tolerance_factor(),
            min_video_bitrate_kbps: default_min_video_bitrate_kbps(),
            max_video_bitrate_kbps: default_max_video_bitrate_kbps(),
            maxrate_factor: default_maxrate_factor(),
            bufsize_factor: default_bufsize_factor(),
            max_input_mb: default_max_input_mb(),
            threads: None,
            fast_preset: default_fast_preset(),
            efficient_codecs: default_efficient_codecs(),
        }
    }
}

/// Shared retry/backoff policy for RPC and supervisor calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Host resource sampling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_warn_percent")]
    pub memory_warn_percent: f32,
    #[serde(default = "default_warn_percent")]
    pub cpu_warn_percent: f32,
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_warn_percent() -> f32 {
    90.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            memory_warn_percent: default_warn_percent(),
            cpu_warn_percent: default_warn_percent(),
        }
    }
}

/// Admission loop, watchdog and upload settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// No progress for this long flags the active task as stalled
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,
    #[serde(default = "default_upload_retry_delay_secs")]
    pub upload_retry_delay_secs: u64,
}

fn default_watchdog_interval_secs() -> u64 {
    5
}

fn default_stall_threshold_secs() -> u64 {
    180
}

fn default_upload_attempts() -> u32 {
    3
}

fn default_upload_retry_delay_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: default_watchdog_interval_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            upload_attempts: default_upload_attempts(),
            upload_retry_delay_secs: default_upload_retry_delay_secs(),
        }
    }
}

/// Read-only status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_status_listen")]
    pub listen: String,
}

fn default_status_listen() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_status_listen(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub aria2: Aria2Config,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<QualityProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aria2: Aria2Config::default(),
            paths: PathsConfig::default(),
            download: DownloadConfig::default(),
            transcode: TranscodeConfig::default(),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
            status: StatusConfig::default(),
            profiles: default_profiles(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ARIA2_HOST -> aria2.host
    /// - ARIA2_PORT -> aria2.port
    /// - ARIA2_SECRET -> aria2.secret
    /// - RELAY_DOWNLOADS_DIR -> paths.downloads_dir
    /// - RELAY_ENCODES_DIR -> paths.encodes_dir
    /// - RELAY_STALL_TIMEOUT_SECS -> download.stall_timeout_secs and transcode.stall_timeout_secs
    /// - RELAY_PROCESS_TIMEOUT_SECS -> transcode.process_timeout_secs
    /// - RELAY_MAX_RETRIES -> retry.max_attempts
    /// - RELAY_HW_ENCODER -> transcode.hw_encoder (empty disables it)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ARIA2_HOST") {
            if !val.trim().is_empty() {
                self.aria2.host = val;
            }
        }

        if let Ok(val) = env::var("ARIA2_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.aria2.port = port;
            }
        }

        if let Ok(val) = env::var("ARIA2_SECRET") {
            self.aria2.secret = val;
        }

        if let Ok(val) = env::var("RELAY_DOWNLOADS_DIR") {
            self.paths.downloads_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RELAY_ENCODES_DIR") {
            self.paths.encodes_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RELAY_STALL_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.download.stall_timeout_secs = secs;
                self.transcode.stall_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("RELAY_PROCESS_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.transcode.process_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("RELAY_MAX_RETRIES") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.retry.max_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("RELAY_HW_ENCODER") {
            let val = val.trim();
            self.transcode.hw_encoder = (!val.is_empty()).then(|| val.to_string());
        }
    }

    /// Reject configurations the daemon cannot run with.
    ///
    /// Checked once at startup so that nothing downstream has to default silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(reason)) };

        if self.profiles.is_empty() {
            return invalid("at least one quality profile is required".to_string());
        }
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.name) {
                return invalid(format!("profile {} is defined twice", profile.name));
            }
            if let Err(reason) = profile.check() {
                return invalid(reason);
            }
        }

        if self.aria2.host.trim().is_empty() {
            return invalid("aria2.host must not be empty".to_string());
        }
        if self.aria2.port == 0 {
            return invalid("aria2.port must be non-zero".to_string());
        }

        let t = &self.transcode;
        if !(t.size_margin > 0.0 && t.size_margin <= 1.0) {
            return invalid(format!(
                "transcode.size_margin must be in (0, 1], got {}",
                t.size_margin
            ));
        }
        if !(t.tolerance_factor >= 1.0) {
            return invalid(format!(
                "transcode.tolerance_factor must be >= 1.0, got {}",
                t.tolerance_factor
            ));
        }
        if t.min_video_bitrate_kbps == 0 || t.min_video_bitrate_kbps > t.max_video_bitrate_kbps {
            return invalid(format!(
                "transcode bitrate bounds are inconsistent: min {} kbps, max {} kbps",
                t.min_video_bitrate_kbps, t.max_video_bitrate_kbps
            ));
        }

        let intervals = [
            ("download.poll_interval_ms", self.download.poll_interval_ms),
            ("download.stall_timeout_secs", self.download.stall_timeout_secs),
            ("download.download_timeout_secs", self.download.download_timeout_secs),
            ("transcode.poll_interval_ms", t.poll_interval_ms),
            ("transcode.stall_timeout_secs", t.stall_timeout_secs),
            ("transcode.process_timeout_secs", t.process_timeout_secs),
            ("monitor.interval_secs", self.monitor.interval_secs),
            ("scheduler.watchdog_interval_secs", self.scheduler.watchdog_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return invalid(format!("{} must be non-zero", name));
            }
        }

        if self.retry.max_attempts == 0 || self.scheduler.upload_attempts == 0 {
            return invalid("retry.max_attempts and scheduler.upload_attempts must be non-zero".to_string());
        }

        Ok(())
    }

    /// Look up a configured profile by name
    pub fn profile(&self, name: ProfileName) -> Option<&QualityProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("ARIA2_HOST");
        env::remove_var("ARIA2_PORT");
        env::remove_var("ARIA2_SECRET");
        env::remove_var("RELAY_DOWNLOADS_DIR");
        env::remove_var("RELAY_ENCODES_DIR");
        env::remove_var("RELAY_STALL_TIMEOUT_SECS");
        env::remove_var("RELAY_PROCESS_TIMEOUT_SECS");
        env::remove_var("RELAY_MAX_RETRIES");
        env::remove_var("RELAY_HW_ENCODER");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_sections(
            port in 1u16..u16::MAX,
            stall in 1u64..10_000,
            tolerance in 1.0f64..2.0,
            budget in 1.0f64..5000.0,
            audio in 8u32..512,
        ) {
            let toml_str = format!(
                r#"
[aria2]
port = {}
secret = "s3cret"

[download]
stall_timeout_secs = {}

[transcode]
tolerance_factor = {}

[[profiles]]
name = "720p"
height = 720
target_size_mb = {}
audio_bitrate_kbps = {}
"#,
                port, stall, tolerance, budget, audio
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.aria2.port, port);
            prop_assert_eq!(config.aria2.secret.as_str(), "s3cret");
            prop_assert_eq!(config.download.stall_timeout_secs, stall);
            prop_assert!((config.transcode.tolerance_factor - tolerance).abs() < 1e-9);
            prop_assert_eq!(config.profiles.len(), 1);
            prop_assert_eq!(config.profiles[0].name, ProfileName::Hd720);
            prop_assert!((config.profiles[0].target_size_mb - budget).abs() < 1e-9);
            prop_assert_eq!(config.profiles[0].audio_bitrate_kbps, audio);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_aria2_port(
            initial in 1u16..30000,
            override_port in 1u16..u16::MAX,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[aria2]\nport = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ARIA2_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.aria2.port, override_port);
        }

        #[test]
        fn prop_env_overrides_stall_timeout(
            initial in 1u64..1000,
            override_secs in 1u64..100_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[download]\nstall_timeout_secs = {}\n[transcode]\nstall_timeout_secs = {}\n",
                initial, initial
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RELAY_STALL_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.download.stall_timeout_secs, override_secs);
            prop_assert_eq!(config.transcode.stall_timeout_secs, override_secs);
        }

        #[test]
        fn prop_validate_rejects_non_positive_budget(budget in -1000.0f64..=0.0) {
            let mut config = Config::default();
            config.profiles[0].target_size_mb = budget;
            let result = config.validate();
            prop_assert!(matches!(result, Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.aria2.host, "127.0.0.1");
        assert_eq!(config.aria2.port, 6800);
        assert!(config.aria2.spawn);
        assert_eq!(config.paths.downloads_dir, PathBuf::from("downloads"));
        assert_eq!(config.paths.encodes_dir, PathBuf::from("encodes"));
        assert_eq!(config.download.metadata_timeout_secs, 60);
        assert_eq!(config.download.download_timeout_secs, 600);
        assert!((config.transcode.tolerance_factor - 1.05).abs() < 1e-9);
        assert_eq!(config.scheduler.upload_attempts, 3);
        assert_eq!(config.profiles.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_secret_and_dirs() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("ARIA2_SECRET", "token-123");
        env::set_var("ARIA2_HOST", "aria.internal");
        env::set_var("RELAY_DOWNLOADS_DIR", "/var/relay/dl");
        env::set_var("RELAY_MAX_RETRIES", "7");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.aria2.secret, "token-123");
        assert_eq!(config.aria2.host, "aria.internal");
        assert_eq!(config.paths.downloads_dir, PathBuf::from("/var/relay/dl"));
        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn test_hw_encoder_from_toml_and_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        assert_eq!(Config::default().transcode.hw_encoder, None);
        let mut config = Config::parse_toml("[transcode]\nhw_encoder = \"h264_nvenc\"\n").unwrap();
        assert_eq!(config.transcode.hw_encoder.as_deref(), Some("h264_nvenc"));

        env::set_var("RELAY_HW_ENCODER", "");
        config.apply_env_overrides();
        assert_eq!(config.transcode.hw_encoder, None);

        env::set_var("RELAY_HW_ENCODER", "hevc_nvenc");
        config.apply_env_overrides();
        clear_env_vars();
        assert_eq!(config.transcode.hw_encoder.as_deref(), Some("hevc_nvenc"));
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("ARIA2_PORT", "not-a-port");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.aria2.port, 6800);
    }

    #[test]
    fn test_validate_rejects_duplicate_profiles() {
        let mut config = Config::default();
        let duplicate = config.profiles[0].clone();
        config.profiles.push(duplicate);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_validate_rejects_missing_profile_fields() {
        let toml_str = r#"
[[profiles]]
name = "480p"
height = 480
"#;
        assert!(matches!(Config::parse_toml(toml_str), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_tolerance_and_margin() {
        let mut config = Config::default();
        config.transcode.tolerance_factor = 0.9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transcode.size_margin = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.transcode.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transcode.poll_interval_ms"));
    }

    #[test]
    fn test_profile_lookup() {
        let config = Config::default();
        let profile = config.profile(ProfileName::Fhd1080).expect("1080p configured");
        assert_eq!(profile.height, 1080);
        assert!((profile.target_size_mb - 280.0).abs() < 1e-9);
    }
}
