//! Typed JSON-RPC client for the aria2 download daemon.

use crate::retry::Cancelled;
use relay_daemon_config::{Aria2Config, DownloadConfig};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for RPC calls
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Endpoint unreachable, connection reset, etc.
    #[error("Connection to download daemon failed: {0}")]
    Transport(String),

    #[error("RPC call {method} timed out")]
    Timeout { method: String },

    /// The daemon answered with a JSON-RPC error object.
    #[error("Download daemon error {code}: {message}")]
    Daemon { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Decode(String),

    /// The caller gave up before the call finished.
    #[error("RPC call cancelled")]
    Cancelled,
}

impl From<Cancelled> for RpcError {
    fn from(_: Cancelled) -> Self {
        RpcError::Cancelled
    }
}

impl RpcError {
    /// Network-level failures worth retrying after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout { .. })
    }

    /// The daemon does not know the transfer handle (e.g. after a restart).
    pub fn is_unknown_handle(&self) -> bool {
        matches!(self, RpcError::Daemon { message, .. } if message.contains("is not found"))
    }

    /// A daemon-side error that may mean the instance itself is broken.
    /// Unknown handles have their own recovery path.
    pub fn is_daemon_fault(&self) -> bool {
        matches!(self, RpcError::Daemon { .. }) && !self.is_unknown_handle()
    }
}

/// Where the daemon's RPC interface listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
    pub secret: String,
}

impl RpcEndpoint {
    pub fn from_config(config: &Aria2Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            secret: config.secret.clone(),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/jsonrpc", self.host, self.port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

/// Lifecycle state the daemon reports for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferFile {
    #[serde(default)]
    pub path: String,
}

/// Subset of `aria2.tellStatus`. The daemon encodes numbers as strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub gid: String,
    pub status: TransferState,
    #[serde(default, deserialize_with = "de_u64")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub download_speed: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub connections: u64,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Handles of transfers spawned by this one (metadata resolution).
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub files: Vec<TransferFile>,
}

impl TransferStatus {
    pub fn has_failed(&self) -> bool {
        matches!(self.status, TransferState::Error | TransferState::Removed)
    }

    pub fn is_complete(&self) -> bool {
        self.status == TransferState::Complete
    }

    /// Bytes are flowing, as opposed to merely accepted.
    pub fn started(&self) -> bool {
        self.completed_length > 0 || self.download_speed > 0
    }

    pub fn total(&self) -> Option<u64> {
        (self.total_length > 0).then_some(self.total_length)
    }

    /// First file the transfer writes, if the daemon has named it yet.
    pub fn primary_file(&self) -> Option<PathBuf> {
        self.files
            .iter()
            .find(|f| !f.path.is_empty() && !f.path.starts_with("[METADATA]"))
            .map(|f| PathBuf::from(&f.path))
    }

    pub fn failure_reason(&self) -> String {
        match (&self.error_code, &self.error_message) {
            (_, Some(message)) if !message.is_empty() => message.clone(),
            (Some(code), _) => format!("daemon error code {}", code),
            _ => format!("transfer {}", match self.status {
                TransferState::Removed => "was removed",
                _ => "failed",
            }),
        }
    }
}

fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.is_empty() => Ok(0),
        Value::String(s) => s.parse().map_err(de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom("negative length")),
        Value::Null => Ok(0),
        other => Err(de::Error::custom(format!("expected numeric string, got {}", other))),
    }
}

/// Per-transfer options handed to `aria2.addUri`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    pub dir: PathBuf,
    pub max_connections_per_server: u32,
    pub split: u32,
    pub max_tries: u32,
    pub retry_wait_secs: u64,
    pub max_upload_limit: String,
}

impl TransferOptions {
    pub fn new(dir: &Path, download: &DownloadConfig, aria2: &Aria2Config) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_connections_per_server: download.max_connections_per_server,
            split: download.split,
            max_tries: download.max_tries,
            retry_wait_secs: download.retry_wait_secs,
            max_upload_limit: aria2.max_upload_limit.clone(),
        }
    }

    /// The daemon takes every option value as a string.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        let mut put = |key: &str, value: String| {
            map.insert(key.to_string(), Value::String(value));
        };
        put("dir", self.dir.display().to_string());
        put("max-connection-per-server", self.max_connections_per_server.to_string());
        put("split", self.split.to_string());
        put("continue", "true".to_string());
        put("max-tries", self.max_tries.to_string());
        put("retry-wait", self.retry_wait_secs.to_string());
        put("allow-overwrite", "true".to_string());
        put("auto-file-renaming", "false".to_string());
        put("follow-torrent", "true".to_string());
        put("seed-time", "0".to_string());
        put("max-upload-limit", self.max_upload_limit.clone());
        Value::Object(map)
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// JSON-RPC client bound to one endpoint. Cheap to rebuild; the supervisor
/// hands out a fresh one whenever the endpoint changes.
#[derive(Debug)]
pub struct Aria2Client {
    http: reqwest::Client,
    endpoint: RpcEndpoint,
    next_id: AtomicU64,
}

impl Aria2Client {
    pub fn new(endpoint: RpcEndpoint, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    /// Issue one call. The secret token is prepended to `params`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        let mut full_params = Vec::with_capacity(params.len() + 1);
        if !self.endpoint.secret.is_empty() {
            full_params.push(Value::String(format!("token:{}", self.endpoint.secret)));
        }
        full_params.extend(params);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": full_params,
        });
        debug!(method, id, "rpc call");

        let response = self
            .http
            .post(self.endpoint.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport(method, e))?;

        if response.status().is_server_error() {
            return Err(RpcError::Transport(format!("HTTP {}", response.status())));
        }

        // Daemon errors come back with a 4xx status and a JSON body; read it either way.
        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| match map_transport(method, e) {
                RpcError::Transport(msg) => RpcError::Decode(msg),
                other => other,
            })?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Daemon {
                code: err.code,
                message: err.message,
            });
        }
        let result = parsed
            .result
            .ok_or_else(|| RpcError::Decode(format!("{} returned neither result nor error", method)))?;
        serde_json::from_value(result).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Liveness probe; returns the daemon's version string.
    pub async fn get_version(&self) -> Result<String, RpcError> {
        #[derive(Deserialize)]
        struct Version {
            version: String,
        }
        let v: Version = self.call("aria2.getVersion", vec![]).await?;
        Ok(v.version)
    }

    /// Submit a transfer; returns the daemon-assigned handle (GID).
    pub async fn add_uri(&self, uri: &str, options: &TransferOptions) -> Result<String, RpcError> {
        self.call("aria2.addUri", vec![json!([uri]), options.to_json()])
            .await
    }

    pub async fn tell_status(&self, gid: &str) -> Result<TransferStatus, RpcError> {
        self.call("aria2.tellStatus", vec![json!(gid)]).await
    }

    pub async fn pause(&self, gid: &str) -> Result<(), RpcError> {
        let _: String = self.call("aria2.forcePause", vec![json!(gid)]).await?;
        Ok(())
    }

    pub async fn unpause(&self, gid: &str) -> Result<(), RpcError> {
        let _: String = self.call("aria2.unpause", vec![json!(gid)]).await?;
        Ok(())
    }

    pub async fn remove(&self, gid: &str) -> Result<(), RpcError> {
        let _: String = self.call("aria2.forceRemove", vec![json!(gid)]).await?;
        Ok(())
    }

    pub async fn remove_download_result(&self, gid: &str) -> Result<(), RpcError> {
        let _: String = self
            .call("aria2.removeDownloadResult", vec![json!(gid)])
            .await?;
        Ok(())
    }

    pub async fn save_session(&self) -> Result<(), RpcError> {
        let _: String = self.call("aria2.saveSession", vec![]).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), RpcError> {
        let _: String = self.call("aria2.shutdown", vec![]).await?;
        Ok(())
    }
}

fn map_transport(method: &str, err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout {
            method: method.to_string(),
        }
    } else {
        RpcError::Transport(err.to_string())
    }
}
