//! In-process stand-in for the aria2 JSON-RPC interface, used by tests.

use super::rpc::RpcEndpoint;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockState {
    secret: String,
    calls: Vec<String>,
    added_uris: Vec<String>,
    /// Status sequence per handle; the last entry repeats.
    scripts: HashMap<String, VecDeque<Value>>,
    /// Scripts assigned to the next `addUri` calls, in order.
    pending: VecDeque<Vec<Value>>,
    /// Replacement script installed when a handle is unpaused.
    after_unpause: HashMap<String, Vec<Value>>,
    next_gid: u64,
    reject_add: Option<String>,
    /// Daemon errors to answer a method with, and how many more times.
    faults: HashMap<String, (String, u32)>,
    /// Answer every call with 503, as if the daemon were gone.
    down: bool,
}

pub(crate) struct MockAria2 {
    state: Arc<Mutex<MockState>>,
    port: u16,
    secret: String,
    server: JoinHandle<()>,
}

/// A `tellStatus` body without its gid; the mock fills the gid in.
pub(crate) fn status_json(
    state: &str,
    completed: u64,
    total: u64,
    speed: u64,
    files: &[&str],
    followed_by: &[&str],
) -> Value {
    json!({
        "status": state,
        "completedLength": completed.to_string(),
        "totalLength": total.to_string(),
        "downloadSpeed": speed.to_string(),
        "connections": "1",
        "files": files.iter().map(|p| json!({"path": p})).collect::<Vec<_>>(),
        "followedBy": followed_by,
    })
}

impl MockAria2 {
    pub async fn start(secret: &str) -> Self {
        let state = Arc::new(Mutex::new(MockState {
            secret: secret.to_string(),
            ..MockState::default()
        }));
        let app = Router::new()
            .route("/jsonrpc", post(handle))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            state,
            port,
            secret: secret.to_string(),
            server,
        }
    }

    pub fn endpoint(&self) -> RpcEndpoint {
        RpcEndpoint {
            host: "127.0.0.1".to_string(),
            port: self.port,
            secret: self.secret.clone(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|m| m.as_str() == method).count()
    }

    pub fn added_uris(&self) -> Vec<String> {
        self.state.lock().unwrap().added_uris.clone()
    }

    pub fn script_next_transfer(&self, script: Vec<Value>) {
        self.state.lock().unwrap().pending.push_back(script);
    }

    pub fn script_transfer(&self, gid: &str, script: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(gid.to_string(), script.into());
    }

    pub fn script_after_unpause(&self, gid: &str, script: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .after_unpause
            .insert(gid.to_string(), script);
    }

    pub fn reject_adds(&self, message: &str) {
        self.state.lock().unwrap().reject_add = Some(message.to_string());
    }

    /// Answer the next `times` calls of `method` with a daemon error.
    pub fn fail_calls(&self, method: &str, message: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(method.to_string(), (message.to_string(), times));
    }

    /// Drop every known handle, as a freshly restarted daemon would.
    pub fn forget_transfers(&self) {
        self.state.lock().unwrap().scripts.clear();
    }

    /// Stop answering RPC. Pooled connections keep reaching the handler, so
    /// this is a flag rather than a server shutdown.
    pub fn stop(&self) {
        self.state.lock().unwrap().down = true;
    }

    pub fn revive(&self) {
        self.state.lock().unwrap().down = false;
    }
}

impl Drop for MockAria2 {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn rpc_error(id: &Value, code: i64, message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"id": id, "jsonrpc": "2.0", "error": {"code": code, "message": message}})),
    )
}

async fn handle(
    State(state): State<Arc<Mutex<MockState>>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let id = body["id"].clone();
    let method = body["method"].as_str().unwrap_or_default().to_string();
    let mut params: VecDeque<Value> = body["params"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into();

    let mut st = state.lock().unwrap();
    if st.down {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(Value::Null));
    }
    st.calls.push(method.clone());

    if !st.secret.is_empty() {
        let expected = format!("token:{}", st.secret);
        if params.pop_front().and_then(|v| v.as_str().map(String::from)) != Some(expected) {
            return rpc_error(&id, 1, "Unauthorized".to_string());
        }
    }

    if let Some((message, remaining)) = st.faults.get_mut(&method) {
        if *remaining > 0 {
            *remaining -= 1;
            let message = message.clone();
            return rpc_error(&id, 1, message);
        }
    }

    let gid_param = params
        .front()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let result = match method.as_str() {
        "aria2.getVersion" => json!({"version": "1.37.0", "enabledFeatures": []}),
        "aria2.addUri" => {
            if let Some(message) = st.reject_add.clone() {
                return rpc_error(&id, 1, message);
            }
            if let Some(uri) = params.front().and_then(|v| v[0].as_str()) {
                st.added_uris.push(uri.to_string());
            }
            st.next_gid += 1;
            let gid = format!("{:016x}", st.next_gid);
            let script = st
                .pending
                .pop_front()
                .unwrap_or_else(|| vec![status_json("waiting", 0, 0, 0, &[], &[])]);
            st.scripts.insert(gid.clone(), script.into());
            json!(gid)
        }
        "aria2.tellStatus" => {
            let Some(script) = st.scripts.get_mut(&gid_param) else {
                return rpc_error(&id, 1, format!("GID {} is not found", gid_param));
            };
            let mut status = if script.len() > 1 {
                script.pop_front().unwrap_or_default()
            } else {
                script.front().cloned().unwrap_or_default()
            };
            status["gid"] = json!(gid_param);
            status
        }
        "aria2.forcePause" | "aria2.forceRemove" | "aria2.removeDownloadResult" => {
            if !st.scripts.contains_key(&gid_param) {
                return rpc_error(&id, 1, format!("GID {} is not found", gid_param));
            }
            if method == "aria2.forceRemove" {
                st.scripts
                    .insert(gid_param.clone(), vec![status_json("removed", 0, 0, 0, &[], &[])].into());
            }
            json!(gid_param)
        }
        "aria2.unpause" => {
            if let Some(next) = st.after_unpause.remove(&gid_param) {
                st.scripts.insert(gid_param.clone(), next.into());
            }
            json!(gid_param)
        }
        "aria2.saveSession" | "aria2.shutdown" => json!("OK"),
        other => return rpc_error(&id, 1, format!("No such method: {}", other)),
    };

    (
        StatusCode::OK,
        Json(json!({"id": id, "jsonrpc": "2.0", "result": result})),
    )
}
