//! HTTP control plane.
//!
//! Thin axum handlers that decode requests, pair them with a bounded(1)
//! reply channel and block (off the async runtime) until the manager
//! answers. PDEF upload/list/get work directly against the filesystem and
//! the parser; only capture start/stop/status round-trip through the
//! manager mailbox.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use netcap_core::messages::{CaptureRequest, HttpReply, ManagerMsg};
use netcap_core::task::CaptureMode;
use netcap_core::{resolver, Address, ServerConfig, TaskTable};

/// Upload size cap for PDEF bodies.
const MAX_PDEF_SIZE: usize = 2 * 1024 * 1024;
/// Scratch-file prefix; kept stable because operator tooling globs on it.
const PDEF_SCRATCH_PREFIX: &str = "rxtracenetcap_pdef";
/// Protocol definitions shipped with the config tree.
const PDEF_CONFIG_DIR: &str = "config/protocols";

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AppState {
    pub manager: Address<ManagerMsg>,
    pub table: Arc<TaskTable>,
    pub server: Arc<ServerConfig>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/capture/start", post(capture_start))
        .route("/api/capture/stop", post(capture_stop))
        .route("/api/capture/status", get(capture_status))
        .route("/api/pdef/upload", post(pdef_upload))
        .route("/api/pdef/list", get(pdef_list))
        .route("/api/pdef/get", get(pdef_get))
        .route("/health", get(health))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_PDEF_SIZE + 64 * 1024))
        .with_state(state)
}

fn now_ms() -> u64 {
    chrono::Local::now().timestamp_millis().max(0) as u64
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn reply_to_response(reply: HttpReply) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &reply.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            headers.insert(name, value);
        }
    }
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, headers, Json(reply.body)).into_response()
}

/// Send a manager message built around a fresh reply channel and block on
/// the answer from a blocking-pool thread.
async fn round_trip<F>(state: &AppState, build: F) -> Response
where
    F: FnOnce(crossbeam_channel::Sender<HttpReply>) -> ManagerMsg,
{
    let (tx, rx) = crossbeam_channel::bounded::<HttpReply>(1);
    if let Err(e) = state.manager.send(build(tx)) {
        warn!("manager send failed: {}", e);
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "manager unavailable");
    }

    match tokio::task::spawn_blocking(move || rx.recv_timeout(REPLY_TIMEOUT)).await {
        Ok(Ok(reply)) => reply_to_response(reply),
        Ok(Err(_)) => json_error(StatusCode::GATEWAY_TIMEOUT, "manager reply timeout"),
        Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

// ─── /api/capture/start ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StartBody {
    pub mode: Option<String>,
    pub capture_mode: Option<String>,
    pub iface: Option<String>,
    pub proc_name: Option<String>,
    pub pid: Option<i32>,
    pub target_pid: Option<i32>,
    pub container_id: Option<String>,
    pub filter: Option<String>,
    pub bpf: Option<String>,
    pub protocol: Option<String>,
    pub protocol_filter: Option<String>,
    pub protocol_filter_inline: Option<String>,
    pub ip: Option<String>,
    pub ip_filter: Option<String>,
    pub port: Option<u16>,
    pub port_filter: Option<u16>,
    pub category: Option<String>,
    pub file: Option<String>,
    pub file_pattern: Option<String>,
    pub duration: Option<i64>,
    pub duration_sec: Option<i64>,
    pub max_bytes: Option<u64>,
    pub max_packets: Option<u64>,
    pub client_ip: Option<String>,
    pub user: Option<String>,
    pub request_user: Option<String>,
}

/// Decode a start body into a capture request, applying mode inference:
/// an explicit mode wins; otherwise `proc_name` implies process mode and a
/// pid implies pid mode.
pub fn build_capture_request(body: StartBody, server: &ServerConfig) -> CaptureRequest {
    let mut request = CaptureRequest::default();

    let explicit_mode = body
        .capture_mode
        .as_deref()
        .or(body.mode.as_deref())
        .and_then(CaptureMode::parse);

    if let Some(v) = body.iface {
        request.iface = v;
    }
    if let Some(v) = body.proc_name {
        request.proc_name = v;
    }
    if let Some(v) = body.pid.or(body.target_pid) {
        request.target_pid = v;
    }
    if let Some(v) = body.container_id {
        request.container_id = v;
    }

    let inferred = if !request.proc_name.is_empty() {
        CaptureMode::Process
    } else if request.target_pid > 0 {
        CaptureMode::Pid
    } else if !request.container_id.is_empty() {
        CaptureMode::Container
    } else {
        CaptureMode::Interface
    };
    request.mode = explicit_mode.unwrap_or(inferred);

    if let Some(v) = body.filter.or(body.bpf) {
        request.filter = v;
    }
    if let Some(name) = body.protocol {
        request.protocol_filter = server.protocol_pdef_path(&name);
    }
    if let Some(v) = body.protocol_filter {
        request.protocol_filter = v;
    }
    if let Some(v) = body.protocol_filter_inline {
        request.protocol_filter_inline = v;
    }
    if let Some(v) = body.ip.or(body.ip_filter) {
        request.ip_filter = v;
    }
    if let Some(v) = body.port.or(body.port_filter) {
        request.port_filter = v;
    }
    if let Some(v) = body.category {
        request.category = v;
    }
    if let Some(v) = body.file.or(body.file_pattern) {
        request.file_pattern = v;
    }
    if let Some(v) = body.duration.or(body.duration_sec) {
        request.duration_sec = v;
    }
    if let Some(v) = body.max_bytes {
        request.max_bytes = v;
    }
    if let Some(v) = body.max_packets {
        request.max_packets = v;
    }
    if let Some(v) = body.client_ip {
        request.client_ip = v;
    }
    if let Some(v) = body.request_user.or(body.user) {
        request.request_user = v;
    }

    request.enqueue_ts_ms = now_ms();
    request
}

async fn capture_start(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let decoded: StartBody = if body.is_empty() {
        StartBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid JSON"),
        }
    };

    let request = build_capture_request(decoded, &state.server);

    // Process-mode precheck keeps obviously dead requests off the manager.
    if request.mode == CaptureMode::Process && !request.proc_name.is_empty() {
        let precheck = tokio::task::spawn_blocking({
            let name = request.proc_name.clone();
            move || resolver::find_processes_by_name(&name)
        })
        .await
        .unwrap_or_default();
        if precheck.is_empty() {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "process not found", "proc_name": request.proc_name})),
            )
                .into_response();
        }
    }

    round_trip(&state, |tx| ManagerMsg::StartCapture { request, reply: Some(tx) }).await
}

// ─── /api/capture/stop & /api/capture/status ─────────────────────────────────

fn resolve_capture_id(state: &AppState, params: &HashMap<String, String>) -> Result<u32, Response> {
    let id = params.get("id").and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    if id > 0 {
        return Ok(id);
    }
    if let Some(sid) = params.get("sid").filter(|s| !s.is_empty()) {
        return match state.table.query_by_sid(sid) {
            Some(task) => Ok(task.capture_id),
            None => Err(json_error(StatusCode::NOT_FOUND, "capture_not_found")),
        };
    }
    Err(json_error(StatusCode::BAD_REQUEST, "Missing capture identifier"))
}

async fn capture_stop(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let capture_id = match resolve_capture_id(&state, &params) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    round_trip(&state, |tx| ManagerMsg::StopCapture { capture_id, reply: tx }).await
}

async fn capture_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let capture_id = match resolve_capture_id(&state, &params) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    round_trip(&state, |tx| ManagerMsg::QueryCapture { capture_id, reply: tx }).await
}

// ─── PDEF endpoints ──────────────────────────────────────────────────────────

fn pdef_dirs(server: &ServerConfig) -> Vec<String> {
    let mut dirs = vec![PDEF_CONFIG_DIR.to_string()];
    if !server.storage.temp_pdef_dir.is_empty() {
        dirs.push(server.storage.temp_pdef_dir.clone());
    }
    dirs
}

/// A path is safe when it contains no parent traversal and resolves under
/// one of the allowed PDEF directories.
pub fn is_safe_pdef_path(path: &str, allowed_dirs: &[String]) -> bool {
    if path.contains("..") {
        return false;
    }
    allowed_dirs.iter().any(|dir| {
        let dir = dir.trim_end_matches('/');
        !dir.is_empty() && path.starts_with(&format!("{}/", dir))
    })
}

async fn pdef_upload(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "Empty body");
    }
    if body.len() > MAX_PDEF_SIZE {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "PDEF too large");
    }

    let text = match std::str::from_utf8(&body) {
        Ok(t) => t,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "PDEF must be UTF-8 text"),
    };

    // Validate by parsing before persisting anything.
    if let Err(e) = netcap_pdef::parse_str(text) {
        return json_error(StatusCode::BAD_REQUEST, &format!("Invalid PDEF: {}", e));
    }

    let base_dir = if state.server.storage.temp_pdef_dir.is_empty() {
        "/tmp/netcapd_pdef".to_string()
    } else {
        state.server.storage.temp_pdef_dir.clone()
    };
    if let Err(e) = std::fs::create_dir_all(&base_dir) {
        warn!("pdef scratch dir unavailable: {}", e);
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create temp dir");
    }

    let now = chrono::Local::now();
    let rand = std::collections::hash_map::RandomState::new().build_hasher().finish() as u32;
    let path = PathBuf::from(&base_dir).join(format!(
        "{}_{}_{:06}_{}.pdef",
        PDEF_SCRATCH_PREFIX,
        now.timestamp(),
        now.timestamp_subsec_micros(),
        rand
    ));

    let write_result = (|| -> std::io::Result<()> {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(&body)
    })();
    if let Err(e) = write_result {
        warn!("pdef scratch write failed: {}", e);
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to write temp file");
    }

    let mut hasher = fnv::FnvHasher::default();
    hasher.write(&body);
    let checksum = hasher.finish();

    info!(path = %path.display(), size = body.len(), "PDEF uploaded");
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "path": path.to_string_lossy(),
            "size": body.len(),
            "checksum": format!("{:x}", checksum),
            "validated": true,
        })),
    )
        .into_response()
}

async fn pdef_list(State(state): State<Arc<AppState>>) -> Response {
    let mut pdefs: Vec<Value> = Vec::new();

    for dir in pdef_dirs(&state.server) {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".pdef") {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let mtime = meta
                .modified()
                .map(|t| chrono::DateTime::<chrono::Local>::from(t).to_rfc3339())
                .unwrap_or_default();
            pdefs.push(json!({
                "name": name,
                "path": entry.path().to_string_lossy(),
                "size": meta.len(),
                "mtime": mtime,
            }));
        }
    }

    (StatusCode::OK, Json(json!({"status": "ok", "pdefs": pdefs}))).into_response()
}

async fn pdef_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let allowed = pdef_dirs(&state.server);

    let target = if let Some(path) = params.get("path").filter(|p| !p.is_empty()) {
        path.clone()
    } else if let Some(name) = params.get("name").filter(|n| !n.is_empty()) {
        let mut found = None;
        for dir in &allowed {
            let candidate = Path::new(dir).join(name);
            if candidate.is_file() {
                found = Some(candidate.to_string_lossy().into_owned());
                break;
            }
        }
        match found {
            Some(p) => p,
            None => return json_error(StatusCode::NOT_FOUND, "PDEF not found"),
        }
    } else {
        return json_error(StatusCode::BAD_REQUEST, "Missing 'name' or 'path' parameter");
    };

    if !is_safe_pdef_path(&target, &allowed) {
        return json_error(StatusCode::FORBIDDEN, "Invalid path");
    }

    let meta = match std::fs::metadata(&target) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return json_error(StatusCode::BAD_REQUEST, "Not a regular file"),
        Err(_) => return json_error(StatusCode::NOT_FOUND, "File not found"),
    };
    if meta.len() as usize > MAX_PDEF_SIZE {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "File too large");
    }

    let content = match std::fs::read_to_string(&target) {
        Ok(c) => c,
        Err(_) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file"),
    };
    let mtime = meta
        .modified()
        .map(|t| chrono::DateTime::<chrono::Local>::from(t).to_rfc3339())
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "path": target,
            "size": content.len(),
            "mtime": mtime,
            "content": content,
        })),
    )
        .into_response()
}

async fn health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}
