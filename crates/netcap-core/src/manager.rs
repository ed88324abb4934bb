//! Capture manager: decides whether a request becomes a task, dispatches to
//! workers, collects lifecycle reports and serves stop/status queries.
//!
//! The manager is the sole writer of the task table; everything it does is
//! a reaction to one mailbox message, so task mutation is serialized by
//! construction. Deferred table deletions are drained on the idle edge of
//! the receive loop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use fnv::FnvHasher;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::bus::Address;
use crate::config::{CaptureConfigSnapshot, ServerConfig, StrategyConfig};
use crate::error::CaptureErrorCode;
use crate::messages::{
    CaptureRequest, CaptureResult, CaptureSpec, CaptureStart, CleanupMsg, HttpReply, ManagerMsg,
    ReplyTo, SampleAlert, WorkerMsg,
};
use crate::resolver::{self, ProcessInfo};
use crate::task::{ArchiveInfo, CaptureMode, CaptureTask, CapturedFile, TaskStatus};
use crate::task_table::TaskTable;

pub const CAPTURE_ID_START: u32 = 1000;
const FALLBACK_DURATION_SEC: i64 = 60;
const DEFAULT_MODULE_COOLDOWN_SEC: i64 = 60;

fn now_ms() -> u64 {
    chrono::Local::now().timestamp_millis().max(0) as u64
}

// ─── Pure helpers ────────────────────────────────────────────────────────────

/// Extract a single port from `port N` tokens in a BPF expression.
/// Conservative: any ambiguity (multiple distinct ports) yields 0.
pub fn infer_port_from_filter(filter: &str) -> u16 {
    let bytes = filter.as_bytes();
    let mut found: u32 = 0;
    let mut pos = 0;

    while let Some(rel) = filter[pos..].find("port") {
        let at = pos + rel;
        if at > 0 {
            let prev = bytes[at - 1];
            if prev.is_ascii_alphanumeric() || prev == b'_' {
                pos = at + 4;
                continue;
            }
        }

        let mut idx = at + 4;
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx < bytes.len() && (bytes[idx] == b'=' || bytes[idx] == b':') {
            idx += 1;
            while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
                idx += 1;
            }
        }
        if idx < bytes.len() && (bytes[idx] == b'+' || bytes[idx] == b'-') {
            idx += 1;
        }
        let start = idx;
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        if idx > start {
            if let Ok(port) = filter[start..idx].parse::<u32>() {
                if port > 0 && port <= u32::from(u16::MAX) {
                    if found == 0 {
                        found = port;
                    } else if found != port {
                        // Multiple distinct ports: do not collapse to one.
                        return 0;
                    }
                }
            }
        }
        pos = at + 4;
    }

    found as u16
}

/// Coarse dedup key shown to operators in conflict replies.
pub fn generate_task_key(request: &CaptureRequest) -> String {
    match request.mode {
        CaptureMode::Interface => format!("iface:{}:{}", request.iface, request.filter),
        CaptureMode::Process => {
            format!("proc:{}:{}:{}", request.proc_name, request.filter, request.port_filter)
        }
        CaptureMode::Pid => format!("pid:{}", request.target_pid),
        CaptureMode::Container => {
            format!("container:{}:{}", request.container_id, request.filter)
        }
    }
}

fn skip_str(s: &&str) -> bool {
    s.is_empty()
}

/// Canonical request fingerprint input. Serialization order is the struct
/// declaration order; empty strings and unset numerics drop out so two
/// requests differing only in unset fields normalize identically.
#[derive(Serialize)]
struct SignaturePayload<'a> {
    mode: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    iface: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    resolved_iface: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    category: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    output_pattern: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    output_dir: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    filter: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    protocol_filter: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    ip_filter: &'a str,
    port_filter: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_duration_sec: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_packets: Option<u64>,
    snaplen: i32,
    compress_enabled: bool,
    compress_threshold_mb: u32,
    #[serde(skip_serializing_if = "skip_str")]
    compress_format: &'a str,
    compress_remove_src: bool,
    #[serde(skip_serializing_if = "skip_str")]
    netns_path: &'a str,
    #[serde(skip_serializing_if = "skip_str")]
    proc_name: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    matched_pids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_pid: Option<i64>,
    #[serde(skip_serializing_if = "skip_str")]
    container_id: &'a str,
}

/// 16 lowercase hex digits of FNV-1a-64 over the canonical payload.
pub fn compute_signature(
    spec: &CaptureSpec,
    snapshot: &CaptureConfigSnapshot,
    matched: &[ProcessInfo],
) -> String {
    let mut pids: Vec<i64> = Vec::new();
    if spec.mode == CaptureMode::Process {
        pids = matched.iter().filter(|p| p.pid > 0).map(|p| i64::from(p.pid)).collect();
        pids.sort_unstable();
        pids.dedup();
    }

    let effective_duration = if spec.max_duration_sec > 0 {
        spec.max_duration_sec
    } else {
        snapshot.max_duration_sec
    };
    let effective_max_bytes = if spec.max_bytes > 0 { spec.max_bytes } else { snapshot.max_bytes };
    let effective_max_packets =
        if spec.max_packets > 0 { spec.max_packets } else { snapshot.max_packets };

    let payload = SignaturePayload {
        mode: spec.mode.as_str(),
        iface: &spec.iface,
        resolved_iface: &spec.resolved_iface,
        category: &spec.category,
        output_pattern: if spec.output_pattern.is_empty() {
            &snapshot.filename_template
        } else {
            &spec.output_pattern
        },
        output_dir: &snapshot.output_dir,
        filter: spec.filter.trim(),
        protocol_filter: &spec.protocol_filter,
        ip_filter: &spec.ip_filter,
        port_filter: spec.port_filter,
        max_duration_sec: (effective_duration > 0).then_some(effective_duration),
        max_bytes: (effective_max_bytes > 0).then_some(effective_max_bytes),
        max_packets: (effective_max_packets > 0).then_some(effective_max_packets),
        snaplen: spec.snaplen,
        compress_enabled: snapshot.compress_enabled,
        compress_threshold_mb: snapshot.compress_threshold_mb,
        compress_format: &snapshot.compress_format,
        compress_remove_src: snapshot.compress_remove_src,
        netns_path: &spec.netns_path,
        proc_name: if spec.mode == CaptureMode::Process { &spec.proc_name } else { "" },
        matched_pids: pids,
        target_pid: (spec.mode == CaptureMode::Pid && spec.target_pid > 0)
            .then_some(i64::from(spec.target_pid)),
        container_id: if spec.mode == CaptureMode::Container { &spec.container_id } else { "" },
    };

    let canonical = serde_json::to_string(&payload).unwrap_or_default();
    let mut hasher = FnvHasher::default();
    hasher.write(canonical.as_bytes());
    format!("{:016x}", hasher.finish())
}

/// sid = signature ‖ YYYYMMDDHHMMSSmmm local time.
pub fn make_sid(signature: &str) -> String {
    format!("{}{}", signature, chrono::Local::now().format("%Y%m%d%H%M%S%3f"))
}

fn strip_quotes(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2 {
        let b = v.as_bytes();
        if (b[0] == b'\'' && b[v.len() - 1] == b'\'') || (b[0] == b'"' && b[v.len() - 1] == b'"') {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/// Split a capture hint on whitespace/commas/semicolons into lowercase-key
/// `key:value` / `key=value` pairs; values may be quoted.
pub fn parse_capture_hint_pairs(hint: &str) -> BTreeMap<String, String> {
    let normalized: String =
        hint.chars().map(|c| if c == ',' || c == ';' { ' ' } else { c }).collect();

    let mut result = BTreeMap::new();
    for token in normalized.split_whitespace() {
        let pos = match token.find([':', '=']) {
            Some(p) => p,
            None => continue,
        };
        let key = token[..pos].trim().to_ascii_lowercase();
        let value = strip_quotes(token[pos + 1..].trim()).to_string();
        result.insert(key, value);
    }
    result
}

/// Build a capture request from a sampler alert's capture hint. None when
/// no target can be identified.
pub fn request_from_alert(alert: &SampleAlert, server: &ServerConfig) -> Option<CaptureRequest> {
    let module_name = if alert.module_name.is_empty() { "default" } else { &alert.module_name };
    let pairs = parse_capture_hint_pairs(&alert.capture_hint);

    let target_keys: [(&str, CaptureMode); 7] = [
        ("process", CaptureMode::Process),
        ("proc", CaptureMode::Process),
        ("pid", CaptureMode::Pid),
        ("container", CaptureMode::Container),
        ("container_id", CaptureMode::Container),
        ("iface", CaptureMode::Interface),
        ("interface", CaptureMode::Interface),
    ];

    let mut mode = None;
    let mut target_value = String::new();
    for (key, m) in target_keys {
        if let Some(v) = pairs.get(key) {
            mode = Some(m);
            target_value = v.clone();
            break;
        }
    }

    // Fall back to a single key:value parse of the whole hint.
    if mode.is_none() {
        if let Some(pos) = alert.capture_hint.find(':') {
            let key = alert.capture_hint[..pos].trim().to_ascii_lowercase();
            let value = strip_quotes(alert.capture_hint[pos + 1..].trim()).to_string();
            mode = match key.as_str() {
                "process" | "proc" => Some(CaptureMode::Process),
                "pid" => Some(CaptureMode::Pid),
                "container" | "container_id" => Some(CaptureMode::Container),
                "iface" | "interface" => Some(CaptureMode::Interface),
                _ => None,
            };
            target_value = value;
        }
    }

    let mode = mode?;
    let mut request = CaptureRequest { mode, ..CaptureRequest::default() };

    match mode {
        CaptureMode::Interface => {
            if target_value.is_empty() {
                target_value = server.capture.default_interface.clone();
            }
            if target_value.is_empty() {
                warn!(module = module_name, hint = %alert.capture_hint, "hint missing interface");
                return None;
            }
            request.iface = target_value;
        }
        CaptureMode::Process => {
            if target_value.is_empty() {
                warn!(module = module_name, hint = %alert.capture_hint, "hint missing process name");
                return None;
            }
            request.proc_name = target_value;
        }
        CaptureMode::Pid => match target_value.parse::<i32>() {
            Ok(pid) if pid > 0 => request.target_pid = pid,
            _ => {
                warn!(module = module_name, pid = %target_value, "hint has invalid pid");
                return None;
            }
        },
        CaptureMode::Container => {
            if target_value.is_empty() {
                warn!(module = module_name, hint = %alert.capture_hint, "hint missing container id");
                return None;
            }
            request.container_id = target_value;
        }
    }

    if let Some(v) = pairs.get("netns") {
        request.netns_path = v.clone();
    }
    if let Some(v) = pairs.get("filter") {
        request.filter = v.clone();
    }
    for key in ["protocol", "protocol_filter"] {
        if let Some(v) = pairs.get(key) {
            request.protocol_filter = v.clone();
        }
    }
    for key in ["ip", "ip_filter"] {
        if let Some(v) = pairs.get(key) {
            request.ip_filter = v.clone();
        }
    }
    for key in ["port", "port_filter"] {
        if let Some(v) = pairs.get(key) {
            if let Ok(port) = v.parse::<u16>() {
                if port > 0 {
                    request.port_filter = port;
                }
            }
        }
    }

    request.category = pairs
        .get("category")
        .cloned()
        .unwrap_or_else(|| alert.capture_category.clone());
    if request.category.is_empty() {
        request.category = server.capture.default_category.clone();
    }

    let mut duration = alert.capture_duration_sec;
    for key in ["duration", "duration_sec"] {
        if let Some(v) = pairs.get(key) {
            if let Ok(d) = v.parse::<i64>() {
                if d > 0 {
                    duration = d;
                }
            }
        }
    }
    if duration <= 0 {
        duration = server.capture.default_duration;
    }
    if duration > 0 {
        request.duration_sec = duration;
    }

    if let Some(v) = pairs.get("max_bytes") {
        if let Ok(b) = v.parse::<u64>() {
            if b > 0 {
                request.max_bytes = b;
            }
        }
    }
    if let Some(v) = pairs.get("max_packets") {
        if let Ok(p) = v.parse::<u64>() {
            if p > 0 {
                request.max_packets = p;
            }
        }
    }

    request.client_ip = "sample".into();
    request.request_user = format!("module:{}", module_name);
    request.enqueue_ts_ms = now_ms();
    Some(request)
}

// ─── Manager actor ───────────────────────────────────────────────────────────

pub struct Manager {
    table: Arc<TaskTable>,
    /// Worker addresses; worker identity i+1 maps to `workers[i]` (0 means
    /// "no worker assigned" on a task).
    workers: Vec<Address<WorkerMsg>>,
    cleanup: Address<CleanupMsg>,
    server: Arc<ServerConfig>,
    strategy: Arc<StrategyConfig>,
    snapshot: Arc<CaptureConfigSnapshot>,
    next_capture_id: u32,
    next_worker: usize,
    module_last_trigger: HashMap<String, i64>,
}

impl Manager {
    pub fn new(
        table: Arc<TaskTable>,
        workers: Vec<Address<WorkerMsg>>,
        cleanup: Address<CleanupMsg>,
        server: Arc<ServerConfig>,
        strategy: Arc<StrategyConfig>,
        snapshot: Arc<CaptureConfigSnapshot>,
    ) -> Manager {
        Manager {
            table,
            workers,
            cleanup,
            server,
            strategy,
            snapshot,
            next_capture_id: CAPTURE_ID_START,
            next_worker: 0,
            module_last_trigger: HashMap::new(),
        }
    }

    pub fn run(mut self, rx: Receiver<ManagerMsg>) {
        info!(workers = self.workers.len(), "capture manager started");
        loop {
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {
                    // Idle edge: no reader can still be inside a handler.
                    self.table.cleanup_pending_deletes();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("capture manager mailbox closed");
    }

    pub fn handle(&mut self, msg: ManagerMsg) {
        match msg {
            ManagerMsg::StartCapture { request, reply } => self.handle_start(request, reply),
            ManagerMsg::StopCapture { capture_id, reply } => self.handle_stop(capture_id, reply),
            ManagerMsg::QueryCapture { capture_id, reply } => self.handle_query(capture_id, reply),
            ManagerMsg::CaptureStarted { capture_id, start_ts_us, capture_pid, output_file, worker } => {
                self.table.set_capture_started(capture_id, start_ts_us, capture_pid, &output_file);
                info!(capture_id, worker, "capture running");
            }
            ManagerMsg::CaptureProgress { capture_id, packets, bytes, last_packet_ts_us } => {
                self.table.update_progress(capture_id, packets, bytes, last_packet_ts_us);
            }
            ManagerMsg::CaptureFileReady { capture_id, key, sid, files } => {
                self.handle_file_ready(capture_id, key, sid, files);
            }
            ManagerMsg::CaptureFinished { capture_id, result } => {
                self.handle_finished(capture_id, result);
            }
            ManagerMsg::CaptureFailed { capture_id, error_code, error_message, .. } => {
                let message = if error_message.is_empty() {
                    error_code.as_str().to_string()
                } else {
                    error_message
                };
                self.table.set_capture_failed(capture_id, &message);
                warn!(capture_id, code = error_code.code(), %message, "capture failed");
                self.clear_module_cooldown(capture_id);
            }
            ManagerMsg::SampleAlert(alert) => self.handle_sample_alert(&alert),
            ManagerMsg::CleanCompressDone { capture_id, archive } => {
                self.table.record_archive(capture_id, &archive);
                info!(capture_id, archive = %archive.path, "archive recorded");
            }
            ManagerMsg::CleanCompressFailed { capture_id, files, error_code, error_message } => {
                warn!(
                    capture_id,
                    code = error_code.code(),
                    files = files.len(),
                    %error_message,
                    "batch compression failed; files stay queued"
                );
            }
            ManagerMsg::FileRecorded { capture_id, files } => {
                self.table.append_files(capture_id, &files);
            }
            ManagerMsg::ConfigRefresh { strategy, snapshot } => {
                debug!(hash = snapshot.config_hash, "manager config refreshed");
                self.strategy = strategy;
                self.snapshot = snapshot;
            }
        }
    }

    // ── Start pipeline ──────────────────────────────────────────────────

    fn handle_start(&mut self, mut request: CaptureRequest, reply: Option<ReplyTo>) {
        let enqueue_ms = request.enqueue_ts_ms;

        // 1. Target resolution.
        let mut matched: Vec<ProcessInfo> = Vec::new();
        match request.mode {
            CaptureMode::Process => {
                matched = resolver::find_processes_by_name(&request.proc_name);
                if matched.is_empty() {
                    self.send_reply(
                        &reply,
                        enqueue_ms,
                        HttpReply::json(
                            404,
                            json!({"error": "process not found", "proc_name": request.proc_name}),
                        ),
                    );
                    return;
                }
            }
            CaptureMode::Pid => match resolver::process_info(request.target_pid) {
                Some(info) => matched.push(info),
                None => {
                    self.send_reply(
                        &reply,
                        enqueue_ms,
                        HttpReply::json(
                            404,
                            json!({"error": "pid not found", "pid": request.target_pid}),
                        ),
                    );
                    return;
                }
            },
            _ => {}
        }

        // 2. Auto-BPF from the target's listening ports.
        if request.mode == CaptureMode::Process
            && request.filter.is_empty()
            && !request.proc_name.is_empty()
        {
            let ports: BTreeSet<u16> = matched
                .iter()
                .flat_map(|p| p.listening_ports.iter().copied())
                .filter(|&p| p > 0)
                .collect();
            if ports.is_empty() {
                warn!(proc_name = %request.proc_name,
                      "process has no listening ports; proceeding without auto BPF");
            } else {
                request.filter = ports
                    .iter()
                    .map(|p| format!("port {}", p))
                    .collect::<Vec<_>>()
                    .join(" or ");
                if request.port_filter == 0 && ports.len() == 1 {
                    request.port_filter = *ports.iter().next().unwrap();
                }
                info!(proc_name = %request.proc_name, bpf = %request.filter, "auto-generated BPF");
            }
        }

        // 3. Conservative port inference from the BPF.
        if request.port_filter == 0 && !request.filter.is_empty() {
            let inferred = infer_port_from_filter(&request.filter);
            if inferred > 0 {
                request.port_filter = inferred;
            }
        }

        // 4. Default fill.
        if request.iface.is_empty() {
            request.iface = self.server.capture.default_interface.clone();
            if request.iface.is_empty() {
                request.iface = "any".into();
            }
        }
        let mut effective_duration = request.duration_sec;
        if effective_duration <= 0 {
            effective_duration = self.snapshot.max_duration_sec;
        }
        if effective_duration <= 0 {
            effective_duration = FALLBACK_DURATION_SEC;
        }
        request.duration_sec = effective_duration;

        let key = generate_task_key(&request);

        let mut spec = CaptureSpec {
            mode: request.mode,
            iface: request.iface.clone(),
            resolved_iface: request.iface.clone(),
            proc_name: request.proc_name.clone(),
            target_pid: request.target_pid,
            container_id: request.container_id.clone(),
            netns_path: request.netns_path.clone(),
            category: request.category.clone(),
            filter: request.filter.clone(),
            protocol_filter: request.protocol_filter.clone(),
            protocol_filter_inline: request.protocol_filter_inline.clone(),
            ip_filter: request.ip_filter.clone(),
            port_filter: request.port_filter,
            output_pattern: request.file_pattern.clone(),
            max_duration_sec: effective_duration,
            max_bytes: request.max_bytes,
            max_packets: request.max_packets,
            snaplen: self.snapshot.snaplen,
        };
        if spec.netns_path.is_empty() {
            if let Some(first) = matched.first() {
                spec.netns_path = first.netns_path.clone();
            }
        }

        // 5. Signature & sid.
        let signature = compute_signature(&spec, &self.snapshot, &matched);
        let sid = make_sid(&signature);

        // 6. Dedup against active signature, then key.
        let existing = self
            .table
            .query_active_by_signature(&signature)
            .or_else(|| self.table.query_by_key(&key).filter(|t| t.status.is_active()));
        if let Some(existing) = existing {
            let body = json!({
                "error": "duplicate capture task",
                "key": if existing.key.is_empty() { key.clone() } else { existing.key.clone() },
                "sid": if existing.sid.is_empty() { sid.clone() } else { existing.sid.clone() },
                "existing_capture_id": existing.capture_id,
                "status": existing.status.as_str(),
            });
            info!(key = %key, existing_id = existing.capture_id, "duplicate capture task rejected");
            self.send_reply(&reply, enqueue_ms, HttpReply::json(409, body));
            return;
        }

        // 7. Capacity gate. A limit of 0 rejects every request.
        let stats = self.table.stats();
        let active = stats.running + stats.resolving;
        let max_concurrent = self.server.limits.max_concurrent_captures;
        if active >= max_concurrent {
            warn!(active, max_concurrent, "capture capacity reached");
            self.send_reply(
                &reply,
                enqueue_ms,
                HttpReply::json(
                    429,
                    json!({"error": "capture capacity reached", "max_concurrent": max_concurrent}),
                ),
            );
            return;
        }

        // 8. Create the task.
        let capture_id = self.next_capture_id;
        self.next_capture_id += 1;

        let task = CaptureTask {
            capture_id,
            key: key.clone(),
            signature,
            sid: sid.clone(),
            mode: request.mode,
            iface: request.iface.clone(),
            proc_name: request.proc_name.clone(),
            target_pid: request.target_pid,
            container_id: request.container_id.clone(),
            netns_path: spec.netns_path.clone(),
            filter: request.filter.clone(),
            protocol_filter: request.protocol_filter.clone(),
            ip_filter: request.ip_filter.clone(),
            port_filter: request.port_filter,
            category: request.category.clone(),
            file_pattern: request.file_pattern.clone(),
            duration_sec: effective_duration,
            max_bytes: request.max_bytes,
            max_packets: request.max_packets,
            status: TaskStatus::Pending,
            start_time: chrono::Local::now().timestamp(),
            matched_pids: matched.iter().map(|p| p.pid).collect(),
            resolved_iface: request.iface.clone(),
            client_ip: request.client_ip.clone(),
            request_user: request.request_user.clone(),
            ..CaptureTask::default()
        };
        self.table.add_task(task);

        // 9. Dispatch round-robin.
        self.dispatch(capture_id, &key, &sid, spec);

        // 10. Accepted reply.
        let body = json!({
            "capture_id": capture_id,
            "duplicate": false,
            "status": "started",
            "mode": request.mode.as_str(),
            "key": key,
            "sid": sid,
            "matched_pids": matched.len(),
            "port": request.port_filter,
        });
        info!(capture_id, mode = request.mode.as_str(), pids = matched.len(),
              port = request.port_filter, "capture task started");
        self.send_reply(&reply, enqueue_ms, HttpReply::json(200, body));
    }

    fn dispatch(&mut self, capture_id: u32, key: &str, sid: &str, spec: CaptureSpec) {
        if self.workers.is_empty() {
            warn!(capture_id, "no capture workers available");
            return;
        }
        let slot = self.next_worker % self.workers.len();
        self.next_worker += 1;
        let worker_id = (slot + 1) as u32;

        let start = CaptureStart {
            capture_id,
            key: key.to_string(),
            sid: sid.to_string(),
            config: self.snapshot.clone(),
            spec,
        };
        if let Err(e) = self.workers[slot].send(WorkerMsg::Start(Box::new(start))) {
            warn!(capture_id, "dispatch failed: {}", e);
            self.table.set_capture_failed(capture_id, "dispatch_failed");
            return;
        }

        self.table.update_task(capture_id, |t| {
            t.worker_thread_index = worker_id;
            t.stop_requested = false;
            t.cancel_requested = false;
            if t.status == TaskStatus::Pending {
                t.status = TaskStatus::Resolving;
            }
        });
        debug!(capture_id, worker = worker_id, "capture dispatched");
    }

    // ── Lifecycle collection ────────────────────────────────────────────

    fn handle_file_ready(&mut self, capture_id: u32, key: String, sid: String, files: Vec<CapturedFile>) {
        if files.is_empty() {
            return;
        }
        for f in &files {
            info!(capture_id, path = %f.path, size = f.size, "capture file ready");
        }
        self.table.append_files(capture_id, &files);

        if let Err(e) = self.cleanup.send(CleanupMsg::FileEnqueue {
            capture_id,
            key,
            sid,
            files,
            policy: self.snapshot.clone(),
        }) {
            warn!(capture_id, "cleanup enqueue failed: {}", e);
        }
    }

    fn handle_finished(&mut self, capture_id: u32, result: CaptureResult) {
        if result.exit_code == 0 {
            self.table.set_capture_finished(
                capture_id,
                result.finish_ts_us,
                result.total_packets,
                result.total_bytes,
                "",
            );
            info!(capture_id, packets = result.total_packets, bytes = result.total_bytes,
                  "capture completed");
        } else if result.exit_code == CaptureErrorCode::RunCancelled.code() {
            let message =
                if result.error_message.is_empty() { "stopped" } else { &result.error_message };
            self.table.set_capture_stopped(
                capture_id,
                result.finish_ts_us,
                result.total_packets,
                result.total_bytes,
                message,
            );
            info!(capture_id, "capture stopped by user");
        } else {
            let message = if result.error_message.is_empty() {
                "capture_failed".to_string()
            } else {
                result.error_message.clone()
            };
            self.table.set_capture_failed(capture_id, &message);
            warn!(capture_id, code = result.exit_code, "capture finished with error");
        }

        self.clear_module_cooldown(capture_id);
    }

    // ── Stop & query ────────────────────────────────────────────────────

    fn handle_stop(&mut self, capture_id: u32, reply: ReplyTo) {
        let snapshot = match self.table.query(capture_id) {
            Some(t) => t,
            None => {
                let _ = reply.send(HttpReply::json(
                    404,
                    json!({"error": "capture_not_found", "capture_id": capture_id}),
                ));
                return;
            }
        };

        if snapshot.status.is_terminal() {
            let _ = reply.send(HttpReply::json(
                200,
                json!({
                    "capture_id": snapshot.capture_id,
                    "key": snapshot.key,
                    "sid": snapshot.sid,
                    "status": snapshot.status.as_str(),
                }),
            ));
            return;
        }

        self.table.update_task(capture_id, |t| {
            t.stop_requested = true;
            t.cancel_requested = false;
        });

        let mut dispatched = false;
        if snapshot.worker_thread_index > 0 {
            let slot = (snapshot.worker_thread_index - 1) as usize;
            if let Some(worker) = self.workers.get(slot) {
                dispatched = worker
                    .send(WorkerMsg::Stop { capture_id, reason: "user_stop".into() })
                    .is_ok();
            }
        }
        if !dispatched {
            self.table.update_status(capture_id, TaskStatus::Stopped);
        }

        info!(capture_id, worker = snapshot.worker_thread_index, dispatched, "stop requested");
        let _ = reply.send(HttpReply::json(
            200,
            json!({
                "capture_id": snapshot.capture_id,
                "key": snapshot.key,
                "sid": snapshot.sid,
                "status": if dispatched { "stopping" } else { "stopped" },
                "dispatched": dispatched,
            }),
        ));
    }

    fn handle_query(&mut self, capture_id: u32, reply: ReplyTo) {
        match self.table.query(capture_id) {
            Some(task) => {
                let _ = reply.send(HttpReply::json(200, task_status_body(&task)));
            }
            None => {
                let _ = reply.send(HttpReply::json(
                    404,
                    json!({"error": "capture_not_found", "capture_id": capture_id}),
                ));
            }
        }
    }

    // ── Sampler alerts & cooldowns ──────────────────────────────────────

    fn handle_sample_alert(&mut self, alert: &SampleAlert) {
        let module_name =
            if alert.module_name.is_empty() { "default".to_string() } else { alert.module_name.clone() };

        info!(
            module = %module_name,
            cpu = alert.cpu_hit,
            mem = alert.mem_hit,
            net = alert.net_hit,
            cpu_pct = alert.cpu_percent,
            mem_pct = alert.memory_percent,
            "sample alert"
        );

        if alert.capture_hint.is_empty() {
            return;
        }

        let now = chrono::Local::now().timestamp();
        let cooldown =
            if alert.cooldown_sec > 0 { alert.cooldown_sec } else { DEFAULT_MODULE_COOLDOWN_SEC };

        if let Some(&last) = self.module_last_trigger.get(&module_name) {
            if now >= last && now - last < cooldown {
                info!(module = %module_name, cooldown, "auto-capture suppressed by cooldown");
                return;
            }
        }

        let request = match request_from_alert(alert, &self.server) {
            Some(r) => r,
            None => {
                warn!(module = %module_name, hint = %alert.capture_hint, "invalid capture hint");
                return;
            }
        };

        self.module_last_trigger.insert(module_name.clone(), now);
        info!(module = %module_name, "auto capture triggered");
        self.handle_start(request, None);
    }

    /// Forget a module's last-trigger time once its capture reaches a
    /// terminal state, re-arming the trigger.
    fn clear_module_cooldown(&mut self, capture_id: u32) {
        let task = match self.table.query(capture_id) {
            Some(t) => t,
            None => return,
        };
        if let Some(module) = task.request_user.strip_prefix("module:") {
            if !module.is_empty() && self.module_last_trigger.remove(module).is_some() {
                debug!(module, capture_id, "module cooldown cleared");
            }
        }
    }

    fn send_reply(&self, reply: &Option<ReplyTo>, enqueue_ms: u64, mut http: HttpReply) {
        let reply = match reply {
            Some(r) => r,
            None => return,
        };
        let reply_ms = now_ms();
        if enqueue_ms > 0 {
            let delta = reply_ms.saturating_sub(enqueue_ms);
            http.headers.push(("X-Debug-RequestTs".into(), enqueue_ms.to_string()));
            http.headers.push(("X-Debug-ReplyTs".into(), reply_ms.to_string()));
            http.headers.push(("X-Debug-QueueMs".into(), delta.to_string()));
        }
        let _ = reply.send(http);
    }
}

/// Full status snapshot body for `GET /api/capture/status`.
pub fn task_status_body(task: &CaptureTask) -> Value {
    let mut body = Map::new();
    body.insert("capture_id".into(), json!(task.capture_id));
    body.insert("status".into(), json!(task.status.as_str()));
    body.insert("mode".into(), json!(task.mode.as_str()));
    body.insert("key".into(), json!(task.key));
    body.insert("sid".into(), json!(task.sid));

    if !task.iface.is_empty() {
        body.insert("iface".into(), json!(task.iface));
    }
    if !task.proc_name.is_empty() {
        body.insert("proc_name".into(), json!(task.proc_name));
    }
    if !task.filter.is_empty() {
        body.insert("filter".into(), json!(task.filter));
    }
    if task.target_pid > 0 {
        body.insert("pid".into(), json!(task.target_pid));
    }
    if task.port_filter > 0 {
        body.insert("port".into(), json!(task.port_filter));
    }

    body.insert("start_time".into(), json!(task.start_time));
    body.insert("end_time".into(), json!(task.end_time));
    body.insert("packets".into(), json!(task.packet_count));
    body.insert("bytes".into(), json!(task.bytes_captured));
    body.insert("worker".into(), json!(task.worker_thread_index));
    body.insert("stop_requested".into(), json!(task.stop_requested));
    body.insert("client_ip".into(), json!(task.client_ip));
    body.insert("request_user".into(), json!(task.request_user));

    if !task.error_message.is_empty() {
        body.insert("error".into(), json!(task.error_message));
    }

    if !task.captured_files.is_empty() {
        let files: Vec<Value> = task
            .captured_files
            .iter()
            .map(|f| {
                let mut entry = Map::new();
                entry.insert("path".into(), json!(f.path));
                entry.insert("size".into(), json!(f.size));
                entry.insert("segment".into(), json!(f.segment_index));
                entry.insert("segments".into(), json!(f.total_segments));
                entry.insert("compressed".into(), json!(f.compressed));
                if !f.archive_path.is_empty() {
                    entry.insert("archive".into(), json!(f.archive_path));
                }
                if f.compress_finish_ts > 0 {
                    entry.insert("compressed_at".into(), json!(f.compress_finish_ts));
                }
                if !f.record_path.is_empty() {
                    entry.insert("record".into(), json!(f.record_path));
                }
                Value::Object(entry)
            })
            .collect();
        body.insert("files".into(), Value::Array(files));
    }

    if !task.archives.is_empty() {
        let archives: Vec<Value> = task
            .archives
            .iter()
            .map(|a| {
                let mut entry = Map::new();
                entry.insert("path".into(), json!(a.path));
                entry.insert("size".into(), json!(a.size));
                if a.compress_finish_ts > 0 {
                    entry.insert("compressed_at".into(), json!(a.compress_finish_ts));
                }
                if !a.files.is_empty() {
                    entry.insert(
                        "files".into(),
                        Value::Array(a.files.iter().map(|f| json!(f.path)).collect()),
                    );
                }
                Value::Object(entry)
            })
            .collect();
        body.insert("archives".into(), Value::Array(archives));
    }

    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mailbox;

    fn harness(
        max_concurrent: usize,
    ) -> (Manager, Receiver<WorkerMsg>, Receiver<CleanupMsg>) {
        let (worker_addr, worker_rx) = mailbox::<WorkerMsg>("worker-1", 64);
        let (cleanup_addr, cleanup_rx) = mailbox::<CleanupMsg>("cleanup", 64);
        let mut server = ServerConfig::default();
        server.limits.max_concurrent_captures = max_concurrent;
        let server = Arc::new(server);
        let snapshot = Arc::new(CaptureConfigSnapshot::build(&server, 0));
        let manager = Manager::new(
            Arc::new(TaskTable::new()),
            vec![worker_addr],
            cleanup_addr,
            server,
            Arc::new(StrategyConfig::default()),
            snapshot,
        );
        (manager, worker_rx, cleanup_rx)
    }

    fn start_request(iface: &str, filter: &str) -> CaptureRequest {
        CaptureRequest {
            mode: CaptureMode::Interface,
            iface: iface.into(),
            filter: filter.into(),
            duration_sec: 1,
            client_ip: "127.0.0.1".into(),
            request_user: "test".into(),
            enqueue_ts_ms: now_ms(),
            ..CaptureRequest::default()
        }
    }

    fn start_and_reply(manager: &mut Manager, request: CaptureRequest) -> HttpReply {
        let (tx, rx) = crossbeam_channel::bounded(1);
        manager.handle(ManagerMsg::StartCapture { request, reply: Some(tx) });
        rx.recv_timeout(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn port_inference_is_conservative() {
        assert_eq!(infer_port_from_filter("udp port 53"), 53);
        assert_eq!(infer_port_from_filter("port 8080 or port 8080"), 8080);
        assert_eq!(infer_port_from_filter("port 7001 or port 7002"), 0);
        assert_eq!(infer_port_from_filter("tcp"), 0);
        assert_eq!(infer_port_from_filter("portX 80"), 0);
        assert_eq!(infer_port_from_filter("dst port 443"), 443);
        assert_eq!(infer_port_from_filter(""), 0);
        // Out-of-range numbers are ignored.
        assert_eq!(infer_port_from_filter("port 70000"), 0);
    }

    #[test]
    fn task_keys_by_mode() {
        let mut r = CaptureRequest {
            mode: CaptureMode::Interface,
            iface: "lo".into(),
            filter: "udp".into(),
            ..CaptureRequest::default()
        };
        assert_eq!(generate_task_key(&r), "iface:lo:udp");

        r.mode = CaptureMode::Process;
        r.proc_name = "nginx".into();
        r.port_filter = 80;
        assert_eq!(generate_task_key(&r), "proc:nginx:udp:80");

        r.mode = CaptureMode::Pid;
        r.target_pid = 42;
        assert_eq!(generate_task_key(&r), "pid:42");

        r.mode = CaptureMode::Container;
        r.container_id = "abc".into();
        assert_eq!(generate_task_key(&r), "container:abc:udp");
    }

    #[test]
    fn signature_is_deterministic_and_sensitive() {
        let server = Arc::new(ServerConfig::default());
        let snapshot = CaptureConfigSnapshot::build(&server, 0);
        let spec = CaptureSpec {
            mode: CaptureMode::Interface,
            iface: "lo".into(),
            resolved_iface: "lo".into(),
            filter: "  udp port 53  ".into(),
            max_duration_sec: 10,
            snaplen: 65535,
            ..CaptureSpec::default()
        };

        let a = compute_signature(&spec, &snapshot, &[]);
        let b = compute_signature(&spec, &snapshot, &[]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // Whitespace around the BPF is normalized away.
        let mut trimmed = spec.clone();
        trimmed.filter = "udp port 53".into();
        assert_eq!(compute_signature(&trimmed, &snapshot, &[]), a);

        let mut other = spec.clone();
        other.filter = "tcp port 53".into();
        assert_ne!(compute_signature(&other, &snapshot, &[]), a);
    }

    #[test]
    fn signature_includes_sorted_pids_for_process_mode() {
        let server = Arc::new(ServerConfig::default());
        let snapshot = CaptureConfigSnapshot::build(&server, 0);
        let spec = CaptureSpec {
            mode: CaptureMode::Process,
            proc_name: "svc".into(),
            snaplen: 65535,
            ..CaptureSpec::default()
        };

        let p = |pid| ProcessInfo { pid, ..ProcessInfo::default() };
        let a = compute_signature(&spec, &snapshot, &[p(30), p(10), p(20)]);
        let b = compute_signature(&spec, &snapshot, &[p(10), p(20), p(30)]);
        assert_eq!(a, b);
        let c = compute_signature(&spec, &snapshot, &[p(10), p(20)]);
        assert_ne!(a, c);
    }

    #[test]
    fn sid_extends_signature_with_millisecond_timestamp() {
        let sid = make_sid("aabbccdd00112233");
        assert!(sid.starts_with("aabbccdd00112233"));
        assert_eq!(sid.len(), 16 + 17);
        assert!(sid[16..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn hint_pairs_parse_separators_and_quotes() {
        let pairs =
            parse_capture_hint_pairs("iface:lo filter:\"icmp\" duration=30; category:'diag',port:53");
        assert_eq!(pairs.get("iface").unwrap(), "lo");
        assert_eq!(pairs.get("filter").unwrap(), "icmp");
        assert_eq!(pairs.get("duration").unwrap(), "30");
        assert_eq!(pairs.get("category").unwrap(), "diag");
        assert_eq!(pairs.get("port").unwrap(), "53");
    }

    #[test]
    fn request_from_alert_targets_and_rejects() {
        let server = ServerConfig::default();
        let mut alert = SampleAlert {
            module_name: "high_cpu".into(),
            capture_hint: "iface:lo filter:\"icmp\"".into(),
            capture_duration_sec: 30,
            ..SampleAlert::default()
        };

        let req = request_from_alert(&alert, &server).unwrap();
        assert_eq!(req.mode, CaptureMode::Interface);
        assert_eq!(req.iface, "lo");
        assert_eq!(req.filter, "icmp");
        assert_eq!(req.duration_sec, 30);
        assert_eq!(req.request_user, "module:high_cpu");
        assert_eq!(req.client_ip, "sample");

        alert.capture_hint = "pid:4242 duration:5".into();
        let req = request_from_alert(&alert, &server).unwrap();
        assert_eq!(req.mode, CaptureMode::Pid);
        assert_eq!(req.target_pid, 4242);
        assert_eq!(req.duration_sec, 5);

        // No recognizable target key: rejected.
        alert.capture_hint = "garbage without targets".into();
        assert!(request_from_alert(&alert, &server).is_none());

        alert.capture_hint = "pid:not_a_number".into();
        assert!(request_from_alert(&alert, &server).is_none());
    }

    #[test]
    fn start_accepts_then_dedups_then_hits_capacity() {
        let (mut manager, worker_rx, _cleanup_rx) = harness(1);

        let reply = start_and_reply(&mut manager, start_request("lo", "udp port 53"));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["capture_id"], CAPTURE_ID_START);
        assert_eq!(reply.body["mode"], "interface");
        assert_eq!(reply.body["port"], 53);
        assert!(reply.headers.iter().any(|(k, _)| k == "X-Debug-QueueMs"));

        // Worker got the dispatch; the task is Resolving with worker id 1.
        match worker_rx.try_recv().unwrap() {
            WorkerMsg::Start(start) => {
                assert_eq!(start.capture_id, CAPTURE_ID_START);
                assert_eq!(start.spec.filter, "udp port 53");
            }
            other => panic!("unexpected {:?}", other),
        }
        let task = manager.table.query(CAPTURE_ID_START).unwrap();
        assert_eq!(task.status, TaskStatus::Resolving);
        assert_eq!(task.worker_thread_index, 1);

        // Identical request: 409 referencing the live capture.
        let reply = start_and_reply(&mut manager, start_request("lo", "udp port 53"));
        assert_eq!(reply.status, 409);
        assert_eq!(reply.body["existing_capture_id"], CAPTURE_ID_START);
        assert_eq!(reply.body["status"], "resolving");

        // Different request while at max_concurrent=1: 429.
        let reply = start_and_reply(&mut manager, start_request("lo", "tcp port 80"));
        assert_eq!(reply.status, 429);
        assert_eq!(reply.body["max_concurrent"], 1);
    }

    #[test]
    fn terminal_task_frees_signature_for_reuse() {
        let (mut manager, _worker_rx, _cleanup_rx) = harness(4);

        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        assert_eq!(reply.status, 200);
        let id = reply.body["capture_id"].as_u64().unwrap() as u32;

        manager.handle(ManagerMsg::CaptureFinished {
            capture_id: id,
            result: CaptureResult { exit_code: 0, ..CaptureResult::default() },
        });
        assert_eq!(manager.table.query(id).unwrap().status, TaskStatus::Completed);

        // Same request again is accepted with a fresh id.
        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body["capture_id"], id + 1);
    }

    #[test]
    fn lifecycle_messages_drive_status() {
        let (mut manager, _worker_rx, cleanup_rx) = harness(4);
        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        let id = reply.body["capture_id"].as_u64().unwrap() as u32;

        manager.handle(ManagerMsg::CaptureStarted {
            capture_id: id,
            start_ts_us: 5_000_000,
            capture_pid: 777,
            output_file: "/tmp/x.pcap".into(),
            worker: 1,
        });
        let t = manager.table.query(id).unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.start_time, 5);
        assert_eq!(t.capture_pid, 777);

        manager.handle(ManagerMsg::CaptureProgress {
            capture_id: id,
            packets: 10,
            bytes: 1000,
            last_packet_ts_us: 6_000_000,
        });
        assert_eq!(manager.table.query(id).unwrap().packet_count, 10);

        let file = CapturedFile::new("/tmp/x.pcap".into(), 1000, 1, 6_000_000);
        manager.handle(ManagerMsg::CaptureFileReady {
            capture_id: id,
            key: "k".into(),
            sid: "s".into(),
            files: vec![file],
        });
        // File landed on the task and was forwarded to cleanup.
        assert_eq!(manager.table.query(id).unwrap().captured_files.len(), 1);
        assert!(matches!(cleanup_rx.try_recv().unwrap(), CleanupMsg::FileEnqueue { .. }));

        manager.handle(ManagerMsg::CaptureFinished {
            capture_id: id,
            result: CaptureResult {
                total_packets: 12,
                total_bytes: 1200,
                finish_ts_us: 7_000_000,
                exit_code: 0,
                ..CaptureResult::default()
            },
        });
        let t = manager.table.query(id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.packet_count, 12);
        assert_eq!(t.end_time, 7);
    }

    #[test]
    fn cancelled_exit_code_maps_to_stopped() {
        let (mut manager, _worker_rx, _cleanup_rx) = harness(4);
        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        let id = reply.body["capture_id"].as_u64().unwrap() as u32;

        manager.handle(ManagerMsg::CaptureFinished {
            capture_id: id,
            result: CaptureResult {
                exit_code: CaptureErrorCode::RunCancelled.code(),
                ..CaptureResult::default()
            },
        });
        let t = manager.table.query(id).unwrap();
        assert_eq!(t.status, TaskStatus::Stopped);
        assert_eq!(t.error_message, "stopped");
    }

    #[test]
    fn stop_unknown_and_terminal_and_active() {
        let (mut manager, worker_rx, _cleanup_rx) = harness(4);

        let (tx, rx) = crossbeam_channel::bounded(1);
        manager.handle(ManagerMsg::StopCapture { capture_id: 9999, reply: tx });
        assert_eq!(rx.recv().unwrap().status, 404);

        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        let id = reply.body["capture_id"].as_u64().unwrap() as u32;
        let _ = worker_rx.try_recv();

        // Active stop: dispatched to the worker.
        let (tx, rx) = crossbeam_channel::bounded(1);
        manager.handle(ManagerMsg::StopCapture { capture_id: id, reply: tx });
        let stop_reply = rx.recv().unwrap();
        assert_eq!(stop_reply.status, 200);
        assert_eq!(stop_reply.body["dispatched"], true);
        assert!(matches!(worker_rx.try_recv().unwrap(), WorkerMsg::Stop { .. }));
        assert!(manager.table.query(id).unwrap().stop_requested);

        // Terminal stop: idempotent reply with the terminal status.
        manager.handle(ManagerMsg::CaptureFinished {
            capture_id: id,
            result: CaptureResult {
                exit_code: CaptureErrorCode::RunCancelled.code(),
                ..CaptureResult::default()
            },
        });
        let (tx, rx) = crossbeam_channel::bounded(1);
        manager.handle(ManagerMsg::StopCapture { capture_id: id, reply: tx });
        let stop_reply = rx.recv().unwrap();
        assert_eq!(stop_reply.status, 200);
        assert_eq!(stop_reply.body["status"], "stopped");
    }

    #[test]
    fn query_returns_full_snapshot_schema() {
        let (mut manager, _worker_rx, _cleanup_rx) = harness(4);
        let reply = start_and_reply(&mut manager, start_request("lo", "udp port 53"));
        let id = reply.body["capture_id"].as_u64().unwrap() as u32;

        let (tx, rx) = crossbeam_channel::bounded(1);
        manager.handle(ManagerMsg::QueryCapture { capture_id: id, reply: tx });
        let body = rx.recv().unwrap().body;
        assert_eq!(body["capture_id"], id);
        assert_eq!(body["status"], "resolving");
        assert_eq!(body["mode"], "interface");
        assert_eq!(body["iface"], "lo");
        assert_eq!(body["filter"], "udp port 53");
        assert_eq!(body["port"], 53);
        assert_eq!(body["worker"], 1);
        assert_eq!(body["stop_requested"], false);
        assert!(body.get("error").is_none());
        assert!(body.get("files").is_none());
    }

    #[test]
    fn sample_alert_cooldown_suppresses_until_terminal() {
        let (mut manager, worker_rx, _cleanup_rx) = harness(4);
        let alert = SampleAlert {
            module_name: "high_cpu".into(),
            capture_hint: "iface:lo filter:\"icmp\"".into(),
            capture_duration_sec: 1,
            cooldown_sec: 30,
            cpu_hit: true,
            ..SampleAlert::default()
        };

        manager.handle(ManagerMsg::SampleAlert(Box::new(alert.clone())));
        let first = match worker_rx.try_recv().unwrap() {
            WorkerMsg::Start(s) => s.capture_id,
            other => panic!("unexpected {:?}", other),
        };
        let task = manager.table.query(first).unwrap();
        assert_eq!(task.request_user, "module:high_cpu");

        // Within the cooldown window: alert recorded, no new capture.
        manager.handle(ManagerMsg::SampleAlert(Box::new(alert.clone())));
        assert!(worker_rx.try_recv().is_err());

        // Terminal transition clears the cooldown; the next alert fires.
        manager.handle(ManagerMsg::CaptureFinished {
            capture_id: first,
            result: CaptureResult { exit_code: 0, ..CaptureResult::default() },
        });
        manager.handle(ManagerMsg::SampleAlert(Box::new(alert)));
        assert!(matches!(worker_rx.try_recv().unwrap(), WorkerMsg::Start(_)));
    }

    #[test]
    fn compress_done_records_archive_on_task() {
        let (mut manager, _worker_rx, _cleanup_rx) = harness(4);
        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        let id = reply.body["capture_id"].as_u64().unwrap() as u32;

        let mut file = CapturedFile::new("/tmp/a.pcap".into(), 10, 1, 1);
        manager.handle(ManagerMsg::CaptureFileReady {
            capture_id: id,
            key: "k".into(),
            sid: "s".into(),
            files: vec![file.clone()],
        });

        file.compressed = true;
        file.archive_path = "/tmp/batch_1.tar.gz".into();
        manager.handle(ManagerMsg::CleanCompressDone {
            capture_id: id,
            archive: ArchiveInfo {
                path: "/tmp/batch_1.tar.gz".into(),
                size: 5,
                compress_finish_ts: 2,
                files: vec![file],
            },
        });

        let t = manager.table.query(id).unwrap();
        assert_eq!(t.archives.len(), 1);
        assert!(t.captured_files[0].compressed);

        let body = task_status_body(&t);
        assert_eq!(body["archives"][0]["path"], "/tmp/batch_1.tar.gz");
        assert_eq!(body["archives"][0]["files"][0], "/tmp/a.pcap");
        assert_eq!(body["files"][0]["compressed"], true);
        assert_eq!(body["files"][0]["archive"], "/tmp/batch_1.tar.gz");
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let (mut manager, _worker_rx, _cleanup_rx) = harness(0);
        let reply = start_and_reply(&mut manager, start_request("lo", "udp"));
        assert_eq!(reply.status, 429);
        assert_eq!(manager.table.stats().total, 0);
    }
}
