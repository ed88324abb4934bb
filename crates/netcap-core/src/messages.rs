//! Typed messages exchanged between actors.
//!
//! Request/reply is modelled as a message carrying a bounded(1) reply
//! sender; the HTTP layer blocks on that channel with a timeout. Lifecycle
//! messages flow worker → manager, file messages manager → cleanup →
//! manager, and the endian writeback filter/writer → reload.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;
use netcap_pdef::DetectedEndian;

use crate::config::CaptureConfigSnapshot;
use crate::error::CaptureErrorCode;
use crate::task::{ArchiveInfo, CaptureMode, CapturedFile};

// ─── HTTP request/reply envelope ─────────────────────────────────────────────

/// Reply produced by the manager for an HTTP-originated request.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: serde_json::Value,
    pub headers: Vec<(String, String)>,
}

impl HttpReply {
    pub fn json(status: u16, body: serde_json::Value) -> HttpReply {
        HttpReply { status, body, headers: Vec::new() }
    }
}

pub type ReplyTo = Sender<HttpReply>;

// ─── Capture request & spec ──────────────────────────────────────────────────

/// Operator intent as decoded by the HTTP layer or synthesized from a
/// sampler capture hint. Exactly one of the target fields identifies the
/// capture target, selected by `mode`.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub mode: CaptureMode,
    pub iface: String,
    pub proc_name: String,
    pub target_pid: i32,
    pub container_id: String,
    pub netns_path: String,

    pub filter: String,
    /// PDEF file path.
    pub protocol_filter: String,
    /// Inline PDEF text; preferred over the path when both are set.
    pub protocol_filter_inline: String,
    pub ip_filter: String,
    pub port_filter: u16,

    pub category: String,
    pub file_pattern: String,
    pub duration_sec: i64,
    pub max_bytes: u64,
    pub max_packets: u64,

    pub client_ip: String,
    pub request_user: String,
    /// Milliseconds wall clock when the request entered the system; used
    /// for the X-Debug-QueueMs reply header.
    pub enqueue_ts_ms: u64,
}

/// Fully resolved capture parameters handed to a worker.
#[derive(Debug, Clone, Default)]
pub struct CaptureSpec {
    pub mode: CaptureMode,
    pub iface: String,
    pub resolved_iface: String,
    pub proc_name: String,
    pub target_pid: i32,
    pub container_id: String,
    pub netns_path: String,

    pub category: String,
    pub filter: String,
    pub protocol_filter: String,
    pub protocol_filter_inline: String,
    pub ip_filter: String,
    pub port_filter: u16,

    pub output_pattern: String,
    pub max_duration_sec: i64,
    pub max_bytes: u64,
    pub max_packets: u64,
    pub snaplen: i32,
}

// ─── Manager mailbox ─────────────────────────────────────────────────────────

/// Final stats reported by a finished session.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub start_ts_us: i64,
    pub finish_ts_us: i64,
    pub exit_code: u32,
    pub error_message: String,
}

/// Resource sample that crossed a threshold.
#[derive(Debug, Clone, Default)]
pub struct SampleAlert {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_rx_kbps: f64,
    pub network_tx_kbps: f64,
    pub cpu_hit: bool,
    pub mem_hit: bool,
    pub net_hit: bool,
    pub module_name: String,
    pub capture_hint: String,
    pub capture_category: String,
    pub capture_duration_sec: i64,
    pub cooldown_sec: i64,
    pub cpu_threshold: f64,
    pub mem_threshold: f64,
    pub net_threshold: f64,
}

#[derive(Debug)]
pub enum ManagerMsg {
    /// Start request; `reply` is None for sampler-originated captures.
    StartCapture { request: CaptureRequest, reply: Option<ReplyTo> },
    StopCapture { capture_id: u32, reply: ReplyTo },
    QueryCapture { capture_id: u32, reply: ReplyTo },

    // Worker lifecycle reports.
    CaptureStarted {
        capture_id: u32,
        start_ts_us: i64,
        capture_pid: i32,
        output_file: String,
        worker: u32,
    },
    CaptureProgress { capture_id: u32, packets: u64, bytes: u64, last_packet_ts_us: i64 },
    CaptureFileReady { capture_id: u32, key: String, sid: String, files: Vec<CapturedFile> },
    CaptureFinished { capture_id: u32, result: CaptureResult },
    CaptureFailed {
        capture_id: u32,
        error_code: CaptureErrorCode,
        error_message: String,
        last_packets: u64,
        last_bytes: u64,
    },

    // Sampler.
    SampleAlert(Box<SampleAlert>),

    // Cleanup reports.
    CleanCompressDone { capture_id: u32, archive: ArchiveInfo },
    CleanCompressFailed {
        capture_id: u32,
        files: Vec<CapturedFile>,
        error_code: CaptureErrorCode,
        error_message: String,
    },
    /// A file gained its metadata-record path; merge it back into the task.
    FileRecorded { capture_id: u32, files: Vec<CapturedFile> },

    ConfigRefresh {
        strategy: Arc<crate::config::StrategyConfig>,
        snapshot: Arc<CaptureConfigSnapshot>,
    },
}

// ─── Worker mailbox ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CaptureStart {
    pub capture_id: u32,
    pub key: String,
    pub sid: String,
    pub config: Arc<CaptureConfigSnapshot>,
    pub spec: CaptureSpec,
}

#[derive(Debug)]
pub enum WorkerMsg {
    Start(Box<CaptureStart>),
    Stop { capture_id: u32, reason: String },
    Cancel { capture_id: u32, error_code: CaptureErrorCode, reason: String },
}

// ─── Filter/writer mailbox ───────────────────────────────────────────────────

/// Raw bytes are bounded to 64 KiB at capture time.
pub const MAX_PACKET_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct PacketMsg {
    pub ts_sec: i64,
    pub ts_usec: u32,
    pub caplen: u32,
    pub orig_len: u32,
    pub data: Vec<u8>,
    pub src_port: u16,
    pub dst_port: u16,
    pub app_offset: u32,
    pub app_len: u32,
    /// False when outer-layer parsing failed (unsupported EtherType,
    /// non-TCP/UDP, truncated headers).
    pub valid: bool,
}

#[derive(Debug)]
pub enum WriterMsg {
    Packet(PacketMsg),
    Shutdown,
}

// ─── Cleanup mailbox ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CleanupMsg {
    FileEnqueue {
        capture_id: u32,
        key: String,
        sid: String,
        files: Vec<CapturedFile>,
        policy: Arc<CaptureConfigSnapshot>,
    },
    ConfigRefresh(Arc<CaptureConfigSnapshot>),
    Shutdown,
}

// ─── Reload mailbox ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ReloadMsg {
    /// One-shot AUTO-endian detection result; triggers the best-effort
    /// source-file writeback.
    PdefEndianDetected { source_path: PathBuf, endian: DetectedEndian },
}

// ─── Sampler mailbox ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SamplerMsg {
    ConfigRefresh(Arc<crate::config::StrategyConfig>),
}
