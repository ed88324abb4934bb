//! Capture task model: the per-capture record held by the task table and
//! the file/archive bookkeeping attached to it.

use serde::Serialize;

/// What a capture request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Interface,
    Process,
    Pid,
    Container,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Interface => "interface",
            CaptureMode::Process => "process",
            CaptureMode::Pid => "pid",
            CaptureMode::Container => "container",
        }
    }

    pub fn parse(s: &str) -> Option<CaptureMode> {
        match s {
            "interface" => Some(CaptureMode::Interface),
            "process" => Some(CaptureMode::Process),
            "pid" => Some(CaptureMode::Pid),
            "container" => Some(CaptureMode::Container),
            _ => None,
        }
    }
}

/// Task lifecycle. Transitions are strictly forward:
/// Pending → Resolving → Running → {Completed | Failed | Stopped},
/// with Pending → {Failed | Stopped} allowed for tasks that never dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Resolving,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Resolving => "resolving",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }

    /// Active statuses block new tasks with the same signature.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Resolving | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// One produced capture file. `path` is stable for the task's lifetime;
/// compression updates the entry in place but never removes it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CapturedFile {
    pub path: String,
    pub size: u64,
    pub segment_index: u32,
    pub total_segments: u32,
    pub ready_ts: i64,
    pub compressed: bool,
    pub archive_path: String,
    pub compress_finish_ts: i64,
    /// Metadata-record file this file was logged to by the cleanup actor.
    pub record_path: String,
}

impl CapturedFile {
    pub fn new(path: String, size: u64, segment_index: u32, ready_ts: i64) -> CapturedFile {
        CapturedFile {
            path,
            size,
            segment_index,
            total_segments: 1,
            ready_ts,
            ..CapturedFile::default()
        }
    }
}

/// A batch archive produced by the cleanup actor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveInfo {
    pub path: String,
    pub size: u64,
    pub compress_finish_ts: i64,
    pub files: Vec<CapturedFile>,
}

/// Per-capture record. Owned by the task table; mutations go through the
/// table's copy-on-write updaters, so a reference obtained from a query is
/// an immutable snapshot.
#[derive(Debug, Clone, Default)]
pub struct CaptureTask {
    pub capture_id: u32,
    /// Coarse operator-visible dedup key (mode + target + filter).
    pub key: String,
    /// 16-hex-digit FNV-1a-64 of the normalized request.
    pub signature: String,
    /// signature ‖ millisecond local timestamp.
    pub sid: String,

    pub mode: CaptureMode,
    pub iface: String,
    pub proc_name: String,
    pub target_pid: i32,
    pub container_id: String,
    pub netns_path: String,

    pub filter: String,
    pub protocol_filter: String,
    pub ip_filter: String,
    pub port_filter: u16,

    pub category: String,
    pub file_pattern: String,
    pub duration_sec: i64,
    pub max_bytes: u64,
    pub max_packets: u64,

    pub status: TaskStatus,

    pub capture_pid: i32,
    pub output_file: String,
    pub start_time: i64,
    pub end_time: i64,

    pub matched_pids: Vec<i32>,
    pub resolved_iface: String,
    /// 0 until dispatched; thereafter a live worker identity.
    pub worker_thread_index: u32,
    pub stop_requested: bool,
    pub cancel_requested: bool,

    pub packet_count: u64,
    pub bytes_captured: u64,
    pub error_message: String,

    pub captured_files: Vec<CapturedFile>,
    pub archives: Vec<ArchiveInfo>,

    pub client_ip: String,
    pub request_user: String,
}

/// Aggregated per-status counts, read from the table's atomics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub resolving: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}
