//! Capture worker: the control actor that owns live pcap sessions.
//!
//! Each worker drains one mailbox; every accepted `Start` spawns a fresh OS
//! thread driving a non-blocking pcap loop for that capture. Stop and
//! cancel requests flip a shared flag the session polls on every loop
//! iteration, so the worst-case stop latency is one pcap timeout plus one
//! drained batch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use dashmap::DashMap;
use netcap_pdef::ProtocolDef;
use tracing::{debug, info, warn};

use crate::bus::Address;
use crate::messages::{
    CaptureResult, CaptureStart, ManagerMsg, PacketMsg, ReloadMsg, WorkerMsg, WriterMsg,
    MAX_PACKET_BYTES,
};
use crate::error::CaptureErrorCode;
use crate::packet::parse_packet;
use crate::storage::{PatternContext, DEFAULT_FILE_PATTERN};
use crate::writer::{spawn_filter_writer, FilterWriter, RotatingDump, WriterContext, WriterOutcome};

fn now_us() -> i64 {
    chrono::Local::now().timestamp_micros()
}

/// Stop request state shared between the worker control loop and one
/// session thread.
#[derive(Debug)]
pub struct SessionStop {
    requested: AtomicBool,
    reason: Mutex<(CaptureErrorCode, String)>,
}

impl SessionStop {
    fn new() -> Arc<SessionStop> {
        Arc::new(SessionStop {
            requested: AtomicBool::new(false),
            reason: Mutex::new((CaptureErrorCode::None, String::new())),
        })
    }

    pub fn request(&self, code: CaptureErrorCode, message: &str) {
        {
            let mut guard = self.reason.lock().unwrap();
            if guard.0 == CaptureErrorCode::None {
                *guard = (code, message.to_string());
            }
        }
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn reason(&self) -> (CaptureErrorCode, String) {
        let guard = self.reason.lock().unwrap();
        if guard.0 == CaptureErrorCode::None {
            (CaptureErrorCode::RunCancelled, "capture_stopped".into())
        } else {
            guard.clone()
        }
    }
}

/// Worker control loop. `id` is the worker's bus identity recorded on
/// dispatched tasks.
pub fn run(
    id: u32,
    rx: Receiver<WorkerMsg>,
    manager: Address<ManagerMsg>,
    reload: Address<ReloadMsg>,
) {
    let sessions: Arc<DashMap<u32, Arc<SessionStop>>> = Arc::new(DashMap::new());
    info!(worker = id, "capture worker started");

    for msg in rx {
        match msg {
            WorkerMsg::Start(start) => {
                handle_start(id, *start, &sessions, &manager, &reload);
            }
            WorkerMsg::Stop { capture_id, reason } => {
                match sessions.get(&capture_id) {
                    Some(stop) => stop.request(CaptureErrorCode::RunCancelled, &reason),
                    None => warn!(worker = id, capture_id, "stop request for unknown capture"),
                }
            }
            WorkerMsg::Cancel { capture_id, error_code, reason } => {
                match sessions.get(&capture_id) {
                    Some(stop) => stop.request(error_code, &reason),
                    None => warn!(worker = id, capture_id, "cancel request for unknown capture"),
                }
            }
        }
    }

    debug!(worker = id, "capture worker mailbox closed");
}

fn handle_start(
    worker_id: u32,
    start: CaptureStart,
    sessions: &Arc<DashMap<u32, Arc<SessionStop>>>,
    manager: &Address<ManagerMsg>,
    reload: &Address<ReloadMsg>,
) {
    let capture_id = start.capture_id;
    let stop = SessionStop::new();
    sessions.insert(capture_id, stop.clone());

    let sessions_for_thread = sessions.clone();
    let manager_for_thread = manager.clone();
    let reload_for_thread = reload.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("capture-{}", capture_id))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                run_session(worker_id, &start, &stop, &manager_for_thread, &reload_for_thread)
            }));
            if result.is_err() {
                warn!(capture_id, "capture session panicked");
                let _ = manager_for_thread.send(ManagerMsg::CaptureFailed {
                    capture_id,
                    error_code: CaptureErrorCode::Unknown,
                    error_message: "capture_session_panicked".into(),
                    last_packets: 0,
                    last_bytes: 0,
                });
            }
            sessions_for_thread.remove(&capture_id);
        });

    if let Err(e) = spawned {
        sessions.remove(&capture_id);
        warn!(capture_id, "failed to spawn capture session: {}", e);
        let _ = manager.send(ManagerMsg::CaptureFailed {
            capture_id,
            error_code: CaptureErrorCode::Unknown,
            error_message: "spawn_capture_thread_failed".into(),
            last_packets: 0,
            last_bytes: 0,
        });
    }
}

/// Either a dedicated writer thread or the synchronous fallback used when
/// the thread could not be spawned.
enum WriterHandle {
    Thread {
        tx: crossbeam_channel::Sender<WriterMsg>,
        join: std::thread::JoinHandle<WriterOutcome>,
    },
    Inline(Box<FilterWriter>),
}

impl WriterHandle {
    fn deliver(&mut self, msg: PacketMsg, dropped: &mut u64) {
        match self {
            WriterHandle::Thread { tx, .. } => {
                if tx.try_send(WriterMsg::Packet(msg)).is_err() {
                    *dropped += 1;
                }
            }
            WriterHandle::Inline(fw) => fw.handle_packet(&msg),
        }
    }

    fn finish(self) -> Option<WriterOutcome> {
        match self {
            WriterHandle::Thread { tx, join } => {
                let _ = tx.try_send(WriterMsg::Shutdown);
                drop(tx);
                join.join().ok()
            }
            WriterHandle::Inline(fw) => Some(fw.finish()),
        }
    }
}

fn send_failure(
    manager: &Address<ManagerMsg>,
    capture_id: u32,
    code: CaptureErrorCode,
    message: String,
    packets: u64,
    bytes: u64,
) {
    let _ = manager.send(ManagerMsg::CaptureFailed {
        capture_id,
        error_code: code,
        error_message: message,
        last_packets: packets,
        last_bytes: bytes,
    });
}

fn load_protocol(start: &CaptureStart) -> Option<Arc<ProtocolDef>> {
    let spec = &start.spec;
    if !spec.protocol_filter_inline.is_empty() {
        match netcap_pdef::parse_str(&spec.protocol_filter_inline) {
            Ok(proto) => {
                info!(capture_id = start.capture_id, protocol = %proto.name,
                      rules = proto.filters.len(), "loaded inline protocol filter");
                return Some(Arc::new(proto));
            }
            Err(e) => {
                // A bad protocol filter degrades to an unfiltered capture.
                warn!(capture_id = start.capture_id, "inline PDEF parse failed: {}", e);
                return None;
            }
        }
    }
    if !spec.protocol_filter.is_empty() {
        match netcap_pdef::parse_file(std::path::Path::new(&spec.protocol_filter)) {
            Ok(proto) => {
                info!(capture_id = start.capture_id, protocol = %proto.name,
                      rules = proto.filters.len(), path = %spec.protocol_filter,
                      "loaded protocol filter");
                return Some(Arc::new(proto));
            }
            Err(e) => {
                warn!(capture_id = start.capture_id, path = %spec.protocol_filter,
                      "PDEF load failed: {}", e);
                return None;
            }
        }
    }
    None
}

fn run_session(
    worker_id: u32,
    start: &CaptureStart,
    stop: &Arc<SessionStop>,
    manager: &Address<ManagerMsg>,
    reload: &Address<ReloadMsg>,
) {
    let capture_id = start.capture_id;
    let spec = &start.spec;
    let config = &start.config;

    let iface =
        if spec.resolved_iface.is_empty() { &spec.iface } else { &spec.resolved_iface }.clone();
    let duration_sec = if spec.max_duration_sec > 0 {
        spec.max_duration_sec
    } else {
        config.max_duration_sec.max(0)
    };
    let rotation_cap = config.max_bytes;
    let total_byte_cap = spec.max_bytes;
    let total_packet_cap =
        if spec.max_packets > 0 { spec.max_packets } else { config.max_packets };
    let snaplen = if spec.snaplen > 0 { spec.snaplen } else { config.snaplen };

    // ── pcap handle ─────────────────────────────────────────────────────
    let inactive = match pcap::Capture::from_device(iface.as_str()) {
        Ok(c) => c,
        Err(e) => {
            send_failure(
                manager,
                capture_id,
                CaptureErrorCode::StartCaptureFailed,
                format!("pcap_open_failed for {}: {}", iface, e),
                0,
                0,
            );
            return;
        }
    };

    let mut cap = match inactive.snaplen(snaplen).promisc(true).timeout(1).open() {
        Ok(c) => c,
        Err(e) => {
            send_failure(
                manager,
                capture_id,
                CaptureErrorCode::StartCaptureFailed,
                format!("pcap_activate_failed for {}: {}", iface, e),
                0,
                0,
            );
            return;
        }
    };

    if !spec.filter.is_empty() {
        // BPF compile failure is non-fatal: the capture continues
        // unfiltered, matching legacy behavior.
        if let Err(e) = cap.filter(&spec.filter, true) {
            warn!(capture_id, bpf = %spec.filter, "BPF compile failed, capturing unfiltered: {}", e);
        }
    }

    let mut cap = match cap.setnonblock() {
        Ok(c) => c,
        Err(e) => {
            send_failure(
                manager,
                capture_id,
                CaptureErrorCode::StartCaptureFailed,
                format!("pcap_setnonblock_failed: {}", e),
                0,
                0,
            );
            return;
        }
    };

    // ── Protocol filter & output ────────────────────────────────────────
    let protocol = load_protocol(start);

    let start_wall_secs = chrono::Local::now().timestamp();
    let pattern = PatternContext {
        base_dir: if config.output_dir.is_empty() {
            "capture_output".into()
        } else {
            config.output_dir.clone()
        },
        pattern: if !spec.output_pattern.is_empty() {
            spec.output_pattern.clone()
        } else if !config.filename_template.is_empty() {
            config.filename_template.clone()
        } else {
            DEFAULT_FILE_PATTERN.into()
        },
        category: if spec.category.is_empty() {
            config.default_category.clone()
        } else {
            spec.category.clone()
        },
        iface: iface.clone(),
        proc_label: spec.proc_name.clone(),
        port: spec.port_filter,
        seq: 0,
        start_time: start_wall_secs,
    };

    let dump = match RotatingDump::open(
        pattern,
        snaplen.max(0) as u32,
        rotation_cap,
        config.compress_enabled,
        config.compress_format.clone(),
    ) {
        Ok(d) => d,
        Err(e) => {
            send_failure(
                manager,
                capture_id,
                CaptureErrorCode::StartCreateFileFailed,
                format!("output_open_failed: {}", e),
                0,
                0,
            );
            return;
        }
    };

    let initial_file = dump.current_path().to_string();
    let written_bytes = Arc::new(AtomicU64::new(0));

    let writer_ctx = WriterContext {
        capture_id,
        key: start.key.clone(),
        sid: start.sid.clone(),
        protocol,
        manager: manager.clone(),
        reload: reload.clone(),
        written_bytes: written_bytes.clone(),
    };

    let filter_writer = FilterWriter::new(writer_ctx, dump);
    let (writer_tx, writer_rx) = crossbeam_channel::bounded::<WriterMsg>(4096);
    let mut writer = match spawn_filter_writer(filter_writer, writer_rx) {
        Ok(join) => WriterHandle::Thread { tx: writer_tx, join },
        Err(fw) => {
            // Legacy fallback: filter and write synchronously inside the
            // pcap loop when no writer thread could be spawned.
            warn!(capture_id, "filter/writer spawn failed, falling back to inline writes");
            drop(writer_tx);
            WriterHandle::Inline(fw)
        }
    };

    let start_ts_us = now_us();
    let _ = manager.send(ManagerMsg::CaptureStarted {
        capture_id,
        start_ts_us,
        capture_pid: std::process::id() as i32,
        output_file: initial_file,
        worker: worker_id,
    });

    // ── Capture loop ────────────────────────────────────────────────────
    let deadline_secs =
        if duration_sec > 0 { Some(start_wall_secs + duration_sec) } else { None };
    let interval_us = i64::from(config.progress_interval_sec) * 1_000_000;
    let packet_threshold = config.progress_packet_threshold;
    let bytes_threshold = config.progress_bytes_threshold;

    let mut packets: u64 = 0;
    let mut dropped: u64 = 0;
    let mut last_report_packets: u64 = 0;
    let mut last_report_bytes: u64 = 0;
    let mut last_report_ts = start_ts_us;
    let mut last_packet_ts = start_ts_us;
    let mut failure: Option<(CaptureErrorCode, String)> = None;

    loop {
        if stop.is_requested() {
            break;
        }
        if let Some(deadline) = deadline_secs {
            if chrono::Local::now().timestamp() >= deadline {
                break;
            }
        }
        if total_packet_cap > 0 && packets >= total_packet_cap {
            break;
        }
        if total_byte_cap > 0 && written_bytes.load(Ordering::Relaxed) >= total_byte_cap {
            break;
        }

        match cap.next_packet() {
            Ok(p) => {
                packets += 1;
                last_packet_ts = now_us();

                let caplen = (p.header.caplen as usize).min(p.data.len()).min(MAX_PACKET_BYTES);
                let data = p.data[..caplen].to_vec();
                let parsed = parse_packet(&data);
                let msg = PacketMsg {
                    ts_sec: p.header.ts.tv_sec as i64,
                    ts_usec: p.header.ts.tv_usec as u32,
                    caplen: caplen as u32,
                    orig_len: p.header.len,
                    data,
                    src_port: parsed.src_port,
                    dst_port: parsed.dst_port,
                    app_offset: parsed.app_offset,
                    app_len: parsed.app_len,
                    valid: parsed.valid,
                };
                writer.deliver(msg, &mut dropped);
            }
            Err(pcap::Error::TimeoutExpired) => {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            Err(e) => {
                failure =
                    Some((CaptureErrorCode::RunCaptureDied, format!("pcap_error: {}", e)));
                break;
            }
        }

        let now = now_us();
        let bytes = written_bytes.load(Ordering::Relaxed);
        let should_report = (interval_us > 0 && now - last_report_ts >= interval_us)
            || (packet_threshold > 0 && packets - last_report_packets >= packet_threshold)
            || (bytes_threshold > 0 && bytes - last_report_bytes >= bytes_threshold);
        if should_report {
            let _ = manager.send(ManagerMsg::CaptureProgress {
                capture_id,
                packets,
                bytes,
                last_packet_ts_us: last_packet_ts,
            });
            last_report_packets = packets;
            last_report_bytes = bytes;
            last_report_ts = now;
        }
    }

    drop(cap);

    // ── Drain the writer and report ─────────────────────────────────────
    let outcome = writer.finish();
    let finish_ts_us = now_us();

    let (final_files, total_bytes) = match outcome {
        Some(o) => {
            if dropped > 0 {
                warn!(capture_id, dropped, "packets dropped on writer back-pressure");
            }
            (o.final_file.map(|f| vec![f]).unwrap_or_default(), o.written_bytes)
        }
        None => (Vec::new(), written_bytes.load(Ordering::Relaxed)),
    };

    if !final_files.is_empty() {
        let _ = manager.send(ManagerMsg::CaptureFileReady {
            capture_id,
            key: start.key.clone(),
            sid: start.sid.clone(),
            files: final_files,
        });
    }

    if let Some((code, message)) = failure {
        send_failure(manager, capture_id, code, message, packets, total_bytes);
        return;
    }

    let mut result = CaptureResult {
        total_packets: packets,
        total_bytes,
        start_ts_us,
        finish_ts_us,
        exit_code: 0,
        error_message: String::new(),
    };
    if stop.is_requested() {
        let (code, message) = stop.reason();
        result.exit_code = code.code();
        result.error_message = message;
    }

    let _ = manager.send(ManagerMsg::CaptureFinished { capture_id, result });
}
