//! Per-capture filter/writer stage.
//!
//! One thread per capture serializes the write path: packets arrive from
//! the pcap loop as messages, run through the protocol-filter VM when a
//! protocol is bound, and matching packets land in a rotating pcap file.
//! Rotation closes emit `CaptureFileReady` toward the manager; the final
//! file is returned to the owning session instead. Writing happens off the
//! capture hot path so rotation (and legacy inline compression) never
//! stalls the pcap loop.

use std::fs::File;
use std::io::BufWriter;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use netcap_pdef::{protocol_match, DetectedEndian, EndianMode, ProtocolDef};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use tracing::{debug, info, warn};

use crate::bus::Address;
use crate::messages::{ManagerMsg, PacketMsg, ReloadMsg, WriterMsg};
use crate::storage::{ensure_parent_dir, expand_pattern, PatternContext};
use crate::task::CapturedFile;

/// On-disk pcap per-record header length, charged per packet against the
/// rotation byte cap.
pub const PCAP_RECORD_HEADER_LEN: u64 = 16;

fn now_us() -> i64 {
    chrono::Local::now().timestamp_micros()
}

// ─── Rotating pcap dump ──────────────────────────────────────────────────────

/// A pcap file that was rotated closed.
#[derive(Debug, Clone)]
pub struct ClosedFile {
    pub path: String,
    pub size: u64,
    pub segment_index: u32,
}

impl ClosedFile {
    pub fn into_captured(self, ready_ts: i64) -> CapturedFile {
        CapturedFile::new(self.path, self.size, self.segment_index, ready_ts)
    }
}

/// Rotating pcap output. The sequence counter feeds the `{seq}` pattern
/// token; byte accounting charges the record header plus the captured
/// length, matching the on-disk growth.
pub struct RotatingDump {
    pattern: PatternContext,
    snaplen: u32,
    max_bytes: u64,
    compress_enabled: bool,
    compress_cmd: String,
    writer: Option<PcapWriter<BufWriter<File>>>,
    current_path: String,
    written: u64,
}

impl RotatingDump {
    /// Open the first output file.
    pub fn open(
        pattern: PatternContext,
        snaplen: u32,
        max_bytes: u64,
        compress_enabled: bool,
        compress_cmd: String,
    ) -> std::io::Result<RotatingDump> {
        let mut dump = RotatingDump {
            pattern,
            snaplen,
            max_bytes,
            compress_enabled,
            compress_cmd,
            writer: None,
            current_path: String::new(),
            written: 0,
        };
        dump.open_next()?;
        Ok(dump)
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn header(&self) -> PcapHeader {
        PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen: self.snaplen,
            datalink: DataLink::ETHERNET,
            ts_resolution: TsResolution::MicroSecond,
            endianness: Endianness::native(),
        }
    }

    fn open_next(&mut self) -> std::io::Result<()> {
        self.pattern.seq += 1;
        self.written = 0;
        self.current_path = expand_pattern(&self.pattern);
        ensure_parent_dir(&self.current_path)?;

        let file = File::create(&self.current_path)?;
        let writer = PcapWriter::with_header(BufWriter::new(file), self.header())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.writer = Some(writer);
        Ok(())
    }

    fn close_current(&mut self) -> Option<ClosedFile> {
        // Dropping the PcapWriter flushes its BufWriter.
        self.writer = None;
        if self.current_path.is_empty() {
            return None;
        }

        if self.compress_enabled {
            let cmd =
                if self.compress_cmd.is_empty() { "gzip -9" } else { self.compress_cmd.as_str() };
            let line = format!("{} '{}'", cmd, self.current_path);
            match Command::new("sh").arg("-c").arg(&line).status() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(path = %self.current_path, code = status.code().unwrap_or(-1),
                          "inline compression command failed");
                }
                Err(e) => warn!(path = %self.current_path, "inline compression spawn failed: {}", e),
            }
        }

        let size = std::fs::metadata(&self.current_path).map(|m| m.len()).unwrap_or(self.written);
        Some(ClosedFile {
            path: self.current_path.clone(),
            size,
            segment_index: self.pattern.seq,
        })
    }

    /// Rotate to the next file; returns the file just closed.
    fn rotate(&mut self) -> std::io::Result<Option<ClosedFile>> {
        let closed = self.close_current();
        self.open_next()?;
        Ok(closed)
    }

    /// Write one packet, rotating first when the byte cap would be crossed.
    pub fn write_packet(&mut self, msg: &PacketMsg) -> std::io::Result<Option<ClosedFile>> {
        let record_bytes = PCAP_RECORD_HEADER_LEN + u64::from(msg.caplen);

        let mut closed = None;
        if self.max_bytes > 0 && self.written + record_bytes > self.max_bytes {
            closed = self.rotate()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "dump not open"))?;

        let data_len = msg.data.len().min(msg.caplen as usize);
        let ts = Duration::new(msg.ts_sec.max(0) as u64, msg.ts_usec.saturating_mul(1000));
        let pkt = PcapPacket::new(ts, msg.orig_len, &msg.data[..data_len]);
        writer
            .write_packet(&pkt)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.written += record_bytes;
        Ok(closed)
    }

    /// Final flush and close; returns the last file.
    pub fn close(mut self) -> Option<ClosedFile> {
        self.close_current()
    }
}

// ─── Filter/writer engine ────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct FilterStats {
    pub processed: u64,
    pub matched: u64,
    pub filtered: u64,
    pub write_errors: u64,
}

/// Everything the filter/writer needs besides the dump itself.
pub struct WriterContext {
    pub capture_id: u32,
    pub key: String,
    pub sid: String,
    pub protocol: Option<Arc<ProtocolDef>>,
    pub manager: Address<ManagerMsg>,
    pub reload: Address<ReloadMsg>,
    /// Shared with the session thread for progress reports and byte caps.
    pub written_bytes: Arc<AtomicU64>,
}

pub struct WriterOutcome {
    pub stats: FilterStats,
    pub final_file: Option<CapturedFile>,
    pub written_bytes: u64,
}

/// The per-packet pipeline. Used by the writer thread and, when thread
/// spawn fails, synchronously from the pcap loop (legacy fallback).
pub struct FilterWriter {
    pub(crate) ctx: WriterContext,
    dump: RotatingDump,
    stats: FilterStats,
}

impl FilterWriter {
    pub fn new(ctx: WriterContext, dump: RotatingDump) -> FilterWriter {
        FilterWriter { ctx, dump, stats: FilterStats::default() }
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    fn apply_filter(&self, msg: &PacketMsg, proto: &ProtocolDef) -> bool {
        if !msg.valid || msg.app_len == 0 {
            return false;
        }
        let start = msg.app_offset as usize;
        let end = start + msg.app_len as usize;
        if end > msg.data.len() {
            return false;
        }
        let app = &msg.data[start..end];

        // Destination port first, then source for the reverse direction.
        protocol_match(app, msg.dst_port, proto) || protocol_match(app, msg.src_port, proto)
    }

    /// One-shot endian writeback: the first filter/writer to observe the
    /// AUTO detection settle forwards it to the reload actor. Inline PDEFs
    /// (no source path) skip the writeback.
    fn maybe_send_endian_writeback(&self, before: DetectedEndian, proto: &ProtocolDef) {
        if proto.endian_mode != EndianMode::Auto || before != DetectedEndian::Unknown {
            return;
        }
        let after = proto.detected_endian();
        if after == DetectedEndian::Unknown || !proto.claim_writeback() {
            return;
        }
        let path = match &proto.source_path {
            Some(p) => p.clone(),
            None => return,
        };
        info!(capture_id = self.ctx.capture_id, pdef = %path.display(),
              endian = after.name(), "queueing PDEF endian writeback");
        if let Err(e) =
            self.ctx.reload.send(ReloadMsg::PdefEndianDetected { source_path: path, endian: after })
        {
            warn!("endian writeback send failed: {}", e);
        }
    }

    pub fn handle_packet(&mut self, msg: &PacketMsg) {
        self.stats.processed += 1;

        if let Some(proto) = self.ctx.protocol.clone() {
            let before = proto.detected_endian();
            let matched = self.apply_filter(msg, &proto);
            self.maybe_send_endian_writeback(before, &proto);

            if !matched {
                self.stats.filtered += 1;
                return;
            }
        }

        match self.dump.write_packet(msg) {
            Ok(closed) => {
                self.stats.matched += 1;
                self.ctx.written_bytes.store(self.dump.written(), Ordering::Relaxed);
                if let Some(closed) = closed {
                    let file = closed.into_captured(now_us());
                    if let Err(e) = self.ctx.manager.send(ManagerMsg::CaptureFileReady {
                        capture_id: self.ctx.capture_id,
                        key: self.ctx.key.clone(),
                        sid: self.ctx.sid.clone(),
                        files: vec![file],
                    }) {
                        warn!("file-ready send failed: {}", e);
                    }
                }
            }
            Err(e) => {
                self.stats.write_errors += 1;
                warn!(capture_id = self.ctx.capture_id, "packet write failed: {}", e);
            }
        }
    }

    pub fn finish(self) -> WriterOutcome {
        let written = self.dump.written();
        let final_file = self.dump.close().map(|c| c.into_captured(now_us()));
        if self.ctx.protocol.is_some() {
            debug!(
                capture_id = self.ctx.capture_id,
                processed = self.stats.processed,
                matched = self.stats.matched,
                filtered = self.stats.filtered,
                "filter/writer finished"
            );
        }
        WriterOutcome { stats: self.stats, final_file, written_bytes: written }
    }
}

/// Spawn the filter/writer thread. The thread drains its mailbox until
/// `Shutdown` (or sender hang-up) and returns the outcome to the joiner.
///
/// When the OS refuses a new thread the writer is handed back so the
/// session can fall back to synchronous writes inside the pcap loop.
pub fn spawn_filter_writer(
    fw: FilterWriter,
    rx: Receiver<WriterMsg>,
) -> Result<JoinHandle<WriterOutcome>, Box<FilterWriter>> {
    let capture_id = fw.ctx.capture_id;
    let (hand_tx, hand_rx) = crossbeam_channel::bounded::<FilterWriter>(1);

    let spawned = std::thread::Builder::new()
        .name(format!("filter-writer-{}", capture_id))
        .spawn(move || {
            let mut fw = match hand_rx.recv() {
                Ok(fw) => fw,
                Err(_) => {
                    return WriterOutcome {
                        stats: FilterStats::default(),
                        final_file: None,
                        written_bytes: 0,
                    }
                }
            };
            for msg in rx {
                match msg {
                    WriterMsg::Packet(p) => fw.handle_packet(&p),
                    WriterMsg::Shutdown => break,
                }
            }
            fw.finish()
        });

    match spawned {
        Ok(join) => {
            hand_tx.send(fw).expect("writer thread hung up before handoff");
            Ok(join)
        }
        Err(_) => Err(Box::new(fw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mailbox;
    use crate::packet::{build_udp_frame, parse_packet};
    use netcap_pdef::parse_str;

    fn packet_msg(frame: Vec<u8>) -> PacketMsg {
        let parsed = parse_packet(&frame);
        PacketMsg {
            ts_sec: 1_700_000_000,
            ts_usec: 0,
            caplen: frame.len() as u32,
            orig_len: frame.len() as u32,
            data: frame,
            src_port: parsed.src_port,
            dst_port: parsed.dst_port,
            app_offset: parsed.app_offset,
            app_len: parsed.app_len,
            valid: parsed.valid,
        }
    }

    fn test_dump(dir: &std::path::Path, max_bytes: u64) -> RotatingDump {
        let pattern = PatternContext {
            base_dir: dir.to_string_lossy().into_owned(),
            pattern: "cap-{seq}.pcap".into(),
            iface: "lo".into(),
            start_time: 1_700_000_000,
            ..PatternContext::default()
        };
        RotatingDump::open(pattern, 65535, max_bytes, false, String::new()).unwrap()
    }

    fn test_ctx(
        protocol: Option<Arc<ProtocolDef>>,
    ) -> (WriterContext, crossbeam_channel::Receiver<ManagerMsg>, crossbeam_channel::Receiver<ReloadMsg>)
    {
        let (manager, mgr_rx) = mailbox("manager", 64);
        let (reload, reload_rx) = mailbox("reload", 16);
        let ctx = WriterContext {
            capture_id: 1000,
            key: "k".into(),
            sid: "s".into(),
            protocol,
            manager,
            reload,
            written_bytes: Arc::new(AtomicU64::new(0)),
        };
        (ctx, mgr_rx, reload_rx)
    }

    #[test]
    fn unfiltered_packets_are_written() {
        let dir = tempdir("writer_plain");
        let dump = test_dump(&dir, 0);
        let (ctx, _mgr_rx, _reload_rx) = test_ctx(None);
        let mut fw = FilterWriter::new(ctx, dump);

        fw.handle_packet(&packet_msg(build_udp_frame(1000, 2000, b"abc")));
        fw.handle_packet(&packet_msg(build_udp_frame(1000, 2000, b"defg")));
        let outcome = fw.finish();

        assert_eq!(outcome.stats.processed, 2);
        assert_eq!(outcome.stats.matched, 2);
        assert_eq!(outcome.stats.filtered, 0);
        let file = outcome.final_file.unwrap();
        assert!(file.path.ends_with("cap-0001.pcap"));
        assert!(std::fs::metadata(&file.path).unwrap().len() > 24);
    }

    #[test]
    fn protocol_filter_drops_non_matching_packets() {
        let proto = parse_str(
            r#"
            @protocol { name = "Magic"; endian = big; }
            P { uint32 magic; }
            @filter M { magic = 0xDEADBEEF; }
            "#,
        )
        .unwrap();
        let dir = tempdir("writer_filter");
        let dump = test_dump(&dir, 0);
        let (ctx, _mgr_rx, _reload_rx) = test_ctx(Some(Arc::new(proto)));
        let mut fw = FilterWriter::new(ctx, dump);

        fw.handle_packet(&packet_msg(build_udp_frame(1, 2, &[0xDE, 0xAD, 0xBE, 0xEF])));
        fw.handle_packet(&packet_msg(build_udp_frame(1, 2, &[0x00, 0x00, 0x00, 0x00])));
        let outcome = fw.finish();

        assert_eq!(outcome.stats.processed, 2);
        assert_eq!(outcome.stats.matched, 1);
        assert_eq!(outcome.stats.filtered, 1);
    }

    #[test]
    fn rotation_emits_file_ready_per_closed_file() {
        let dir = tempdir("writer_rotate");
        // Cap small enough that every second packet rotates.
        let dump = test_dump(&dir, 120);
        let (ctx, mgr_rx, _reload_rx) = test_ctx(None);
        let mut fw = FilterWriter::new(ctx, dump);

        for _ in 0..5 {
            fw.handle_packet(&packet_msg(build_udp_frame(1, 2, &[0u8; 30])));
        }
        let outcome = fw.finish();

        let ready: Vec<ManagerMsg> = mgr_rx.try_iter().collect();
        assert!(!ready.is_empty());
        let mut rotated_paths = Vec::new();
        for msg in &ready {
            if let ManagerMsg::CaptureFileReady { capture_id, files, .. } = msg {
                assert_eq!(*capture_id, 1000);
                rotated_paths.extend(files.iter().map(|f| f.path.clone()));
            }
        }
        let final_file = outcome.final_file.unwrap();
        assert!(!rotated_paths.contains(&final_file.path));
        // Every rotated file exists on disk.
        for p in rotated_paths {
            assert!(std::path::Path::new(&p).exists(), "{}", p);
        }
    }

    #[test]
    fn auto_endian_detection_sends_one_writeback() {
        let mut proto = parse_str(
            r#"
            @protocol { name = "AutoProto"; endian = auto; }
            P { uint16 tag; }
            @filter T { tag = 0x1234; }
            "#,
        )
        .unwrap();
        proto.source_path = Some(std::path::PathBuf::from("/tmp/auto.pdef"));
        let dir = tempdir("writer_endian");
        let dump = test_dump(&dir, 0);
        let (ctx, _mgr_rx, reload_rx) = test_ctx(Some(Arc::new(proto)));
        let mut fw = FilterWriter::new(ctx, dump);

        // Little-endian payload: 0x34 0x12.
        fw.handle_packet(&packet_msg(build_udp_frame(1, 2, &[0x34, 0x12])));
        fw.handle_packet(&packet_msg(build_udp_frame(1, 2, &[0x34, 0x12])));

        let msgs: Vec<ReloadMsg> = reload_rx.try_iter().collect();
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ReloadMsg::PdefEndianDetected { source_path, endian } => {
                assert_eq!(source_path.to_string_lossy(), "/tmp/auto.pdef");
                assert_eq!(*endian, DetectedEndian::Little);
            }
        }
        let _ = fw.finish();
    }

    #[test]
    fn inline_pdef_skips_writeback() {
        let proto = parse_str(
            r#"
            @protocol { name = "Inline"; endian = auto; }
            P { uint16 tag; }
            @filter T { tag = 0x1234; }
            "#,
        )
        .unwrap();
        let dir = tempdir("writer_inline");
        let dump = test_dump(&dir, 0);
        let (ctx, _mgr_rx, reload_rx) = test_ctx(Some(Arc::new(proto)));
        let mut fw = FilterWriter::new(ctx, dump);

        fw.handle_packet(&packet_msg(build_udp_frame(1, 2, &[0x34, 0x12])));
        assert!(reload_rx.try_iter().next().is_none());
        let _ = fw.finish();
    }

    fn tempdir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("netcap_test_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
