//! Cleanup actor: metadata records, batched compression and pruning.
//!
//! Files arrive via `FileEnqueue`, get a JSON-lines metadata record and sit
//! in the pending queue until the periodic tick decides the batch is big
//! enough to compress. Each tick also sweeps expired PDEF scratch files and
//! enforces archive retention. A failed archive leaves its group queued for
//! the next cycle.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::Address;
use crate::config::CaptureConfigSnapshot;
use crate::error::CaptureErrorCode;
use crate::messages::{CleanupMsg, ManagerMsg};
use crate::storage::ensure_dir;
use crate::task::{ArchiveInfo, CapturedFile};

/// Metadata log rotates past this size; at most this many rotated logs are
/// kept.
const RECORD_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const RECORD_MAX_FILES: usize = 8;

fn now_secs() -> i64 {
    chrono::Local::now().timestamp()
}

fn timestamp_suffix() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone)]
struct PendingFile {
    capture_id: u32,
    file: CapturedFile,
}

/// One metadata record line. Duplicate enqueues may repeat records; the log
/// is append-only diagnostics, not a database.
pub fn metadata_record(ts: i64, capture_id: u32, key: &str, file: &CapturedFile) -> String {
    let mut line = serde_json::to_string(&json!({
        "ts": ts,
        "capture_id": capture_id,
        "key": key,
        "file": file.path,
        "size": file.size,
        "segment": file.segment_index,
        "segments": file.total_segments,
    }))
    .unwrap_or_default();
    line.push('\n');
    line
}

/// A metadata-log file: basename `cleanup*.log`, excluded from archives.
pub fn is_record_file(path: &str) -> bool {
    let basename = Path::new(path).file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    basename.starts_with("cleanup") && basename.contains(".log")
}

pub struct CleanupActor {
    manager: Address<ManagerMsg>,
    config: Arc<CaptureConfigSnapshot>,
    pending: Vec<PendingFile>,
    record_path: Option<PathBuf>,
    record_size: u64,
}

impl CleanupActor {
    pub fn new(manager: Address<ManagerMsg>, config: Arc<CaptureConfigSnapshot>) -> CleanupActor {
        CleanupActor { manager, config, pending: Vec::new(), record_path: None, record_size: 0 }
    }

    pub fn run(mut self, rx: Receiver<CleanupMsg>) {
        if let Err(e) = ensure_dir(&self.config.output_dir) {
            warn!("cleanup: record directory unavailable: {}", e);
        }
        if let Err(e) = ensure_dir(&self.config.archive_dir) {
            warn!("cleanup: archive directory unavailable: {}", e);
        }
        if !self.config.temp_pdef_dir.is_empty() {
            if let Err(e) = ensure_dir(&self.config.temp_pdef_dir) {
                warn!("cleanup: pdef scratch directory unavailable: {}", e);
            }
        }

        let ticker = tick(Duration::from_secs(self.config.compress_interval_sec.max(1)));
        info!(interval = self.config.compress_interval_sec, "cleanup actor started");

        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(CleanupMsg::FileEnqueue { capture_id, key, files, policy, .. }) => {
                        self.config = policy;
                        self.enqueue(capture_id, key, files);
                    }
                    Ok(CleanupMsg::ConfigRefresh(snapshot)) => {
                        debug!(hash = snapshot.config_hash, "cleanup config refreshed");
                        self.config = snapshot;
                    }
                    Ok(CleanupMsg::Shutdown) | Err(_) => break,
                },
                recv(ticker) -> _ => self.tick(),
            }
        }
        debug!("cleanup actor stopped");
    }

    fn tick(&mut self) {
        self.sweep_pdef_scratch();
        self.process_pending();
        self.prune_archives();
        self.prune_capture_files();
    }

    // ── Enqueue & metadata records ──────────────────────────────────────

    fn enqueue(&mut self, capture_id: u32, key: String, files: Vec<CapturedFile>) {
        if files.is_empty() {
            return;
        }
        let mut recorded = Vec::with_capacity(files.len());
        for mut file in files {
            if let Some(record_path) = self.write_metadata_record(capture_id, &key, &file) {
                file.record_path = record_path;
            }
            recorded.push(file.clone());
            self.pending.push(PendingFile { capture_id, file });
        }

        // Reflect the record path on the task without waiting for archival.
        let _ = self.manager.send(ManagerMsg::FileRecorded { capture_id, files: recorded });

        info!(capture_id, pending = self.pending.len(), "cleanup queued capture file(s)");
    }

    fn current_record_file(&self) -> PathBuf {
        Path::new(&self.config.output_dir).join("cleanup.log")
    }

    fn write_metadata_record(
        &mut self,
        capture_id: u32,
        key: &str,
        file: &CapturedFile,
    ) -> Option<String> {
        let line = metadata_record(now_secs(), capture_id, key, file);

        if ensure_dir(&self.config.output_dir).is_err() {
            warn!("cleanup: record directory {} unavailable", self.config.output_dir);
            return None;
        }

        if self.record_path.is_none() {
            let path = self.current_record_file();
            self.record_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            self.record_path = Some(path);
        }

        self.rotate_record_if_needed(line.len() as u64);

        let path = self.record_path.clone()?;
        let mut fp = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("cleanup: failed to open record file {}: {}", path.display(), e);
                return None;
            }
        };
        if let Err(e) = fp.write_all(line.as_bytes()) {
            warn!("cleanup: failed to append record to {}: {}", path.display(), e);
            return None;
        }
        self.record_size += line.len() as u64;
        Some(path.to_string_lossy().into_owned())
    }

    fn rotate_record_if_needed(&mut self, incoming: u64) {
        if self.record_size + incoming <= RECORD_MAX_SIZE_BYTES {
            return;
        }
        let current = match &self.record_path {
            Some(p) => p.clone(),
            None => return,
        };
        let rotated = Path::new(&self.config.output_dir)
            .join(format!("cleanup_{}.log", timestamp_suffix()));
        match fs::rename(&current, &rotated) {
            Ok(()) => {
                info!("cleanup: rotated record file to {}", rotated.display());
                self.record_size = 0;
                self.prune_record_files();
            }
            Err(e) => {
                warn!("cleanup: record rotation failed: {}", e);
                self.record_size = 0;
            }
        }
    }

    fn prune_record_files(&self) {
        let entries = match fs::read_dir(&self.config.output_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut records: Vec<(PathBuf, std::time::SystemTime)> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if !name.starts_with("cleanup") {
                    return None;
                }
                let meta = e.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((e.path(), meta.modified().ok()?))
            })
            .collect();

        if records.len() <= RECORD_MAX_FILES {
            return;
        }
        records.sort_by_key(|(_, mtime)| *mtime);
        let excess = records.len() - RECORD_MAX_FILES;
        for (path, _) in records.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => info!("cleanup: pruned old record file {}", path.display()),
                Err(e) => warn!("cleanup: failed to prune {}: {}", path.display(), e),
            }
        }
    }

    // ── Batch compression ───────────────────────────────────────────────

    fn process_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let total_count = self.pending.len();
        let total_size: u64 = self
            .pending
            .iter()
            .map(|p| fs::metadata(&p.file.path).map(|m| m.len()).unwrap_or(0))
            .sum();

        let size_threshold = self.config.batch_compress_size_mb * 1024 * 1024;
        let should_compress = total_count >= self.config.batch_compress_file_count
            || (size_threshold > 0 && total_size >= size_threshold);
        if !should_compress {
            debug!(
                count = total_count,
                count_threshold = self.config.batch_compress_file_count,
                size = total_size,
                "batch compression deferred"
            );
            return;
        }

        info!(count = total_count, size = total_size, "starting batch compression");

        let mut groups: BTreeMap<u32, Vec<PendingFile>> = BTreeMap::new();
        for pending in self.pending.drain(..) {
            groups.entry(pending.capture_id).or_default().push(pending);
        }

        for (capture_id, group) in groups {
            match self.compress_batch(capture_id, &group) {
                Ok(archive) => {
                    let _ = self.manager.send(ManagerMsg::CleanCompressDone { capture_id, archive });
                }
                Err(error_message) => {
                    warn!(capture_id, %error_message, "batch compression failed");
                    let files: Vec<CapturedFile> = group.iter().map(|p| p.file.clone()).collect();
                    let _ = self.manager.send(ManagerMsg::CleanCompressFailed {
                        capture_id,
                        files,
                        error_code: CaptureErrorCode::CleanCompressFailed,
                        error_message,
                    });
                    // Sources stay queued for the next cycle.
                    self.pending.extend(group);
                }
            }
        }
    }

    fn compress_batch(
        &self,
        capture_id: u32,
        group: &[PendingFile],
    ) -> Result<ArchiveInfo, String> {
        if group.is_empty() {
            return Err("no_files_to_compress".into());
        }
        if ensure_dir(&self.config.archive_dir).is_err() {
            return Err("archive_dir_unavailable".into());
        }

        let archive_path = Path::new(&self.config.archive_dir)
            .join(format!("batch_{}_{}.tar.gz", timestamp_suffix(), capture_id));

        let include: Vec<&PendingFile> =
            group.iter().filter(|p| !is_record_file(&p.file.path)).collect();
        if include.is_empty() {
            return Err("no_files_after_filter".into());
        }

        let out = File::create(&archive_path).map_err(|e| format!("archive_create: {}", e))?;
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for pending in &include {
            let path = Path::new(&pending.file.path);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| pending.file.path.clone());
            builder
                .append_path_with_name(path, &name)
                .map_err(|e| format!("archive_append {}: {}", pending.file.path, e))?;
        }

        let encoder = builder.into_inner().map_err(|e| format!("archive_finish: {}", e))?;
        encoder.finish().map_err(|e| format!("archive_flush: {}", e))?;

        let archive_size = fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
        let finish_ts = now_secs();

        if self.config.archive_remove_source {
            for pending in &include {
                if let Err(e) = fs::remove_file(&pending.file.path) {
                    warn!("cleanup: failed to remove source {}: {}", pending.file.path, e);
                }
            }
        }

        let archive_path_str = archive_path.to_string_lossy().into_owned();
        let files: Vec<CapturedFile> = group
            .iter()
            .map(|p| {
                let mut f = p.file.clone();
                f.compressed = true;
                f.archive_path = archive_path_str.clone();
                f.compress_finish_ts = finish_ts;
                f
            })
            .collect();

        info!(capture_id, files = include.len(), archive = %archive_path_str, size = archive_size,
              "batch compression complete");

        Ok(ArchiveInfo {
            path: archive_path_str,
            size: archive_size,
            compress_finish_ts: finish_ts,
            files,
        })
    }

    // ── Pruning ─────────────────────────────────────────────────────────

    fn sweep_pdef_scratch(&self) {
        let dir = &self.config.temp_pdef_dir;
        let ttl_secs = i64::from(self.config.temp_pdef_ttl_hours) * 3600;
        if dir.is_empty() || ttl_secs <= 0 {
            return;
        }
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        let now = std::time::SystemTime::now();
        let mut removed = 0usize;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if age >= ttl_secs {
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        info!("cleanup: removed expired PDEF scratch {}", entry.path().display());
                    }
                    Err(e) => {
                        warn!("cleanup: failed to remove {}: {}", entry.path().display(), e)
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "cleanup: expired PDEF scratch files removed");
        }
    }

    fn prune_archives(&self) {
        let dir = &self.config.archive_dir;
        if dir.is_empty() {
            return;
        }
        let retention_secs = i64::from(self.config.archive_keep_days) * 86400;
        let max_total = self.config.archive_max_total_size_mb * 1024 * 1024;
        if retention_secs <= 0 && max_total == 0 {
            return;
        }

        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        let now = std::time::SystemTime::now();
        let mut survivors: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();
        let mut total_size: u64 = 0;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("batch_") && !name.starts_with("capture_") {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let mtime = meta.modified().unwrap_or(now);

            if retention_secs > 0 {
                let age = now.duration_since(mtime).map(|d| d.as_secs() as i64).unwrap_or(0);
                if age > retention_secs {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => {
                            info!(age, "cleanup: pruned expired archive {}", entry.path().display())
                        }
                        Err(e) => {
                            warn!("cleanup: failed to prune {}: {}", entry.path().display(), e)
                        }
                    }
                    continue;
                }
            }

            if max_total > 0 {
                total_size += meta.len();
                survivors.push((entry.path(), mtime, meta.len()));
            }
        }

        if max_total == 0 || total_size <= max_total {
            return;
        }

        survivors.sort_by_key(|(_, mtime, _)| *mtime);
        for (path, _, size) in survivors {
            if total_size <= max_total {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    total_size = total_size.saturating_sub(size);
                    info!(remaining = total_size, "cleanup: pruned archive {} for size cap",
                          path.display());
                }
                Err(e) => warn!("cleanup: failed to prune {}: {}", path.display(), e),
            }
        }
    }
}

/// Recursively collect regular capture files under `dir` (metadata logs
/// excluded), depth-limited so a mis-pointed base dir cannot walk the world.
fn collect_capture_files(
    dir: &Path,
    depth: usize,
    out: &mut Vec<(PathBuf, std::time::SystemTime, u64)>,
) {
    if depth > 4 {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            collect_capture_files(&entry.path(), depth + 1, out);
            continue;
        }
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_record_file(&name) {
            continue;
        }
        if !(name.ends_with(".pcap") || name.ends_with(".pcap.gz")) {
            continue;
        }
        let mtime = meta.modified().unwrap_or_else(|_| std::time::SystemTime::now());
        out.push((entry.path(), mtime, meta.len()));
    }
}

/// Oldest-first victims needed to bring `files` under `max_total_bytes`.
fn size_cap_victims(
    mut files: Vec<(PathBuf, std::time::SystemTime, u64)>,
    max_total_bytes: u64,
) -> Vec<PathBuf> {
    let mut total: u64 = files.iter().map(|(_, _, size)| size).sum();
    if total <= max_total_bytes {
        return Vec::new();
    }
    files.sort_by_key(|(_, mtime, _)| *mtime);
    let mut victims = Vec::new();
    for (path, _, size) in files {
        if total <= max_total_bytes {
            break;
        }
        total = total.saturating_sub(size);
        victims.push(path);
    }
    victims
}

impl CleanupActor {
    /// Retention sweep over the capture base directory: age first, then the
    /// total-size cap, oldest files first.
    fn prune_capture_files(&self) {
        let dir = &self.config.output_dir;
        let max_age_secs = i64::from(self.config.storage_max_age_days) * 86400;
        let max_total = self.config.storage_max_size_gb * 1024 * 1024 * 1024;
        if dir.is_empty() || (max_age_secs <= 0 && max_total == 0) {
            return;
        }

        let mut files = Vec::new();
        collect_capture_files(Path::new(dir), 0, &mut files);
        if files.is_empty() {
            return;
        }

        if max_age_secs > 0 {
            let now = std::time::SystemTime::now();
            files.retain(|(path, mtime, _)| {
                let age =
                    now.duration_since(*mtime).map(|d| d.as_secs() as i64).unwrap_or(0);
                if age > max_age_secs {
                    match fs::remove_file(path) {
                        Ok(()) => info!(age, "cleanup: pruned expired capture {}", path.display()),
                        Err(e) => warn!("cleanup: failed to prune {}: {}", path.display(), e),
                    }
                    false
                } else {
                    true
                }
            });
        }

        if max_total > 0 {
            for path in size_cap_victims(files, max_total) {
                match fs::remove_file(&path) {
                    Ok(()) => info!("cleanup: pruned capture {} for storage cap", path.display()),
                    Err(e) => warn!("cleanup: failed to prune {}: {}", path.display(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mailbox;
    use crate::config::ServerConfig;

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netcap_clean_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn snapshot_for(dir: &Path, batch_count: usize) -> Arc<CaptureConfigSnapshot> {
        let mut server = ServerConfig::default();
        server.storage.base_dir = dir.join("captures").to_string_lossy().into_owned();
        server.cleanup.archive_dir = dir.join("archives").to_string_lossy().into_owned();
        server.cleanup.batch_compress_file_count = batch_count;
        server.cleanup.batch_compress_size_mb = 0;
        Arc::new(CaptureConfigSnapshot::build(&server, 0))
    }

    fn make_capture_file(dir: &Path, name: &str, content: &[u8]) -> CapturedFile {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        CapturedFile::new(path.to_string_lossy().into_owned(), content.len() as u64, 1, 1)
    }

    #[test]
    fn metadata_record_shape() {
        let file = CapturedFile::new("/tmp/a.pcap".into(), 123, 2, 0);
        let line = metadata_record(42, 1000, "iface:lo:udp", &file);
        assert!(line.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["ts"], 42);
        assert_eq!(parsed["capture_id"], 1000);
        assert_eq!(parsed["key"], "iface:lo:udp");
        assert_eq!(parsed["file"], "/tmp/a.pcap");
        assert_eq!(parsed["size"], 123);
        assert_eq!(parsed["segment"], 2);
        assert_eq!(parsed["segments"], 1);
    }

    #[test]
    fn record_file_detection() {
        assert!(is_record_file("/var/captures/cleanup.log"));
        assert!(is_record_file("/var/captures/cleanup_20250101_000000.log"));
        assert!(!is_record_file("/var/captures/session.pcap"));
        assert!(!is_record_file("/var/cleanup/notes.txt"));
    }

    #[test]
    fn enqueue_records_metadata_and_notifies_manager() {
        let dir = tempdir("enqueue");
        let (manager, mgr_rx) = mailbox::<ManagerMsg>("manager", 16);
        let snapshot = snapshot_for(&dir, 100);
        let mut actor = CleanupActor::new(manager, snapshot.clone());

        let file = make_capture_file(&dir, "a.pcap", b"data");
        actor.enqueue(1000, "k".into(), vec![file]);

        assert_eq!(actor.pending.len(), 1);
        assert!(!actor.pending[0].file.record_path.is_empty());

        // The record line landed in cleanup.log under the capture base dir.
        let log = Path::new(&snapshot.output_dir).join("cleanup.log");
        let content = fs::read_to_string(&log).unwrap();
        assert!(content.contains("\"capture_id\":1000"));

        match mgr_rx.try_recv().unwrap() {
            ManagerMsg::FileRecorded { capture_id, files } => {
                assert_eq!(capture_id, 1000);
                assert!(files[0].record_path.ends_with("cleanup.log"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn batch_compression_waits_for_threshold() {
        let dir = tempdir("threshold");
        let (manager, mgr_rx) = mailbox::<ManagerMsg>("manager", 16);
        let mut actor = CleanupActor::new(manager, snapshot_for(&dir, 3));

        for i in 0..2 {
            let f = make_capture_file(&dir, &format!("f{}.pcap", i), b"xx");
            actor.enqueue(1000, "k".into(), vec![f]);
        }
        // Drain the FileRecorded notifications.
        while mgr_rx.try_recv().is_ok() {}

        actor.process_pending();
        assert_eq!(actor.pending.len(), 2);
        assert!(mgr_rx.try_recv().is_err());
    }

    #[test]
    fn batch_compression_produces_archive_and_notifies() {
        let dir = tempdir("compress");
        let (manager, mgr_rx) = mailbox::<ManagerMsg>("manager", 16);
        let mut actor = CleanupActor::new(manager, snapshot_for(&dir, 3));

        for i in 0..3 {
            let f = make_capture_file(&dir, &format!("f{}.pcap", i), &[i as u8; 64]);
            actor.enqueue(1000, "k".into(), vec![f]);
        }
        while mgr_rx.try_recv().is_ok() {}

        actor.process_pending();
        assert!(actor.pending.is_empty());

        match mgr_rx.try_recv().unwrap() {
            ManagerMsg::CleanCompressDone { capture_id, archive } => {
                assert_eq!(capture_id, 1000);
                assert!(archive.path.contains("batch_"));
                assert!(archive.path.ends_with("_1000.tar.gz"));
                assert!(Path::new(&archive.path).exists());
                assert!(archive.size > 0);
                assert_eq!(archive.files.len(), 3);
                assert!(archive.files.iter().all(|f| f.compressed));
                assert!(archive.files.iter().all(|f| f.archive_path == archive.path));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn groups_are_archived_per_capture_id() {
        let dir = tempdir("groups");
        let (manager, mgr_rx) = mailbox::<ManagerMsg>("manager", 16);
        let mut actor = CleanupActor::new(manager, snapshot_for(&dir, 2));

        let f1 = make_capture_file(&dir, "a.pcap", b"a");
        let f2 = make_capture_file(&dir, "b.pcap", b"b");
        actor.enqueue(1000, "k1".into(), vec![f1]);
        actor.enqueue(1001, "k2".into(), vec![f2]);
        while mgr_rx.try_recv().is_ok() {}

        actor.process_pending();

        let mut ids = Vec::new();
        while let Ok(msg) = mgr_rx.try_recv() {
            if let ManagerMsg::CleanCompressDone { capture_id, archive } = msg {
                assert!(archive.path.ends_with(&format!("_{}.tar.gz", capture_id)));
                ids.push(capture_id);
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1000, 1001]);
    }

    #[test]
    fn failed_group_stays_pending() {
        let dir = tempdir("fail");
        let (manager, mgr_rx) = mailbox::<ManagerMsg>("manager", 16);
        let mut actor = CleanupActor::new(manager, snapshot_for(&dir, 1));

        // Enqueue a file that does not exist on disk: append fails.
        let ghost = CapturedFile::new(
            dir.join("missing.pcap").to_string_lossy().into_owned(),
            10,
            1,
            1,
        );
        actor.enqueue(1000, "k".into(), vec![ghost]);
        while mgr_rx.try_recv().is_ok() {}

        actor.process_pending();
        assert_eq!(actor.pending.len(), 1, "failed group must stay queued");

        match mgr_rx.try_recv().unwrap() {
            ManagerMsg::CleanCompressFailed { capture_id, files, error_code, .. } => {
                assert_eq!(capture_id, 1000);
                assert_eq!(files.len(), 1);
                assert_eq!(error_code, CaptureErrorCode::CleanCompressFailed);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn record_files_are_excluded_from_archives() {
        let dir = tempdir("exclude");
        let (manager, mgr_rx) = mailbox::<ManagerMsg>("manager", 16);
        let mut actor = CleanupActor::new(manager, snapshot_for(&dir, 1));

        let record = make_capture_file(&dir, "cleanup_20250101_000000.log", b"meta");
        actor.enqueue(1000, "k".into(), vec![record]);
        while mgr_rx.try_recv().is_ok() {}

        actor.process_pending();
        // Only a record file in the group: nothing to archive, group fails
        // and stays queued.
        assert!(matches!(
            mgr_rx.try_recv().unwrap(),
            ManagerMsg::CleanCompressFailed { .. }
        ));
    }

    #[test]
    fn capture_file_collection_filters_and_recurses() {
        let dir = tempdir("collect");
        fs::create_dir_all(dir.join("20250101")).unwrap();
        fs::write(dir.join("20250101/a.pcap"), b"aa").unwrap();
        fs::write(dir.join("b.pcap.gz"), b"bb").unwrap();
        fs::write(dir.join("cleanup.log"), b"meta").unwrap();
        fs::write(dir.join("notes.txt"), b"text").unwrap();

        let mut files = Vec::new();
        collect_capture_files(&dir, 0, &mut files);
        let mut names: Vec<String> = files
            .iter()
            .map(|(p, _, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.pcap", "b.pcap.gz"]);
    }

    #[test]
    fn size_cap_picks_oldest_victims_first() {
        let t0 = std::time::UNIX_EPOCH;
        let later = |secs| t0 + std::time::Duration::from_secs(secs);
        let files = vec![
            (PathBuf::from("/c/new.pcap"), later(300), 100u64),
            (PathBuf::from("/c/old.pcap"), later(100), 100u64),
            (PathBuf::from("/c/mid.pcap"), later(200), 100u64),
        ];

        // Already under cap: nothing removed.
        assert!(size_cap_victims(files.clone(), 300).is_empty());

        // Over cap by one file: the oldest goes.
        let victims = size_cap_victims(files.clone(), 250);
        assert_eq!(victims, vec![PathBuf::from("/c/old.pcap")]);

        // Over cap by two: oldest two, in age order.
        let victims = size_cap_victims(files, 150);
        assert_eq!(
            victims,
            vec![PathBuf::from("/c/old.pcap"), PathBuf::from("/c/mid.pcap")]
        );
    }

    #[test]
    fn pdef_scratch_sweep_honors_ttl() {
        let dir = tempdir("pdef_ttl");
        let mut server = ServerConfig::default();
        server.storage.base_dir = dir.join("captures").to_string_lossy().into_owned();
        server.cleanup.archive_dir = dir.join("archives").to_string_lossy().into_owned();
        server.storage.temp_pdef_dir = dir.join("pdef").to_string_lossy().into_owned();
        server.storage.temp_pdef_ttl_hours = 0; // TTL disabled: nothing removed
        let (manager, _mgr_rx) = mailbox::<ManagerMsg>("manager", 4);
        let actor = CleanupActor::new(manager, Arc::new(CaptureConfigSnapshot::build(&server, 0)));

        fs::create_dir_all(dir.join("pdef")).unwrap();
        fs::write(dir.join("pdef/x.pdef"), b"P { uint8 a; }").unwrap();
        actor.sweep_pdef_scratch();
        assert!(dir.join("pdef/x.pdef").exists());
    }
}
