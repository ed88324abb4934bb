//! Authoritative registry of capture tasks.
//!
//! Two full index tables alternate behind an atomic `current` selector.
//! Structural writes (add/remove) clone the live side into the idle side,
//! mutate it, and flip `current` with release ordering; in-place updates
//! publish a fresh `Arc<CaptureTask>` into the live slot (copy-on-write).
//! Readers load `current` with acquire and copy an `Arc` out, so a snapshot
//! stays valid however many updates land afterwards. Displaced records are
//! queued and dropped only on the manager's idle edge, mirroring the
//! deferred-free discipline of the write path.
//!
//! All mutating methods are called from the manager thread only; queries
//! are safe from any thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::task::{ArchiveInfo, CaptureTask, CapturedFile, TaskStats, TaskStatus};

#[derive(Default, Clone)]
struct TableSide {
    slots: HashMap<u32, Arc<CaptureTask>>,
    key_to_id: HashMap<String, u32>,
    signature_to_id: HashMap<String, u32>,
    sid_to_id: HashMap<String, u32>,
}

impl TableSide {
    fn insert(&mut self, task: Arc<CaptureTask>) {
        let id = task.capture_id;
        if !task.key.is_empty() {
            self.key_to_id.insert(task.key.clone(), id);
        }
        if !task.signature.is_empty() && task.status.is_active() {
            self.signature_to_id.insert(task.signature.clone(), id);
        }
        if !task.sid.is_empty() {
            self.sid_to_id.insert(task.sid.clone(), id);
        }
        self.slots.insert(id, task);
    }

    fn remove(&mut self, capture_id: u32) -> Option<Arc<CaptureTask>> {
        let task = self.slots.remove(&capture_id)?;
        if self.key_to_id.get(&task.key) == Some(&capture_id) {
            self.key_to_id.remove(&task.key);
        }
        if self.signature_to_id.get(&task.signature) == Some(&capture_id) {
            self.signature_to_id.remove(&task.signature);
        }
        if self.sid_to_id.get(&task.sid) == Some(&capture_id) {
            self.sid_to_id.remove(&task.sid);
        }
        Some(task)
    }

    /// Keep the signature index pointing only at active tasks.
    fn reindex_signature(&mut self, task: &CaptureTask) {
        if task.signature.is_empty() {
            return;
        }
        if task.status.is_active() {
            self.signature_to_id.insert(task.signature.clone(), task.capture_id);
        } else if self.signature_to_id.get(&task.signature) == Some(&task.capture_id) {
            self.signature_to_id.remove(&task.signature);
        }
    }
}

pub struct TaskTable {
    sides: [RwLock<TableSide>; 2],
    current: AtomicUsize,
    pending_deletes: Mutex<Vec<Arc<CaptureTask>>>,

    total: AtomicUsize,
    pending: AtomicUsize,
    resolving: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    stopped: AtomicUsize,
}

impl Default for TaskTable {
    fn default() -> Self {
        TaskTable {
            sides: [RwLock::new(TableSide::default()), RwLock::new(TableSide::default())],
            current: AtomicUsize::new(0),
            pending_deletes: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            resolving: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        }
    }
}

impl TaskTable {
    pub fn new() -> TaskTable {
        TaskTable::default()
    }

    fn counter(&self, status: TaskStatus) -> &AtomicUsize {
        match status {
            TaskStatus::Pending => &self.pending,
            TaskStatus::Resolving => &self.resolving,
            TaskStatus::Running => &self.running,
            TaskStatus::Completed => &self.completed,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Stopped => &self.stopped,
        }
    }

    fn count_in(&self, status: TaskStatus) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.counter(status).fetch_add(1, Ordering::Relaxed);
    }

    fn count_out(&self, status: TaskStatus) {
        self.total.fetch_sub(1, Ordering::Relaxed);
        self.counter(status).fetch_sub(1, Ordering::Relaxed);
    }

    fn defer_delete(&self, task: Arc<CaptureTask>) {
        self.pending_deletes.lock().unwrap().push(task);
    }

    // ── Queries (any thread) ────────────────────────────────────────────

    pub fn query(&self, capture_id: u32) -> Option<Arc<CaptureTask>> {
        let idx = self.current.load(Ordering::Acquire);
        let side = self.sides[idx].read().unwrap();
        side.slots.get(&capture_id).cloned()
    }

    pub fn query_by_key(&self, key: &str) -> Option<Arc<CaptureTask>> {
        let idx = self.current.load(Ordering::Acquire);
        let side = self.sides[idx].read().unwrap();
        let id = *side.key_to_id.get(key)?;
        side.slots.get(&id).cloned()
    }

    pub fn query_by_signature(&self, signature: &str) -> Option<Arc<CaptureTask>> {
        let idx = self.current.load(Ordering::Acquire);
        let side = self.sides[idx].read().unwrap();
        let id = *side.signature_to_id.get(signature)?;
        side.slots.get(&id).cloned()
    }

    pub fn query_by_sid(&self, sid: &str) -> Option<Arc<CaptureTask>> {
        let idx = self.current.load(Ordering::Acquire);
        let side = self.sides[idx].read().unwrap();
        let id = *side.sid_to_id.get(sid)?;
        side.slots.get(&id).cloned()
    }

    pub fn query_active_by_signature(&self, signature: &str) -> Option<Arc<CaptureTask>> {
        self.query_by_signature(signature).filter(|t| t.status.is_active())
    }

    pub fn is_key_active(&self, key: &str) -> bool {
        self.query_by_key(key).map(|t| t.status.is_active()).unwrap_or(false)
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            total: self.total.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            resolving: self.resolving.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
        }
    }

    // ── Structural writes (manager thread only) ─────────────────────────

    /// Insert a task; evicts any stale record sharing its id, key,
    /// signature or sid (the manager layer rejects conflicts with *active*
    /// tasks before calling this).
    pub fn add_task(&self, task: CaptureTask) {
        let curr = self.current.load(Ordering::Acquire);
        let idle = 1 - curr;
        let capture_id = task.capture_id;

        {
            let mut side = self.sides[idle].write().unwrap();
            *side = self.sides[curr].read().unwrap().clone();

            let mut evicted: Vec<Arc<CaptureTask>> = Vec::new();
            if let Some(old) = side.remove(capture_id) {
                evicted.push(old);
            }

            let mut stale: Vec<u32> = Vec::new();
            if let Some(&id) = side.key_to_id.get(&task.key) {
                stale.push(id);
            }
            if !task.signature.is_empty() {
                if let Some(&id) = side.signature_to_id.get(&task.signature) {
                    stale.push(id);
                }
            }
            if !task.sid.is_empty() {
                if let Some(&id) = side.sid_to_id.get(&task.sid) {
                    stale.push(id);
                }
            }
            for old_id in stale {
                if old_id != capture_id {
                    if let Some(old) = side.remove(old_id) {
                        evicted.push(old);
                    }
                }
            }

            for old in evicted {
                self.count_out(old.status);
                self.defer_delete(old);
            }

            let status = task.status;
            side.insert(Arc::new(task));
            drop(side);

            self.current.store(idle, Ordering::Release);
            self.count_in(status);
        }
    }

    /// Remove a task record entirely (table eviction after terminal state).
    pub fn remove_task(&self, capture_id: u32) {
        let curr = self.current.load(Ordering::Acquire);
        let idle = 1 - curr;

        let removed = {
            let mut side = self.sides[idle].write().unwrap();
            *side = self.sides[curr].read().unwrap().clone();
            let removed = side.remove(capture_id);
            drop(side);
            self.current.store(idle, Ordering::Release);
            removed
        };

        if let Some(old) = removed {
            self.count_out(old.status);
            self.defer_delete(old);
        }
    }

    /// Copy-on-write update: clone the record, apply the updater, publish.
    /// Returns false when the task is unknown.
    pub fn update_task<F>(&self, capture_id: u32, updater: F) -> bool
    where
        F: FnOnce(&mut CaptureTask),
    {
        let idx = self.current.load(Ordering::Acquire);
        let mut side = self.sides[idx].write().unwrap();

        let old = match side.slots.get(&capture_id) {
            Some(t) => t.clone(),
            None => return false,
        };

        let mut fresh = (*old).clone();
        let old_status = fresh.status;
        updater(&mut fresh);
        let new_status = fresh.status;

        side.reindex_signature(&fresh);
        if !fresh.sid.is_empty() {
            side.sid_to_id.insert(fresh.sid.clone(), capture_id);
        }
        side.slots.insert(capture_id, Arc::new(fresh));
        drop(side);

        if old_status != new_status {
            self.count_out(old_status);
            self.count_in(new_status);
        }
        self.defer_delete(old);
        true
    }

    pub fn update_status(&self, capture_id: u32, status: TaskStatus) -> bool {
        self.update_task(capture_id, |t| t.status = status)
    }

    // ── Transition helpers ──────────────────────────────────────────────

    pub fn set_capture_started(
        &self,
        capture_id: u32,
        start_ts_us: i64,
        capture_pid: i32,
        output_file: &str,
    ) -> bool {
        self.update_task(capture_id, |t| {
            t.start_time = if start_ts_us > 0 { start_ts_us / 1_000_000 } else { 0 };
            t.capture_pid = capture_pid;
            if !output_file.is_empty() {
                t.output_file = output_file.to_string();
            }
            t.status = TaskStatus::Running;
        })
    }

    pub fn update_progress(
        &self,
        capture_id: u32,
        packets: u64,
        bytes: u64,
        last_ts_us: i64,
    ) -> bool {
        self.update_task(capture_id, |t| {
            if packets > 0 {
                t.packet_count = packets;
            }
            if bytes > 0 {
                t.bytes_captured = bytes;
            }
            if last_ts_us > 0 {
                t.end_time = last_ts_us / 1_000_000;
            }
        })
    }

    pub fn set_capture_finished(
        &self,
        capture_id: u32,
        finish_ts_us: i64,
        packets: u64,
        bytes: u64,
        final_path: &str,
    ) -> bool {
        self.update_task(capture_id, |t| {
            t.end_time = if finish_ts_us > 0 { finish_ts_us / 1_000_000 } else { 0 };
            t.packet_count = packets;
            t.bytes_captured = bytes;
            if !final_path.is_empty() {
                t.output_file = final_path.to_string();
            }
            t.status = TaskStatus::Completed;
        })
    }

    pub fn set_capture_stopped(
        &self,
        capture_id: u32,
        finish_ts_us: i64,
        packets: u64,
        bytes: u64,
        message: &str,
    ) -> bool {
        self.update_task(capture_id, |t| {
            t.end_time = if finish_ts_us > 0 {
                finish_ts_us / 1_000_000
            } else {
                chrono::Local::now().timestamp()
            };
            t.packet_count = packets;
            t.bytes_captured = bytes;
            t.error_message = message.to_string();
            t.stop_requested = false;
            t.status = TaskStatus::Stopped;
        })
    }

    pub fn set_capture_failed(&self, capture_id: u32, message: &str) -> bool {
        self.update_task(capture_id, |t| {
            t.error_message = message.to_string();
            t.end_time = chrono::Local::now().timestamp();
            t.status = TaskStatus::Failed;
        })
    }

    /// Append files, updating in place when a path is already present.
    /// Paths are never reordered or removed.
    pub fn append_files(&self, capture_id: u32, files: &[CapturedFile]) -> bool {
        if files.is_empty() {
            return false;
        }
        self.update_task(capture_id, |t| {
            for f in files {
                match t.captured_files.iter_mut().find(|e| e.path == f.path) {
                    Some(existing) => *existing = f.clone(),
                    None => t.captured_files.push(f.clone()),
                }
            }
        })
    }

    /// Record (or merge) an archive and fold its compressed entries back
    /// into `captured_files`.
    pub fn record_archive(&self, capture_id: u32, archive: &ArchiveInfo) -> bool {
        self.update_task(capture_id, |t| {
            match t
                .archives
                .iter_mut()
                .find(|a| !archive.path.is_empty() && a.path == archive.path)
            {
                Some(existing) => *existing = archive.clone(),
                None => t.archives.push(archive.clone()),
            }
            for comp in &archive.files {
                match t.captured_files.iter_mut().find(|e| e.path == comp.path) {
                    Some(existing) => *existing = comp.clone(),
                    None => t.captured_files.push(comp.clone()),
                }
            }
        })
    }

    /// Drop the deferred-delete queue. Called only on the manager's idle
    /// edge; queries hold their own `Arc` clones, so this never invalidates
    /// a snapshot.
    pub fn cleanup_pending_deletes(&self) {
        self.pending_deletes.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u32, key: &str, signature: &str, status: TaskStatus) -> CaptureTask {
        CaptureTask {
            capture_id: id,
            key: key.into(),
            signature: signature.into(),
            sid: format!("{}20250101120000000", signature),
            status,
            ..CaptureTask::default()
        }
    }

    #[test]
    fn add_and_query_by_all_indexes() {
        let table = TaskTable::new();
        table.add_task(task(1000, "iface:lo:udp", "aabbccdd00112233", TaskStatus::Pending));

        assert_eq!(table.query(1000).unwrap().capture_id, 1000);
        assert_eq!(table.query_by_key("iface:lo:udp").unwrap().capture_id, 1000);
        assert_eq!(table.query_by_signature("aabbccdd00112233").unwrap().capture_id, 1000);
        assert_eq!(
            table.query_by_sid("aabbccdd0011223320250101120000000").unwrap().capture_id,
            1000
        );
        assert!(table.query(9999).is_none());
    }

    #[test]
    fn signature_index_tracks_only_active_tasks() {
        let table = TaskTable::new();
        table.add_task(task(1000, "k1", "sig1", TaskStatus::Running));
        assert!(table.query_active_by_signature("sig1").is_some());

        table.update_status(1000, TaskStatus::Completed);
        assert!(table.query_active_by_signature("sig1").is_none());

        // A new task may reuse the signature once the old one is terminal.
        table.add_task(task(1001, "k2", "sig1", TaskStatus::Pending));
        assert_eq!(table.query_active_by_signature("sig1").unwrap().capture_id, 1001);
    }

    #[test]
    fn counters_sum_to_table_size() {
        let table = TaskTable::new();
        table.add_task(task(1000, "a", "s1", TaskStatus::Pending));
        table.add_task(task(1001, "b", "s2", TaskStatus::Pending));
        table.add_task(task(1002, "c", "s3", TaskStatus::Pending));
        table.update_status(1000, TaskStatus::Resolving);
        table.update_status(1000, TaskStatus::Running);
        table.update_status(1001, TaskStatus::Failed);

        let s = table.stats();
        assert_eq!(s.total, 3);
        assert_eq!(
            s.pending + s.resolving + s.running + s.completed + s.failed + s.stopped,
            s.total
        );
        assert_eq!(s.running, 1);
        assert_eq!(s.pending, 1);
        assert_eq!(s.failed, 1);

        table.remove_task(1001);
        let s = table.stats();
        assert_eq!(s.total, 2);
        assert_eq!(s.failed, 0);
    }

    #[test]
    fn snapshots_are_immutable() {
        let table = TaskTable::new();
        table.add_task(task(1000, "a", "s1", TaskStatus::Running));

        let before = table.query(1000).unwrap();
        let before_again = table.query(1000).unwrap();
        assert!(Arc::ptr_eq(&before, &before_again));

        table.update_progress(1000, 42, 4096, 5_000_000);

        // The earlier snapshot is untouched; a fresh query sees the update.
        assert_eq!(before.packet_count, 0);
        let after = table.query(1000).unwrap();
        assert_eq!(after.packet_count, 42);
        assert_eq!(after.bytes_captured, 4096);
        assert_eq!(after.end_time, 5);
    }

    #[test]
    fn append_files_updates_in_place_without_reordering() {
        let table = TaskTable::new();
        table.add_task(task(1000, "a", "s1", TaskStatus::Running));

        let f1 = CapturedFile::new("/tmp/cap-0001.pcap".into(), 100, 1, 10);
        let f2 = CapturedFile::new("/tmp/cap-0002.pcap".into(), 200, 2, 20);
        table.append_files(1000, &[f1.clone(), f2.clone()]);

        let mut f1_compressed = f1.clone();
        f1_compressed.compressed = true;
        f1_compressed.archive_path = "/tmp/a.tar.gz".into();
        table.append_files(1000, &[f1_compressed]);

        let t = table.query(1000).unwrap();
        assert_eq!(t.captured_files.len(), 2);
        assert_eq!(t.captured_files[0].path, "/tmp/cap-0001.pcap");
        assert!(t.captured_files[0].compressed);
        assert_eq!(t.captured_files[1].path, "/tmp/cap-0002.pcap");
        assert!(!t.captured_files[1].compressed);
    }

    #[test]
    fn record_archive_merges_compressed_entries() {
        let table = TaskTable::new();
        table.add_task(task(1000, "a", "s1", TaskStatus::Completed));

        let f1 = CapturedFile::new("/tmp/cap-0001.pcap".into(), 100, 1, 10);
        table.append_files(1000, &[f1.clone()]);

        let mut compressed = f1.clone();
        compressed.compressed = true;
        compressed.archive_path = "/tmp/batch_x_1000.tar.gz".into();
        let archive = ArchiveInfo {
            path: "/tmp/batch_x_1000.tar.gz".into(),
            size: 50,
            compress_finish_ts: 99,
            files: vec![compressed],
        };
        table.record_archive(1000, &archive);

        let t = table.query(1000).unwrap();
        assert_eq!(t.archives.len(), 1);
        assert_eq!(t.archives[0].files.len(), 1);
        assert!(t.captured_files[0].compressed);

        // Re-recording the same archive path merges instead of duplicating.
        table.record_archive(1000, &archive);
        assert_eq!(table.query(1000).unwrap().archives.len(), 1);
    }

    #[test]
    fn pending_deletes_accumulate_and_drain() {
        let table = TaskTable::new();
        table.add_task(task(1000, "a", "s1", TaskStatus::Pending));
        table.update_status(1000, TaskStatus::Resolving);
        table.update_status(1000, TaskStatus::Running);
        assert!(table.pending_delete_count() >= 2);

        table.cleanup_pending_deletes();
        assert_eq!(table.pending_delete_count(), 0);
        // The live record survives the drain.
        assert_eq!(table.query(1000).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn stop_and_fail_record_messages() {
        let table = TaskTable::new();
        table.add_task(task(1000, "a", "s1", TaskStatus::Running));
        table.set_capture_stopped(1000, 7_000_000, 5, 500, "stopped");
        let t = table.query(1000).unwrap();
        assert_eq!(t.status, TaskStatus::Stopped);
        assert_eq!(t.end_time, 7);
        assert_eq!(t.error_message, "stopped");

        table.add_task(task(1001, "b", "s2", TaskStatus::Running));
        table.set_capture_failed(1001, "pcap_open_failed");
        let t = table.query(1001).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error_message, "pcap_open_failed");
    }
}
