//! Reload actor: config-file watching and PDEF endian writeback.
//!
//! The strategy file's modification time is polled once a second; a change
//! republishes an immutable snapshot to the manager, sampler and cleanup.
//! Endian writebacks are best-effort: a contended lock or any parse oddity
//! leaves the PDEF source untouched.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{select, tick, Receiver};
use netcap_pdef::DetectedEndian;
use tracing::{debug, info, warn};

use crate::bus::Address;
use crate::config::{CaptureConfigSnapshot, ServerConfig, StrategyConfig};
use crate::messages::{CleanupMsg, ManagerMsg, ReloadMsg, SamplerMsg};

/// Insert `endian <e>;` right after the opening brace of the protocol
/// header. None when the file already carries an endian clause or does not
/// look like a PDEF.
pub fn insert_endian_clause(content: &str, endian: &str, timestamp: &str) -> Option<String> {
    if content.contains("endian ") {
        return None;
    }

    // Both `@protocol {` and bare `protocol {` headers are accepted.
    let header_pos = content.find("@protocol").or_else(|| content.find("protocol"))?;
    let brace_pos = content[header_pos..].find('{')? + header_pos;

    let clause = format!("\n    endian {};  # auto-detected on {}\n", endian, timestamp);
    let mut out = String::with_capacity(content.len() + clause.len());
    out.push_str(&content[..brace_pos + 1]);
    out.push_str(&clause);
    out.push_str(&content[brace_pos + 1..]);
    Some(out)
}

/// Rewrite the PDEF source with the detected endian under a non-blocking
/// advisory lock. Every error path logs and leaves the file alone.
pub fn writeback_pdef_endian(path: &Path, endian: DetectedEndian) {
    let endian_str = match endian {
        DetectedEndian::Big => "big",
        DetectedEndian::Little => "little",
        DetectedEndian::Unknown => return,
    };

    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(pdef = %path.display(), "endian writeback open failed: {}", e);
            return;
        }
    };

    let fd = file.as_raw_fd();
    if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        warn!(pdef = %path.display(), "endian writeback skipped: file locked by another process");
        return;
    }

    let result = (|| -> std::io::Result<()> {
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let updated = match insert_endian_clause(&content, endian_str, &timestamp) {
            Some(u) => u,
            None => {
                info!(pdef = %path.display(),
                      "endian writeback skipped: clause present or no protocol header");
                return Ok(());
            }
        };

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(updated.as_bytes())?;
        file.sync_all()?;
        info!(pdef = %path.display(), endian = endian_str, "endian written back to PDEF source");
        Ok(())
    })();

    if let Err(e) = result {
        warn!(pdef = %path.display(), "endian writeback failed: {}", e);
    }

    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
}

/// Addresses the reload actor republishes snapshots to.
pub struct ReloadTargets {
    pub manager: Address<ManagerMsg>,
    pub cleanup: Address<CleanupMsg>,
    pub sampler: Address<SamplerMsg>,
}

pub struct ReloadActor {
    server: Arc<ServerConfig>,
    strategy_path: PathBuf,
    targets: ReloadTargets,
    last_mtime: Option<SystemTime>,
}

impl ReloadActor {
    pub fn new(server: Arc<ServerConfig>, targets: ReloadTargets) -> ReloadActor {
        let strategy_path = PathBuf::from(&server.strategy_path);
        ReloadActor { server, strategy_path, targets, last_mtime: None }
    }

    pub fn run(mut self, rx: Receiver<ReloadMsg>) {
        self.last_mtime = mtime_of(&self.strategy_path);
        let ticker = tick(Duration::from_secs(1));
        info!(strategy = %self.strategy_path.display(), "reload actor started");

        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(ReloadMsg::PdefEndianDetected { source_path, endian }) => {
                        info!(pdef = %source_path.display(), endian = endian.name(),
                              "endian writeback requested");
                        writeback_pdef_endian(&source_path, endian);
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.check_config(),
            }
        }
        debug!("reload actor stopped");
    }

    fn check_config(&mut self) {
        let mtime = match mtime_of(&self.strategy_path) {
            Some(m) => m,
            None => return,
        };
        if self.last_mtime == Some(mtime) {
            return;
        }
        self.last_mtime = Some(mtime);

        let strategy = match StrategyConfig::load(&self.strategy_path) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("strategy reload failed, keeping previous config: {}", e);
                return;
            }
        };

        let snapshot = Arc::new(CaptureConfigSnapshot::build(
            &self.server,
            chrono::Local::now().timestamp(),
        ));
        info!(hash = snapshot.config_hash, "configuration reloaded");

        let _ = self.targets.manager.send(ManagerMsg::ConfigRefresh {
            strategy: strategy.clone(),
            snapshot: snapshot.clone(),
        });
        let _ = self.targets.cleanup.send(CleanupMsg::ConfigRefresh(snapshot));
        let _ = self.targets.sampler.send(SamplerMsg::ConfigRefresh(strategy));
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
