//! Process and port introspection over `/proc`.
//!
//! Matching follows the operator-friendly rules: a pattern hits a process
//! when it equals or is contained in the comm, appears anywhere in the
//! cmdline, or matches the executable's basename. Listening ports come from
//! joining the process's socket inodes against `/proc/net/tcp{,6}` rows in
//! LISTEN state.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: i32,
    pub comm: String,
    pub cmdline: String,
    pub listening_ports: Vec<u16>,
    pub netns_path: String,
}

/// Scan `/proc` for processes matching `pattern`.
pub fn find_processes_by_name(pattern: &str) -> Vec<ProcessInfo> {
    let mut result = Vec::new();
    if pattern.is_empty() {
        return result;
    }

    let entries = match fs::read_dir("/proc") {
        Ok(e) => e,
        Err(e) => {
            warn!("failed to open /proc: {}", e);
            return result;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let pid: i32 = match name.to_string_lossy().parse() {
            Ok(p) if p > 0 => p,
            _ => continue,
        };

        let comm = read_comm(pid);
        let cmdline = read_cmdline(pid);
        if matches_process_name(&cmdline, &comm, pattern) {
            result.push(ProcessInfo {
                pid,
                comm,
                cmdline,
                listening_ports: listening_ports(pid),
                netns_path: netns_path(pid),
            });
        }
    }

    debug!(pattern, matches = result.len(), "process name resolution");
    result
}

/// Introspect a single pid; None when the process does not exist.
pub fn process_info(pid: i32) -> Option<ProcessInfo> {
    if pid <= 0 || !Path::new(&format!("/proc/{}", pid)).is_dir() {
        return None;
    }
    let comm = read_comm(pid);
    if comm.is_empty() {
        return None;
    }
    Some(ProcessInfo {
        pid,
        comm,
        cmdline: read_cmdline(pid),
        listening_ports: listening_ports(pid),
        netns_path: netns_path(pid),
    })
}

pub fn is_process_alive(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{}", pid)).is_dir()
}

/// Union of LISTEN-state local ports over tcp and tcp6, sorted ascending.
pub fn listening_ports(pid: i32) -> Vec<u16> {
    if pid <= 0 {
        return Vec::new();
    }

    let inodes = socket_inodes(pid);
    if inodes.is_empty() {
        return Vec::new();
    }

    let mut ports: BTreeSet<u16> = BTreeSet::new();
    for file in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = fs::read_to_string(file) {
            ports.extend(parse_tcp_listeners(&content, &inodes));
        }
    }
    ports.into_iter().collect()
}

/// Socket inode numbers from `/proc/<pid>/fd/*` links of the form
/// `socket:[N]`.
fn socket_inodes(pid: i32) -> BTreeSet<u64> {
    let mut inodes = BTreeSet::new();
    let fd_dir = format!("/proc/{}/fd", pid);
    let entries = match fs::read_dir(&fd_dir) {
        Ok(e) => e,
        Err(_) => return inodes,
    };
    for entry in entries.flatten() {
        if let Ok(target) = fs::read_link(entry.path()) {
            let target = target.to_string_lossy();
            if let Some(rest) = target.strip_prefix("socket:[") {
                if let Some(num) = rest.strip_suffix(']') {
                    if let Ok(inode) = num.parse::<u64>() {
                        inodes.insert(inode);
                    }
                }
            }
        }
    }
    inodes
}

/// Parse `/proc/net/tcp`-format content, keeping local ports of LISTEN
/// (state 0A) rows whose inode is in `inodes`.
pub fn parse_tcp_listeners(content: &str, inodes: &BTreeSet<u64>) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let local_address = fields[1];
        let state = fields[3];
        let inode_str = fields[9];

        if state != "0A" {
            continue;
        }
        let port_hex = match local_address.rsplit_once(':') {
            Some((_, p)) => p,
            None => continue,
        };
        let port = match u32::from_str_radix(port_hex, 16) {
            Ok(p) if p > 0 && p <= u32::from(u16::MAX) => p as u16,
            _ => continue,
        };
        let inode: u64 = match inode_str.parse() {
            Ok(i) if i > 0 => i,
            _ => continue,
        };
        if inodes.contains(&inode) {
            ports.push(port);
        }
    }
    ports
}

pub fn netns_path(pid: i32) -> String {
    fs::read_link(format!("/proc/{}/ns/net", pid))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_comm(pid: i32) -> String {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|s| s.trim_end_matches('\n').to_string())
        .unwrap_or_default()
}

fn read_cmdline(pid: i32) -> String {
    let raw = fs::read(format!("/proc/{}/cmdline", pid)).unwrap_or_default();
    let mut s: String = raw
        .iter()
        .map(|&b| if b == 0 { ' ' } else { b as char })
        .collect();
    while s.ends_with(' ') {
        s.pop();
    }
    s
}

/// Pattern matching truth table: comm equality, comm substring, cmdline
/// substring, or executable basename (exact or substring).
pub fn matches_process_name(cmdline: &str, comm: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if comm == pattern || comm.contains(pattern) || cmdline.contains(pattern) {
        return true;
    }

    if let Some(last_slash) = cmdline.rfind('/') {
        let mut exe = &cmdline[last_slash + 1..];
        if let Some(space) = exe.find(' ') {
            exe = &exe[..space];
        }
        if exe == pattern || exe.contains(pattern) {
            return true;
        }
    }

    false
}
