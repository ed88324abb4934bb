//! Output-path pattern expansion and directory helpers.
//!
//! Pattern tokens expand from the session context; unknown tokens are
//! emitted literally so operator typos surface in the path instead of
//! silently disappearing.

use std::fs;
use std::path::Path;

use chrono::{Local, TimeZone};

pub const DEFAULT_FILE_PATTERN: &str = "{day}/{date}-{iface}-{proc}-{port}.pcap";

/// Everything pattern expansion needs from a capture session.
#[derive(Debug, Clone, Default)]
pub struct PatternContext {
    pub base_dir: String,
    pub pattern: String,
    pub category: String,
    pub iface: String,
    pub proc_label: String,
    /// 0 means "any".
    pub port: u16,
    pub seq: u32,
    /// Unix seconds of the session start; 0 means "now".
    pub start_time: i64,
}

/// Expand the filename pattern and join it under the base directory.
///
/// Tokens: `{day}` → YYYYMMDD, `{date}` → YYYYMMDDhhmm, `{ts}` → unix
/// seconds, `{iface}`, `{proc}` (default "any"), `{port}` (default "any"),
/// `{seq}` → zero-padded 4 digits, `{category}`. When the session has a
/// nonzero port but the pattern lacks `{port}`, `-p<port>` is inserted
/// before the last dot. Consecutive slashes collapse.
pub fn expand_pattern(ctx: &PatternContext) -> String {
    let pattern = if ctx.pattern.is_empty() { DEFAULT_FILE_PATTERN } else { &ctx.pattern };

    let base_time = if ctx.start_time != 0 { ctx.start_time } else { Local::now().timestamp() };
    let local = Local
        .timestamp_opt(base_time, 0)
        .single()
        .unwrap_or_else(Local::now);

    let day = local.format("%Y%m%d").to_string();
    let date = local.format("%Y%m%d%H%M").to_string();

    let mut out = String::with_capacity(pattern.len() + 64);
    let mut has_port_token = false;

    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(j) = pattern[i + 1..].find('}') {
                let key = &pattern[i + 1..i + 1 + j];
                match key {
                    "day" => out.push_str(&day),
                    "date" => out.push_str(&date),
                    "ts" => out.push_str(&base_time.to_string()),
                    "iface" => out.push_str(&ctx.iface),
                    "proc" => {
                        if ctx.proc_label.is_empty() {
                            out.push_str("any");
                        } else {
                            out.push_str(&ctx.proc_label);
                        }
                    }
                    "port" => {
                        has_port_token = true;
                        if ctx.port > 0 {
                            out.push_str(&ctx.port.to_string());
                        } else {
                            out.push_str("any");
                        }
                    }
                    "seq" => out.push_str(&format!("{:04}", ctx.seq)),
                    "category" => out.push_str(&ctx.category),
                    other => out.push_str(other),
                }
                i += j + 2;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }

    if out.contains("//") {
        let mut collapsed = String::with_capacity(out.len());
        let mut prev_slash = false;
        for c in out.chars() {
            if c == '/' {
                if !prev_slash {
                    collapsed.push(c);
                }
                prev_slash = true;
            } else {
                collapsed.push(c);
                prev_slash = false;
            }
        }
        out = collapsed;
    }

    if ctx.port > 0 && !has_port_token {
        let suffix = format!("-p{}", ctx.port);
        match out.rfind('.') {
            Some(dot) => out.insert_str(dot, &suffix),
            None => out.push_str(&suffix),
        }
    }

    join_path(&ctx.base_dir, &out)
}

pub fn join_path(a: &str, b: &str) -> String {
    if b.is_empty() {
        return a.to_string();
    }
    if b.starts_with('/') {
        return b.to_string();
    }
    if a.is_empty() {
        return b.to_string();
    }
    if a.ends_with('/') {
        format!("{}{}", a, b)
    } else {
        format!("{}/{}", a, b)
    }
}

/// Create the parent directory chain of `path`.
pub fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn ensure_dir(path: &str) -> std::io::Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    fs::create_dir_all(path)
}
