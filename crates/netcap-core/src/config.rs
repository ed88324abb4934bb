//! Configuration: the static server config, the reloadable strategy file,
//! and the immutable [`CaptureConfigSnapshot`] value handed to every actor.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_FILE_PATTERN: &str = "{day}/{date}-{iface}-{proc}-{port}.pcap";

// ─── Server config (config/netcapd.json) ─────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "ServerSection::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "ServerSection::default_port")]
    pub port: u16,
    #[serde(default = "ServerSection::default_workers")]
    pub workers: usize,
    #[serde(default = "ServerSection::default_capture_threads")]
    pub capture_threads: usize,
}

impl ServerSection {
    fn default_bind_addr() -> String { "127.0.0.1".into() }
    fn default_port() -> u16 { 8080 }
    fn default_workers() -> usize { 2 }
    fn default_capture_threads() -> usize { 4 }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            port: Self::default_port(),
            workers: Self::default_workers(),
            capture_threads: Self::default_capture_threads(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub log_prefix: String,
    #[serde(default)]
    pub log_size_mb: u32,
    /// 0 = error, 1 = warn, 2 = info, 3 = debug, 4 = trace.
    #[serde(default = "LoggingSection::default_level")]
    pub log_level: u8,
}

impl Default for LoggingSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("logging section defaults")
    }
}

impl LoggingSection {
    fn default_level() -> u8 { 2 }

    pub fn level_filter(&self) -> &'static str {
        match self.log_level {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureSection {
    #[serde(default = "CaptureSection::default_interface")]
    pub default_interface: String,
    #[serde(default = "CaptureSection::default_duration")]
    pub default_duration: i64,
    #[serde(default = "CaptureSection::default_category")]
    pub default_category: String,
    #[serde(default = "CaptureSection::default_pattern")]
    pub file_pattern: String,
    /// Rotation cap per output file.
    #[serde(default = "CaptureSection::default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "CaptureSection::default_snaplen")]
    pub snaplen: i32,
    #[serde(default)]
    pub compress_enabled: bool,
    /// External command for legacy inline rotation compression
    /// (e.g. "gzip -9"); empty selects the built-in default.
    #[serde(default)]
    pub compress_format: String,
    #[serde(default)]
    pub compress_remove_source: bool,
    #[serde(default)]
    pub compress_threshold_mb: u32,
    #[serde(default = "CaptureSection::default_progress_interval")]
    pub progress_interval_sec: u32,
    #[serde(default = "CaptureSection::default_progress_packets")]
    pub progress_packet_threshold: u64,
    #[serde(default = "CaptureSection::default_progress_bytes")]
    pub progress_bytes_threshold: u64,
}

impl CaptureSection {
    fn default_interface() -> String { "any".into() }
    fn default_duration() -> i64 { 60 }
    fn default_category() -> String { "default".into() }
    fn default_pattern() -> String { DEFAULT_FILE_PATTERN.into() }
    fn default_max_file_size_mb() -> u64 { 100 }
    fn default_snaplen() -> i32 { 65535 }
    fn default_progress_interval() -> u32 { 5 }
    fn default_progress_packets() -> u64 { 1000 }
    fn default_progress_bytes() -> u64 { 1024 * 1024 }
}

impl Default for CaptureSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("capture section defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default = "StorageSection::default_base_dir")]
    pub base_dir: String,
    #[serde(default = "StorageSection::default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "StorageSection::default_max_size_gb")]
    pub max_size_gb: u64,
    #[serde(default = "StorageSection::default_pdef_dir")]
    pub temp_pdef_dir: String,
    #[serde(default = "StorageSection::default_pdef_ttl")]
    pub temp_pdef_ttl_hours: u32,
}

impl StorageSection {
    fn default_base_dir() -> String { "/var/log/netcapd/captures".into() }
    fn default_max_age_days() -> u32 { 7 }
    fn default_max_size_gb() -> u64 { 10 }
    fn default_pdef_dir() -> String { "/tmp/netcapd_pdef".into() }
    fn default_pdef_ttl() -> u32 { 24 }
}

impl Default for StorageSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("storage section defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanupSection {
    #[serde(default = "CleanupSection::default_interval")]
    pub compress_interval_sec: u64,
    #[serde(default = "CleanupSection::default_batch_count")]
    pub batch_compress_file_count: usize,
    #[serde(default = "CleanupSection::default_batch_size_mb")]
    pub batch_compress_size_mb: u64,
    #[serde(default = "CleanupSection::default_archive_dir")]
    pub archive_dir: String,
    #[serde(default = "CleanupSection::default_keep_days")]
    pub archive_keep_days: u32,
    #[serde(default)]
    pub archive_max_total_size_mb: u64,
    #[serde(default)]
    pub archive_remove_source: bool,
}

impl CleanupSection {
    fn default_interval() -> u64 { 60 }
    fn default_batch_count() -> usize { 10 }
    fn default_batch_size_mb() -> u64 { 100 }
    fn default_archive_dir() -> String { "/var/log/netcapd/archives".into() }
    fn default_keep_days() -> u32 { 7 }
}

impl Default for CleanupSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("cleanup section defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsSection {
    #[serde(default = "LimitsSection::default_max_concurrent")]
    pub max_concurrent_captures: usize,
}

impl LimitsSection {
    fn default_max_concurrent() -> usize { 4 }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self { max_concurrent_captures: Self::default_max_concurrent() }
    }
}

/// Top-level server configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    #[serde(default)]
    pub limits: LimitsSection,
    /// protocol name → PDEF file path.
    #[serde(default)]
    pub protocols: std::collections::BTreeMap<String, String>,
    /// Path of the strategy file watched by the reload actor.
    #[serde(default = "ServerConfig::default_strategy_path")]
    pub strategy_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("server config defaults")
    }
}

impl ServerConfig {
    fn default_strategy_path() -> String { "config/strategy.json".into() }

    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Lookup a PDEF path for a protocol name, falling back to
    /// `config/protocols/<name>.pdef` auto-discovery.
    pub fn protocol_pdef_path(&self, name: &str) -> String {
        self.protocols
            .get(name)
            .cloned()
            .unwrap_or_else(|| format!("config/protocols/{}.pdef", name))
    }

    /// Example config, pretty-printed by `netcapd init`.
    pub fn example() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.protocols.insert("myproto".into(), "config/protocols/myproto.pdef".into());
        cfg
    }
}

// ─── Strategy config (watched file) ──────────────────────────────────────────

/// One auto-capture trigger module of the sampler.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TriggerModule {
    pub name: String,
    #[serde(default)]
    pub cpu_pct_gt: f64,
    #[serde(default)]
    pub mem_pct_gt: f64,
    #[serde(default)]
    pub net_rx_kbps_gt: f64,
    /// Capture hint such as `iface:lo filter:"udp port 53"`; empty means
    /// alert-only.
    #[serde(default)]
    pub trigger_capture: String,
    #[serde(default)]
    pub capture_category: String,
    #[serde(default)]
    pub capture_duration_sec: i64,
    #[serde(default)]
    pub cooldown_sec: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SampleSection {
    #[serde(default = "SampleSection::default_queue_size")]
    pub worker_queue_size: usize,
    #[serde(default = "SampleSection::default_interval")]
    pub sample_interval_sec: u64,
    #[serde(default)]
    pub cpu_pct_gt: f64,
    #[serde(default)]
    pub mem_pct_gt: f64,
    #[serde(default)]
    pub net_rx_kbps_gt: f64,
    #[serde(default)]
    pub triggers: Vec<TriggerModule>,
}

impl SampleSection {
    fn default_queue_size() -> usize { 1024 }
    fn default_interval() -> u64 { 15 }
}

impl Default for SampleSection {
    fn default() -> Self {
        serde_json::from_str("{}").expect("sample section defaults")
    }
}

/// The reloadable strategy file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub sample: SampleSection,
}

impl StrategyConfig {
    pub fn load(path: &Path) -> Result<StrategyConfig, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Sampling interval with the 1-second floor applied.
    pub fn sample_interval(&self) -> u64 {
        self.sample.sample_interval_sec.max(1)
    }
}

// ─── Capture config snapshot ─────────────────────────────────────────────────

/// Immutable union of the capture/storage/cleanup configuration delivered to
/// workers and the cleanup actor with every dispatch. Rebuilt (with a fresh
/// hash and timestamp) whenever the reload actor observes a config change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureConfigSnapshot {
    pub output_dir: String,
    pub filename_template: String,
    pub default_category: String,
    pub max_duration_sec: i64,
    pub max_bytes: u64,
    pub max_packets: u64,
    pub snaplen: i32,

    pub compress_enabled: bool,
    pub compress_format: String,
    pub compress_remove_src: bool,
    pub compress_threshold_mb: u32,

    pub progress_interval_sec: u32,
    pub progress_packet_threshold: u64,
    pub progress_bytes_threshold: u64,

    pub temp_pdef_dir: String,
    pub temp_pdef_ttl_hours: u32,

    pub storage_max_age_days: u32,
    pub storage_max_size_gb: u64,

    pub compress_interval_sec: u64,
    pub batch_compress_file_count: usize,
    pub batch_compress_size_mb: u64,
    pub archive_dir: String,
    pub archive_keep_days: u32,
    pub archive_max_total_size_mb: u64,
    pub archive_remove_source: bool,

    pub config_hash: u32,
    pub config_timestamp: i64,
}

impl CaptureConfigSnapshot {
    pub fn build(server: &ServerConfig, timestamp: i64) -> CaptureConfigSnapshot {
        let mut snap = CaptureConfigSnapshot {
            output_dir: server.storage.base_dir.clone(),
            filename_template: server.capture.file_pattern.clone(),
            default_category: server.capture.default_category.clone(),
            max_duration_sec: server.capture.default_duration,
            max_bytes: server.capture.max_file_size_mb * 1024 * 1024,
            max_packets: 0,
            snaplen: server.capture.snaplen,
            compress_enabled: server.capture.compress_enabled,
            compress_format: server.capture.compress_format.clone(),
            compress_remove_src: server.capture.compress_remove_source,
            compress_threshold_mb: server.capture.compress_threshold_mb,
            progress_interval_sec: server.capture.progress_interval_sec,
            progress_packet_threshold: server.capture.progress_packet_threshold,
            progress_bytes_threshold: server.capture.progress_bytes_threshold,
            temp_pdef_dir: server.storage.temp_pdef_dir.clone(),
            temp_pdef_ttl_hours: server.storage.temp_pdef_ttl_hours,
            storage_max_age_days: server.storage.max_age_days,
            storage_max_size_gb: server.storage.max_size_gb,
            compress_interval_sec: server.cleanup.compress_interval_sec,
            batch_compress_file_count: server.cleanup.batch_compress_file_count,
            batch_compress_size_mb: server.cleanup.batch_compress_size_mb,
            archive_dir: server.cleanup.archive_dir.clone(),
            archive_keep_days: server.cleanup.archive_keep_days,
            archive_max_total_size_mb: server.cleanup.archive_max_total_size_mb,
            archive_remove_source: server.cleanup.archive_remove_source,
            config_hash: 0,
            config_timestamp: timestamp,
        };
        snap.config_hash = snap.compute_hash();
        snap
    }

    /// FNV-1a-32 over the serialized field stream, excluding the hash field
    /// itself and the timestamp.
    fn compute_hash(&self) -> u32 {
        let mut clean = self.clone();
        clean.config_hash = 0;
        clean.config_timestamp = 0;
        let bytes = serde_json::to_vec(&clean).unwrap_or_default();
        fnv1a32(&bytes)
    }
}

/// FNV-1a-32. The 64-bit variant comes from the `fnv` crate; this small
/// 32-bit sibling exists only for the config hash.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
