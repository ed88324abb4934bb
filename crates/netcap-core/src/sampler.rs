//! Resource sampler: periodic `/proc` readings and threshold alerts.
//!
//! CPU and memory are point-in-time ratios; network throughput is the
//! counter delta across the sampling interval, `lo` excluded. Each
//! configured trigger module is evaluated independently; with no modules
//! the global default thresholds apply under the module name "default".

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use tracing::{debug, info, warn};

use crate::bus::Address;
use crate::config::{StrategyConfig, TriggerModule};
use crate::messages::{ManagerMsg, SampleAlert, SamplerMsg};

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStats {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_rx_kbps: f64,
    pub network_tx_kbps: f64,
}

/// CPU% from the aggregate line of `/proc/stat`:
/// (total − idle) / total × 100 over (user, nice, system, idle).
pub fn parse_cpu_percent(stat: &str) -> Option<f64> {
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let user: u64 = fields.next()?.parse().ok()?;
    let nice: u64 = fields.next()?.parse().ok()?;
    let system: u64 = fields.next()?.parse().ok()?;
    let idle: u64 = fields.next()?.parse().ok()?;
    let total = user + nice + system + idle;
    if total == 0 {
        return None;
    }
    Some((total - idle) as f64 / total as f64 * 100.0)
}

/// Memory% from `/proc/meminfo`: (MemTotal − MemAvailable) / MemTotal × 100.
pub fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let mut total: Option<u64> = None;
    let mut available: Option<u64> = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse().ok();
            break;
        }
    }
    let total = total?;
    let available = available?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

/// Summed (rx_bytes, tx_bytes) over all interfaces except `lo` from
/// `/proc/net/dev`.
pub fn parse_net_bytes(netdev: &str) -> (u64, u64) {
    let mut rx_total = 0u64;
    let mut tx_total = 0u64;
    for line in netdev.lines().skip(2) {
        let (iface, rest) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        if let (Ok(rx), Ok(tx)) = (fields[0].parse::<u64>(), fields[8].parse::<u64>()) {
            rx_total += rx;
            tx_total += tx;
        }
    }
    (rx_total, tx_total)
}

/// Threshold evaluation for one module; a zero threshold disables that axis.
pub fn evaluate_module(stats: &SystemStats, module: &TriggerModule) -> (bool, bool, bool) {
    let cpu_hit = module.cpu_pct_gt > 0.0 && stats.cpu_percent > module.cpu_pct_gt;
    let mem_hit = module.mem_pct_gt > 0.0 && stats.memory_percent > module.mem_pct_gt;
    let net_hit = module.net_rx_kbps_gt > 0.0 && stats.network_rx_kbps > module.net_rx_kbps_gt;
    (cpu_hit, mem_hit, net_hit)
}

pub struct Sampler {
    manager: Address<ManagerMsg>,
    strategy: Arc<StrategyConfig>,
    prev_net: Option<(u64, u64)>,
}

impl Sampler {
    pub fn new(manager: Address<ManagerMsg>, strategy: Arc<StrategyConfig>) -> Sampler {
        Sampler { manager, strategy, prev_net: None }
    }

    pub fn run(mut self, rx: Receiver<SamplerMsg>) {
        let mut interval = self.strategy.sample_interval();
        let mut ticker = tick(Duration::from_secs(interval));
        info!(interval, "sampler started");

        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(SamplerMsg::ConfigRefresh(strategy)) => {
                        self.strategy = strategy;
                        let fresh = self.strategy.sample_interval();
                        if fresh != interval {
                            interval = fresh;
                            ticker = tick(Duration::from_secs(interval));
                            info!(interval, "sampler interval updated");
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.sample_and_check(interval),
            }
        }
        debug!("sampler stopped");
    }

    fn sample_and_check(&mut self, interval: u64) {
        let stats = match self.sample(interval) {
            Some(s) => s,
            None => return,
        };

        let sample = &self.strategy.sample;
        if !sample.triggers.is_empty() {
            for module in &sample.triggers {
                let (cpu_hit, mem_hit, net_hit) = evaluate_module(&stats, module);
                if cpu_hit || mem_hit || net_hit {
                    self.emit_alert(&stats, module, cpu_hit, mem_hit, net_hit);
                }
            }
            return;
        }

        // No modules configured: evaluate the global defaults as an
        // implicit module named "default".
        let default_module = TriggerModule {
            name: "default".into(),
            cpu_pct_gt: sample.cpu_pct_gt,
            mem_pct_gt: sample.mem_pct_gt,
            net_rx_kbps_gt: sample.net_rx_kbps_gt,
            ..TriggerModule::default()
        };
        let (cpu_hit, mem_hit, net_hit) = evaluate_module(&stats, &default_module);
        if cpu_hit || mem_hit || net_hit {
            self.emit_alert(&stats, &default_module, cpu_hit, mem_hit, net_hit);
        }
    }

    fn sample(&mut self, interval: u64) -> Option<SystemStats> {
        let mut stats = SystemStats { timestamp: chrono::Local::now().timestamp(), ..SystemStats::default() };

        match std::fs::read_to_string("/proc/stat") {
            Ok(content) => stats.cpu_percent = parse_cpu_percent(&content).unwrap_or(0.0),
            Err(e) => warn!("sampler: /proc/stat unreadable: {}", e),
        }
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(content) => stats.memory_percent = parse_memory_percent(&content).unwrap_or(0.0),
            Err(e) => warn!("sampler: /proc/meminfo unreadable: {}", e),
        }
        match std::fs::read_to_string("/proc/net/dev") {
            Ok(content) => {
                let (rx, tx) = parse_net_bytes(&content);
                if let Some((prev_rx, prev_tx)) = self.prev_net {
                    let secs = interval.max(1) as f64;
                    stats.network_rx_kbps = rx.saturating_sub(prev_rx) as f64 / 1024.0 / secs;
                    stats.network_tx_kbps = tx.saturating_sub(prev_tx) as f64 / 1024.0 / secs;
                }
                self.prev_net = Some((rx, tx));
            }
            Err(e) => warn!("sampler: /proc/net/dev unreadable: {}", e),
        }

        Some(stats)
    }

    fn emit_alert(
        &self,
        stats: &SystemStats,
        module: &TriggerModule,
        cpu_hit: bool,
        mem_hit: bool,
        net_hit: bool,
    ) {
        info!(
            module = %module.name,
            cpu_hit,
            mem_hit,
            net_hit,
            cpu = stats.cpu_percent,
            mem = stats.memory_percent,
            net_rx = stats.network_rx_kbps,
            "sample threshold exceeded"
        );

        let alert = SampleAlert {
            timestamp: stats.timestamp,
            cpu_percent: stats.cpu_percent,
            memory_percent: stats.memory_percent,
            network_rx_kbps: stats.network_rx_kbps,
            network_tx_kbps: stats.network_tx_kbps,
            cpu_hit,
            mem_hit,
            net_hit,
            module_name: module.name.clone(),
            capture_hint: module.trigger_capture.clone(),
            capture_category: module.capture_category.clone(),
            capture_duration_sec: module.capture_duration_sec,
            cooldown_sec: module.cooldown_sec,
            cpu_threshold: module.cpu_pct_gt,
            mem_threshold: module.mem_pct_gt,
            net_threshold: module.net_rx_kbps_gt,
        };
        if let Err(e) = self.manager.send(ManagerMsg::SampleAlert(Box::new(alert))) {
            warn!("sample alert send failed: {}", e);
        }
    }
}
