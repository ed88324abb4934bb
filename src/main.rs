//! netcapd — programmable on-host packet-capture service.
//!
//! Capture sessions, filtering and cleanup run on plain OS threads wired
//! together with bounded mailboxes; only the HTTP control plane sits on an
//! async runtime. Run `netcapd --help` for usage.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netcap_core::config::CaptureConfigSnapshot;
use netcap_core::messages::{CleanupMsg, ManagerMsg, ReloadMsg, SamplerMsg, WorkerMsg};
use netcap_core::reload::{ReloadActor, ReloadTargets};
use netcap_core::sampler::Sampler;
use netcap_core::{cleanup, mailbox, worker, Manager, ServerConfig, StrategyConfig, TaskTable};

mod cli;
mod http;

use cli::{Cli, Commands, PdefCommands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_service(&cli.config),
        Commands::Init => {
            println!("{}", serde_json::to_string_pretty(&ServerConfig::example())?);
            Ok(())
        }
        Commands::Pdef { command } => match command {
            PdefCommands::Parse { file, disasm } => pdef_parse(&file, disasm),
        },
    }
}

fn init_tracing(server: &ServerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(server.logging.level_filter()));

    if server.logging.log_path.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let path = if server.logging.log_prefix.is_empty() {
            server.logging.log_path.clone()
        } else {
            format!("{}/{}.log", server.logging.log_path, server.logging.log_prefix)
        };
        if let Some(parent) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(move || file.try_clone().expect("log file clone"))
            .init();
    }
    Ok(())
}

fn run_service(config_path: &std::path::Path) -> Result<()> {
    let server = Arc::new(match ServerConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config load failed ({}), using defaults", e);
            ServerConfig::default()
        }
    });
    init_tracing(&server)?;

    let strategy_path = std::path::Path::new(&server.strategy_path);
    let strategy = Arc::new(match StrategyConfig::load(strategy_path) {
        Ok(s) => s,
        Err(e) => {
            warn!("strategy config unavailable ({}), using defaults", e);
            StrategyConfig::default()
        }
    });

    let snapshot =
        Arc::new(CaptureConfigSnapshot::build(&server, chrono::Local::now().timestamp()));
    let table = Arc::new(TaskTable::new());

    info!(
        bind = %server.server.bind_addr,
        port = server.server.port,
        capture_threads = server.server.capture_threads,
        config_hash = snapshot.config_hash,
        "netcapd starting"
    );

    // ── Mailboxes ───────────────────────────────────────────────────────
    let queue_size = strategy.sample.worker_queue_size.max(64);
    let (manager_addr, manager_rx) = mailbox::<ManagerMsg>("manager", queue_size);
    let (cleanup_addr, cleanup_rx) = mailbox::<CleanupMsg>("cleanup", 256);
    let (reload_addr, reload_rx) = mailbox::<ReloadMsg>("reload", 64);
    let (sampler_addr, sampler_rx) = mailbox::<SamplerMsg>("sampler", 16);

    let worker_count = server.server.capture_threads.max(1);
    let mut worker_addrs = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let (addr, rx) = mailbox::<WorkerMsg>("capture-worker", 64);
        worker_addrs.push(addr);
        let manager_for_worker = manager_addr.clone();
        let reload_for_worker = reload_addr.clone();
        let worker_id = (i + 1) as u32;
        std::thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || worker::run(worker_id, rx, manager_for_worker, reload_for_worker))
            .context("failed to spawn capture worker")?;
    }

    // ── Actors ──────────────────────────────────────────────────────────
    {
        let actor = cleanup::CleanupActor::new(manager_addr.clone(), snapshot.clone());
        std::thread::Builder::new()
            .name("cleanup".into())
            .spawn(move || actor.run(cleanup_rx))
            .context("failed to spawn cleanup actor")?;
    }
    {
        let sampler = Sampler::new(manager_addr.clone(), strategy.clone());
        std::thread::Builder::new()
            .name("sampler".into())
            .spawn(move || sampler.run(sampler_rx))
            .context("failed to spawn sampler")?;
    }
    {
        let targets = ReloadTargets {
            manager: manager_addr.clone(),
            cleanup: cleanup_addr.clone(),
            sampler: sampler_addr.clone(),
        };
        let actor = ReloadActor::new(server.clone(), targets);
        std::thread::Builder::new()
            .name("reload".into())
            .spawn(move || actor.run(reload_rx))
            .context("failed to spawn reload actor")?;
    }
    {
        let mgr = Manager::new(
            table.clone(),
            worker_addrs,
            cleanup_addr.clone(),
            server.clone(),
            strategy.clone(),
            snapshot.clone(),
        );
        std::thread::Builder::new()
            .name("manager".into())
            .spawn(move || mgr.run(manager_rx))
            .context("failed to spawn manager")?;
    }

    // ── HTTP control plane ──────────────────────────────────────────────
    let state = Arc::new(http::AppState { manager: manager_addr, table, server: server.clone() });
    let app = http::router(state);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(server.server.workers.max(1))
        .enable_all()
        .build()
        .context("failed to build HTTP runtime")?;

    runtime.block_on(async move {
        let addr = format!("{}:{}", server.server.bind_addr, server.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(%addr, "control plane listening");
        axum::serve(listener, app).await.context("http server failed")
    })
}

fn pdef_parse(file: &std::path::Path, disasm: bool) -> Result<()> {
    let proto =
        netcap_pdef::parse_file(file).map_err(|e| anyhow::anyhow!("parse failed: {}", e))?;

    println!("Protocol: {}", proto.name);
    println!(
        "Endian: {}",
        match proto.endian_mode {
            netcap_pdef::EndianMode::Big => "big",
            netcap_pdef::EndianMode::Little => "little",
            netcap_pdef::EndianMode::Auto => "auto",
        }
    );

    if !proto.constants.is_empty() {
        println!("\nConstants ({}):", proto.constants.len());
        for (name, value) in &proto.constants {
            println!("  {} = 0x{:x} ({})", name, value, value);
        }
    }

    println!("\nStructures ({}):", proto.structs.len());
    for s in &proto.structs {
        println!("  {} (min_size={}, variable={})", s.name, s.min_size, s.has_variable);
        for f in &s.fields {
            println!("    [{:4}] {:<24} {} (size={})", f.offset, f.name, f.ty.name(), f.size);
        }
    }

    println!("\nFilter rules ({}):", proto.filters.len());
    for rule in &proto.filters {
        if disasm {
            println!();
            print!("{}", netcap_pdef::disassemble_rule(rule));
        } else {
            println!(
                "  {} (struct={}, min_size={}, instructions={})",
                rule.name,
                rule.struct_name,
                rule.min_packet_size,
                rule.bytecode_be.len()
            );
        }
    }

    Ok(())
}
