#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # tether-agent
//!
//! Developer-machine agent for the tether remote-coding gateway.
//!
//! The agent opens a single outbound WebSocket to the hub's `/agent`
//! endpoint, registers with a pre-shared token, and serves forwarded client
//! requests: project lifecycle operations go to the worker supervisor,
//! session-scoped requests are routed to the per-project worker process over
//! its local HTTP API (auto-starting workers as needed).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap CLI, shutdown, crash-recovery sweep
//! config.rs        — TOML + env-var configuration
//! tunnel.rs        — outbound WS client: reconnect, register, dispatch
//! handler.rs       — action dispatch, session → project bindings
//! worker.rs        — worker HTTP client (sessions, prompt streaming)
//! supervisor/
//!   mod.rs         — WorkerSupervisor (lifecycle, allow-list, health gate)
//!   instance.rs    — per-project instance state
//!   ports.rs       — bounded port pool
//!   launcher.rs    — process / docker / tmux launch methods
//!   probe.rs       — HTTP health probe
//! ```

mod config;
mod handler;
mod supervisor;
mod tunnel;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use config::Config;
use handler::Handler;
use supervisor::launcher::{DockerLauncher, ProcessLauncher, TmuxLauncher, WorkerLauncher};
use supervisor::probe::HttpHealthProbe;
use supervisor::WorkerSupervisor;

/// Developer-machine agent for the tether remote-coding gateway.
#[derive(Parser)]
#[command(name = "tether-agent", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tether-agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Agent ID: {}", config.hub.agent_id);
    info!("  Hub URL: {}", config.hub.url);
    info!("  Allowed paths: {:?}", config.workers.allowed_paths);
    info!(
        "  Ports: {}-{}, max instances: {}, launcher: {}",
        config.workers.port_min,
        config.workers.port_max,
        config.workers.max_instances,
        config.workers.launcher
    );

    let launcher: Arc<dyn WorkerLauncher> = match config.workers.launcher.as_str() {
        "docker" => Arc::new(DockerLauncher::new(
            &config.workers.docker_image,
            &config.workers.command,
        )),
        "tmux" => Arc::new(TmuxLauncher::new(&config.workers.command)),
        "process" => Arc::new(ProcessLauncher::new(&config.workers.command)),
        other => {
            eprintln!("Unknown launcher {other:?} (expected process, docker, or tmux)");
            std::process::exit(1);
        }
    };

    let supervisor = Arc::new(WorkerSupervisor::new(
        config.workers.allowed_paths.clone(),
        config.workers.port_min,
        config.workers.port_max,
        config.workers.max_instances,
        Duration::from_secs(config.workers.health_timeout_secs),
        launcher,
        Arc::new(HttpHealthProbe::new()),
    ));
    let handler = Arc::new(Handler::new(Arc::clone(&supervisor)));

    let tunnel_task = tunnel::spawn(
        config.hub.url.clone(),
        config.hub.agent_id.clone(),
        config.hub.token.clone(),
        Arc::clone(&handler),
    );

    // Crash recovery: periodically reconcile instance state with the
    // external processes.
    let sweep_task = (config.workers.sweep_interval_secs > 0).then(|| {
        let supervisor = Arc::clone(&supervisor);
        let period = Duration::from_secs(config.workers.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                supervisor.refresh_status().await;
            }
        })
    });

    // Wait for SIGINT / SIGTERM, then tear everything down.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    tunnel_task.abort();
    if let Some(task) = sweep_task {
        task.abort();
    }
    supervisor.stop_all().await;
    info!("Goodbye");
}
