#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # tether-hub
//!
//! Cloud hub for the tether remote-coding gateway.
//!
//! The hub exposes two WebSocket endpoints on one listener: `/ws` for phone
//! and browser clients and `/agent` for reverse-tunnel agents running on
//! developer machines. Client requests are multiplexed onto the agent link
//! and the agent's incremental responses are streamed back; every
//! client-visible stream frame is also written to a per-session replay
//! buffer so a reconnecting client can gap-fill with `sync`/`ack`.
//!
//! ## Endpoints
//!
//! | Method | Path      | Auth            | Description                      |
//! |--------|-----------|-----------------|----------------------------------|
//! | GET    | `/ws`     | `?token=`       | Client WebSocket                 |
//! | GET    | `/agent`  | register frame  | Agent reverse-tunnel WebSocket   |
//! | GET    | `/health` | No              | Liveness probe                   |
//! | GET    | `/agents` | No              | Registered agent ids             |
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap CLI, router setup, graceful shutdown
//! state.rs       — process-wide root shared by every connection
//! config.rs      — TOML + env-var configuration
//! auth.rs        — constant-time token comparison
//! ws/mod.rs      — client endpoint: frame dispatch, fan-out, sync/ack
//! tunnel/
//!   mod.rs       — tunnel protocol frames
//!   manager.rs   — agent registry, displacement, request forwarding
//! buffer/
//!   mod.rs       — ReplayBuffer trait, no-op implementation
//!   memory.rs    — concurrent TTL'd in-process implementation
//! proxy.rs       — direct-mode worker client (fallback when no agent)
//! ```

mod auth;
mod buffer;
mod config;
mod proxy;
mod state;
mod tunnel;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use buffer::memory::MemoryBuffer;
use buffer::{NoopBuffer, ReplayBuffer};
use config::Config;
use state::AppState;

/// How often expired replay-buffer sessions are evicted.
const BUFFER_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Cloud hub for the tether remote-coding gateway.
#[derive(Parser)]
#[command(name = "tether-hub", version)]
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

    info!("tether-hub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.client_token.is_empty() {
        warn!("Client authentication disabled — set TETHER_CLIENT_TOKEN or [auth] client_token");
    }
    if config.auth.agent_token.is_empty() {
        warn!("Agent authentication disabled — set TETHER_AGENT_TOKEN or [auth] agent_token");
    }

    // Replay buffer: concurrent in-process store, or a no-op when disabled.
    // With the no-op the gateway still works end to end; reconnecting
    // clients just can't gap-fill.
    let memory_buffer = config.buffer.enabled.then(|| {
        Arc::new(MemoryBuffer::new(
            Duration::from_secs(config.buffer.ttl_secs),
            config.buffer.max_count,
        ))
    });
    let buffer: Arc<dyn ReplayBuffer> = match &memory_buffer {
        Some(b) => {
            info!(
                "Replay buffer enabled (ttl {}s, max {} entries/session)",
                config.buffer.ttl_secs, config.buffer.max_count
            );
            Arc::clone(b) as Arc<dyn ReplayBuffer>
        }
        None => {
            info!("Replay buffer disabled (no gap-fill for reconnecting clients)");
            Arc::new(NoopBuffer)
        }
    };

    if let Some(f) = &config.fallback {
        info!("Direct fallback worker: {}", f.worker_url);
    }

    let state = AppState::new(config, buffer);

    let app = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/agent", get(tunnel::manager::agent_ws))
        .route(
            "/health",
            get({
                let state = state.clone();
                move || async move {
                    Json(json!({
                        "status": "ok",
                        "uptime_secs": state.start_time.elapsed().as_secs(),
                        "clients": state.client_count.load(std::sync::atomic::Ordering::Relaxed),
                    }))
                }
            }),
        )
        .route(
            "/agents",
            get({
                let state = state.clone();
                move || async move {
                    let agents: Vec<_> = state
                        .tunnel
                        .agents()
                        .iter()
                        .map(|a| {
                            json!({
                                "id": a.id,
                                "version": a.version,
                                "capabilities": a.capabilities,
                                "lastSeenSecs": a.last_seen().elapsed().as_secs(),
                            })
                        })
                        .collect();
                    Json(json!({ "agents": agents }))
                }
            }),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Hub ready");

    // Periodic sweep: drop replay sessions whose TTL elapsed.
    let sweep_task = memory_buffer.map(|buf| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUFFER_SWEEP_PERIOD);
            loop {
                interval.tick().await;
                let evicted = buf.sweep();
                if evicted > 0 {
                    info!("Replay buffer sweep evicted {evicted} expired sessions");
                }
            }
        })
    });

    // Graceful shutdown on SIGINT / SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    if let Some(task) = sweep_task {
        task.abort();
    }
    info!("Goodbye");
}
