//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TETHER_LISTEN`, `TETHER_CLIENT_TOKEN`,
//!    `TETHER_AGENT_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `hub.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! client_token = "client-secret"   # empty disables client auth
//! agent_token = "agent-secret"     # empty disables agent auth
//!
//! [buffer]
//! enabled = true
//! ttl_secs = 300
//! max_count = 100
//!
//! # Optional — omit entirely to disable direct fallback
//! [fallback]
//! worker_url = "http://localhost:4096"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level hub configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Optional direct-mode fallback when no agent is registered.
    pub fallback: Option<FallbackConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listen address for both WebSocket endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`). Clients connect to
    /// `/ws`, agents to `/agent`.
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Pre-shared tokens. An empty token disables auth for that endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Required `?token=` query parameter on the client endpoint.
    #[serde(default)]
    pub client_token: String,
    /// Required token inside the agent registration frame.
    #[serde(default)]
    pub agent_token: String,
}

/// Replay buffer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Enable the replay buffer. When false a no-op implementation is used
    /// and reconnecting clients cannot gap-fill.
    #[serde(default)]
    pub enabled: bool,
    /// Per-session retention TTL in seconds (default 300).
    #[serde(default = "default_buffer_ttl")]
    pub ttl_secs: u64,
    /// Newest entries kept per session (default 100).
    #[serde(default = "default_buffer_max_count")]
    pub max_count: usize,
}

/// Direct-mode fallback: a worker the hub can call itself when no agent is
/// registered. Covers `session.list`, `session.create`, and `prompt` only.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    /// Base URL of the worker HTTP API (e.g. `http://localhost:4096`).
    pub worker_url: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_buffer_ttl() -> u64 {
    300
}
fn default_buffer_max_count() -> usize {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_buffer_ttl(),
            max_count: default_buffer_max_count(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `hub.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("hub.toml").exists() {
            let content = std::fs::read_to_string("hub.toml").expect("Failed to read hub.toml");
            toml::from_str(&content).expect("Failed to parse hub.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                buffer: BufferConfig::default(),
                fallback: None,
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("TETHER_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(token) = std::env::var("TETHER_CLIENT_TOKEN") {
            config.auth.client_token = token;
        }
        if let Ok(token) = std::env::var("TETHER_AGENT_TOKEN") {
            config.auth.agent_token = token;
        }

        config
    }
}
