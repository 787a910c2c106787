//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TETHER_HUB_URL`, `TETHER_AGENT_ID`,
//!    `TETHER_AGENT_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `agent.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [hub]
//! url = "ws://hub.example.com:8080/agent"
//! agent_id = "dev1"
//! token = "agent-secret"
//!
//! [workers]
//! allowed_paths = ["/home/dev/projects/app"]
//! port_min = 4096
//! port_max = 4105
//! max_instances = 5
//! health_timeout_secs = 30
//! launcher = "process"          # process | docker | tmux
//! command = "opencode"
//! docker_image = "tether/worker:latest"
//! sweep_interval_secs = 60      # 0 disables the crash-recovery sweep
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level agent configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection to the hub's agent endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Hub agent WebSocket URL (default `ws://localhost:8080/agent`).
    #[serde(default = "default_hub_url")]
    pub url: String,
    /// Agent id sent in the registration frame. Defaults to `$HOSTNAME`,
    /// falling back to `dev-agent`.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Registration token. Must match the hub's agent token.
    #[serde(default)]
    pub token: String,
}

/// Worker supervisor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Project paths workers may be started for. Requests outside this list
    /// are rejected.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Lowest port in the worker port pool (default 4096).
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    /// Highest port in the worker port pool (default 4105).
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Hard ceiling on concurrently running workers (default 5).
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Worker startup health-probe deadline in seconds (default 30).
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Launch method: `process`, `docker`, or `tmux` (default `process`).
    #[serde(default = "default_launcher")]
    pub launcher: String,
    /// Worker binary for the process and tmux launchers (default `opencode`).
    #[serde(default = "default_command")]
    pub command: String,
    /// Image for the docker launcher.
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    /// Crash-recovery sweep interval in seconds; 0 disables it (default 60).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_hub_url() -> String {
    "ws://localhost:8080/agent".to_string()
}
fn default_agent_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "dev-agent".to_string())
}
fn default_port_min() -> u16 {
    4096
}
fn default_port_max() -> u16 {
    4105
}
fn default_max_instances() -> usize {
    5
}
fn default_health_timeout() -> u64 {
    30
}
fn default_launcher() -> String {
    "process".to_string()
}
fn default_command() -> String {
    "opencode".to_string()
}
fn default_docker_image() -> String {
    "tether/worker:latest".to_string()
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            agent_id: default_agent_id(),
            token: String::new(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            max_instances: default_max_instances(),
            health_timeout_secs: default_health_timeout(),
            launcher: default_launcher(),
            command: default_command(),
            docker_image: default_docker_image(),
            sweep_interval_secs: default_sweep_interval(),
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
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `agent.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("agent.toml").exists() {
            let content = std::fs::read_to_string("agent.toml").expect("Failed to read agent.toml");
            toml::from_str(&content).expect("Failed to parse agent.toml")
        } else {
            Config {
                hub: HubConfig::default(),
                workers: WorkersConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(url) = std::env::var("TETHER_HUB_URL") {
            config.hub.url = url;
        }
        if let Ok(id) = std::env::var("TETHER_AGENT_ID") {
            config.hub.agent_id = id;
        }
        if let Ok(token) = std::env::var("TETHER_AGENT_TOKEN") {
            config.hub.token = token;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config: Config = toml::from_str("").expect("empty config parses");
        assert_eq!(config.hub.url, "ws://localhost:8080/agent");
        assert_eq!(config.workers.port_min, 4096);
        assert_eq!(config.workers.port_max, 4105);
        assert_eq!(config.workers.max_instances, 5);
        assert_eq!(config.workers.launcher, "process");
        assert!(config.workers.allowed_paths.is_empty());
    }

    #[test]
    fn workers_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [workers]
            allowed_paths = ["/p", "/q"]
            port_min = 5000
            port_max = 5001
            max_instances = 2
            launcher = "tmux"
            "#,
        )
        .expect("workers config parses");
        assert_eq!(config.workers.allowed_paths, vec!["/p", "/q"]);
        assert_eq!(config.workers.port_min, 5000);
        assert_eq!(config.workers.port_max, 5001);
        assert_eq!(config.workers.max_instances, 2);
        assert_eq!(config.workers.launcher, "tmux");
        // Untouched sections keep their defaults.
        assert_eq!(config.workers.health_timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
    }
}
