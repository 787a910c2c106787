//! Worker health probing.
//!
//! One probe serves two purposes: gating startup (poll until the worker
//! answers) and vetting pool ports (a port that answers the health endpoint
//! is occupied by some other worker and must be skipped). Probing goes
//! through a shared HTTP client; no short-lived child processes per probe.

use std::time::Duration;

use async_trait::async_trait;

/// Answers "does something healthy listen on this local port?".
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn healthy(&self, port: u16) -> bool;
}

/// Probes `http://localhost:{port}/global/health` with a short timeout.
pub struct HttpHealthProbe {
    http: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn healthy(&self, port: u16) -> bool {
        let url = format!("http://localhost:{port}/global/health");
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
