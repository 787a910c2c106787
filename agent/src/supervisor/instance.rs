//! Worker instance state.

use serde::Serialize;

/// Lifecycle status of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-project worker, owned by the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInstance {
    /// Absolute project path (the routing key).
    pub path: String,
    /// Display name, derived from the project basename.
    pub name: String,
    /// Assigned port; 0 when not running.
    pub port: u16,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds when the worker reached `running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Unix milliseconds when the worker last served a request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
}

impl WorkerInstance {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: basename(path),
            port: 0,
            status: WorkerStatus::Stopped,
            error: None,
            started_at: None,
            last_used: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// Base URL of the worker's HTTP API, only meaningful while running.
    pub fn worker_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Reset to the stopped state, clearing port, error, and timestamps.
    pub fn reset(&mut self) {
        self.status = WorkerStatus::Stopped;
        self.port = 0;
        self.error = None;
        self.started_at = None;
    }
}

/// Final component of a path, used for instance display names.
pub fn basename(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
