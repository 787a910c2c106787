//! Direct-mode worker client.
//!
//! When no agent is registered but a fallback worker URL is configured, the
//! hub calls the worker's HTTP API itself for `session.list`,
//! `session.create`, and `prompt`. The worker surface is treated opaquely:
//! create returns JSON containing a `ses_…` id, list returns an array of
//! session descriptors, and a prompt reply is re-emitted as a finite stream
//! of text chunks.

use serde_json::{json, Value};
use std::time::Duration;

/// Errors from the worker HTTP API.
#[derive(Debug)]
pub enum WorkerError {
    /// Connection-level failure (refused, DNS, timeout).
    Unreachable(String),
    /// Non-2xx status with the response body.
    Status(u16, String),
    /// Body was not the expected JSON shape.
    Decode(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Unreachable(e) => write!(f, "worker unreachable: {e}"),
            WorkerError::Status(code, body) => write!(f, "worker returned status {code}: {body}"),
            WorkerError::Decode(e) => write!(f, "invalid worker response: {e}"),
        }
    }
}

/// HTTP client for a single worker instance.
pub struct WorkerProxy {
    base_url: String,
    http: reqwest::Client,
}

impl WorkerProxy {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// `GET /global/health` — 2xx means the worker is ready.
    pub async fn health(&self) -> Result<(), WorkerError> {
        let resp = self
            .http
            .get(format!("{}/global/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(WorkerError::Status(resp.status().as_u16(), String::new()))
        }
    }

    /// `GET /session` — list session descriptors.
    pub async fn list_sessions(&self) -> Result<Value, WorkerError> {
        let resp = self
            .http
            .get(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        decode_json(resp).await
    }

    /// `POST /session` — create a session, returns JSON containing `id`.
    pub async fn create_session(&self, title: &str) -> Result<Value, WorkerError> {
        let resp = self
            .http
            .post(format!("{}/session", self.base_url))
            .json(&json!({ "title": title }))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        decode_json(resp).await
    }

    /// `POST /session/{id}/message` — send a prompt and return the reply as
    /// a finite sequence of `{"text": …}` chunks.
    pub async fn prompt(&self, session_id: &str, content: &str) -> Result<Vec<Value>, WorkerError> {
        let body = json!({
            "parts": [{ "type": "text", "text": content }],
        });
        let resp = self
            .http
            .post(format!("{}/session/{}/message", self.base_url, session_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        let reply = decode_json(resp).await?;
        Ok(text_chunks(&reply))
    }
}

async fn decode_json(resp: reqwest::Response) -> Result<Value, WorkerError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(WorkerError::Status(status.as_u16(), body));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| WorkerError::Decode(e.to_string()))
}

/// Extract the non-empty text parts of a worker reply as stream chunks.
pub fn text_chunks(reply: &Value) -> Vec<Value> {
    reply["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p["type"] == "text")
                .filter_map(|p| p["text"].as_str())
                .filter(|t| !t.is_empty())
                .map(|t| json!({ "text": t }))
                .collect()
        })
        .unwrap_or_default()
}
