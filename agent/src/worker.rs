//! HTTP client for a worker's session API.
//!
//! The worker surface is treated opaquely: JSON in, JSON out. The only
//! shapes relied upon are that create returns an object with a `ses_…` `id`,
//! list returns an array, and a prompt reply carries `parts` whose text
//! entries become the streamed chunks.

use serde_json::{json, Value};

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

/// Client for one worker instance. Cheap to construct per request; the
/// underlying HTTP client is shared.
pub struct WorkerClient {
    base_url: String,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// `POST /session` — create a session; the reply carries the `ses_…` id.
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

    /// `GET /session` — array of session descriptors.
    pub async fn list_sessions(&self) -> Result<Value, WorkerError> {
        let resp = self
            .http
            .get(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        decode_json(resp).await
    }

    /// `GET /session/{id}/message` — message history for a session.
    pub async fn session_messages(&self, session_id: &str) -> Result<Value, WorkerError> {
        let resp = self
            .http
            .get(format!("{}/session/{}/message", self.base_url, session_id))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        decode_json(resp).await
    }

    /// `DELETE /session/{id}` — idempotent on a known id.
    pub async fn delete_session(&self, session_id: &str) -> Result<Value, WorkerError> {
        let resp = self
            .http
            .delete(format!("{}/session/{}", self.base_url, session_id))
            .send()
            .await
            .map_err(|e| WorkerError::Unreachable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WorkerError::Status(status.as_u16(), body));
        }
        // Delete bodies vary; normalize to a small confirmation object.
        Ok(resp
            .json::<Value>()
            .await
            .unwrap_or_else(|_| json!({ "deleted": true, "id": session_id })))
    }

    /// `POST /session/{id}/message` — send a prompt and return the reply as
    /// a finite sequence of `{"text": …}` chunks, in reply order.
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
