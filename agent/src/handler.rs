//! Request dispatch: tunnel requests → supervisor or worker.
//!
//! Every `agent.request` lands here. `project.*` actions go to the
//! supervisor directly; everything else resolves a project path (explicit
//! `projectPath`, or the recorded session → path binding) and talks to that
//! project's worker over HTTP, auto-starting it when needed.
//!
//! Each handled request yields a bounded channel of payload chunks. The
//! tunnel client forwards every chunk as an `agent.stream` frame in order
//! and terminates with `agent.stream.end`; request-level failures (bad
//! payload, unknown session) are returned as errors and become a single
//! `agent.error` frame. Failures from the worker mid-request are emitted as
//! an `{"error": …}` chunk so the stream still terminates normally.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::supervisor::WorkerSupervisor;
use crate::tunnel::RequestPayload;
use crate::worker::WorkerClient;

/// Chunks queued per in-flight request.
const CHUNK_QUEUE: usize = 100;

/// Request-level failures, sent back as `agent.error`.
#[derive(Debug)]
pub enum HandlerError {
    /// The request payload was missing a required field.
    InvalidRequest(String),
    /// A session-scoped request without a resolvable project.
    UnknownSession(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::InvalidRequest(what) => write!(f, "invalid request: {what}"),
            HandlerError::UnknownSession(id) => {
                write!(f, "no project known for session {id}; create the session first")
            }
        }
    }
}

/// Stateful dispatcher shared by all request tasks.
pub struct Handler {
    supervisor: Arc<WorkerSupervisor>,
    http: reqwest::Client,
    /// session id → project path, recorded at session.create and whenever a
    /// request carries an explicit projectPath. The wire protocol only
    /// carries the directory at create time, so routing of later prompts
    /// depends on this map.
    bindings: RwLock<HashMap<String, String>>,
}

impl Handler {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self {
            supervisor,
            http: reqwest::Client::new(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Handle one request, returning its chunk stream.
    pub async fn handle(
        self: &Arc<Self>,
        req: RequestPayload,
    ) -> Result<mpsc::Receiver<Value>, HandlerError> {
        match req.action.as_str() {
            "project.list" => Ok(self.project_list().await),
            "project.start" => self.project_start(&req.data).await,
            "project.stop" => self.project_stop(&req.data).await,
            "session.create" => self.session_create(req).await,
            "session.list" => Ok(self.session_list(req).await),
            "session.messages" => self.session_scoped(req, SessionOp::Messages),
            "session.delete" => self.session_scoped(req, SessionOp::Delete),
            "prompt" => self.session_scoped(req, SessionOp::Prompt),
            other => Err(HandlerError::InvalidRequest(format!(
                "unknown action: {other}"
            ))),
        }
    }

    /// Record which project a session belongs to.
    pub fn bind_session(&self, session_id: &str, path: &str) {
        if session_id.is_empty() || path.is_empty() {
            return;
        }
        self.bindings
            .write()
            .expect("bindings lock poisoned")
            .insert(session_id.to_string(), path.to_string());
    }

    fn bound_path(&self, session_id: &str) -> Option<String> {
        self.bindings
            .read()
            .expect("bindings lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Resolve the project path for a session-scoped request: explicit
    /// `projectPath` wins (and refreshes the binding), else the binding map.
    fn resolve_path(&self, req: &RequestPayload) -> Result<String, HandlerError> {
        if let Some(path) = req.project_path.as_deref().filter(|p| !p.is_empty()) {
            self.bind_session(&req.session_id, path);
            return Ok(path.to_string());
        }
        self.bound_path(&req.session_id)
            .ok_or_else(|| HandlerError::UnknownSession(req.session_id.clone()))
    }

    async fn project_list(self: &Arc<Self>) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            let projects = supervisor.list().await;
            let _ = tx.send(json!({ "projects": projects })).await;
        });
        rx
    }

    async fn project_start(
        self: &Arc<Self>,
        data: &Value,
    ) -> Result<mpsc::Receiver<Value>, HandlerError> {
        let path = required_path(data)?;
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            let chunk = match supervisor.start(&path).await {
                Ok(inst) => json!({
                    "path": inst.path,
                    "name": inst.name,
                    "status": inst.status,
                    "port": inst.port,
                }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            let _ = tx.send(chunk).await;
        });
        Ok(rx)
    }

    async fn project_stop(
        self: &Arc<Self>,
        data: &Value,
    ) -> Result<mpsc::Receiver<Value>, HandlerError> {
        let path = required_path(data)?;
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            let chunk = match supervisor.stop(&path).await {
                Ok(()) => json!({ "success": true, "path": path }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            let _ = tx.send(chunk).await;
        });
        Ok(rx)
    }

    async fn session_create(
        self: &Arc<Self>,
        req: RequestPayload,
    ) -> Result<mpsc::Receiver<Value>, HandlerError> {
        let path = req
            .project_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                HandlerError::InvalidRequest("session.create requires a project directory".into())
            })?
            .to_string();
        let title = req.data["title"].as_str().unwrap_or_default().to_string();

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let chunk = match this.worker_for(&path).await {
                Ok(worker) => match worker.create_session(&title).await {
                    Ok(session) => {
                        if let Some(id) = session["id"].as_str() {
                            this.bind_session(id, &path);
                        }
                        session
                    }
                    Err(e) => json!({ "error": e.to_string() }),
                },
                Err(e) => json!({ "error": e }),
            };
            let _ = tx.send(chunk).await;
        });
        Ok(rx)
    }

    /// List sessions. With an explicit path, asks that project's worker;
    /// without one, merges the session lists of every running worker.
    async fn session_list(self: &Arc<Self>, req: RequestPayload) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let chunk = if let Some(path) = req.project_path.as_deref().filter(|p| !p.is_empty()) {
                match this.worker_for(path).await {
                    Ok(worker) => worker
                        .list_sessions()
                        .await
                        .unwrap_or_else(|e| json!({ "error": e.to_string() })),
                    Err(e) => json!({ "error": e }),
                }
            } else {
                this.merged_session_list().await
            };
            let _ = tx.send(chunk).await;
        });
        rx
    }

    async fn merged_session_list(&self) -> Value {
        let mut merged = Vec::new();
        for path in self.supervisor.running_paths().await {
            let Ok(url) = self.supervisor.worker_url(&path).await else {
                continue;
            };
            let worker = WorkerClient::new(&url, self.http.clone());
            match worker.list_sessions().await {
                Ok(Value::Array(sessions)) => merged.extend(sessions),
                Ok(other) => warn!(path = %path, "Unexpected session list shape: {other}"),
                Err(e) => warn!(path = %path, "Session list failed: {e}"),
            }
        }
        Value::Array(merged)
    }

    /// Worker-directed operations that need a resolved session → project
    /// route.
    fn session_scoped(
        self: &Arc<Self>,
        req: RequestPayload,
        op: SessionOp,
    ) -> Result<mpsc::Receiver<Value>, HandlerError> {
        if req.session_id.is_empty() {
            return Err(HandlerError::InvalidRequest("missing sessionId".into()));
        }
        let path = self.resolve_path(&req)?;

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let worker = match this.worker_for(&path).await {
                Ok(w) => w,
                Err(e) => {
                    let _ = tx.send(json!({ "error": e })).await;
                    return;
                }
            };

            match op {
                SessionOp::Messages => {
                    let chunk = worker
                        .session_messages(&req.session_id)
                        .await
                        .unwrap_or_else(|e| json!({ "error": e.to_string() }));
                    let _ = tx.send(chunk).await;
                }
                SessionOp::Delete => {
                    let chunk = match worker.delete_session(&req.session_id).await {
                        Ok(v) => v,
                        Err(e) => json!({ "error": e.to_string() }),
                    };
                    let _ = tx.send(chunk).await;
                }
                SessionOp::Prompt => {
                    let content = req.data["content"].as_str().unwrap_or_default();
                    match worker.prompt(&req.session_id, content).await {
                        Ok(chunks) => {
                            for chunk in chunks {
                                // Blocking send: chunks for one request are
                                // emitted in order and never dropped.
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(json!({ "error": e.to_string() })).await;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Resolve a project path to a live worker client, auto-starting the
    /// worker when necessary. Errors are strings destined for error chunks.
    async fn worker_for(&self, path: &str) -> Result<WorkerClient, String> {
        let url = self
            .supervisor
            .get_or_start_url(path)
            .await
            .map_err(|e| e.to_string())?;
        Ok(WorkerClient::new(&url, self.http.clone()))
    }
}

enum SessionOp {
    Messages,
    Delete,
    Prompt,
}

fn required_path(data: &Value) -> Result<String, HandlerError> {
    data["path"]
        .as_str()
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| HandlerError::InvalidRequest("missing path".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::launcher::{LaunchError, WorkerLauncher};
    use crate::supervisor::probe::HealthProbe;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopLauncher;

    #[async_trait]
    impl WorkerLauncher for NoopLauncher {
        async fn start(&self, _: &str, _: &str, _: u16) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn is_running(&self, _: &str) -> bool {
            false
        }
    }

    struct NeverHealthy;

    #[async_trait]
    impl HealthProbe for NeverHealthy {
        async fn healthy(&self, _: u16) -> bool {
            false
        }
    }

    fn handler() -> Arc<Handler> {
        let supervisor = Arc::new(WorkerSupervisor::new(
            vec!["/p".to_string()],
            4096,
            4097,
            2,
            Duration::from_millis(20),
            Arc::new(NoopLauncher),
            Arc::new(NeverHealthy),
        ));
        Arc::new(Handler::new(supervisor))
    }

    fn req(action: &str, session_id: &str, data: Value, project_path: Option<&str>) -> RequestPayload {
        RequestPayload {
            session_id: session_id.to_string(),
            action: action.to_string(),
            data,
            project_path: project_path.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let h = handler();
        let err = h
            .handle(req("teleport", "", Value::Null, None))
            .await
            .expect_err("unknown action");
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn project_start_requires_path() {
        let h = handler();
        let err = h
            .handle(req("project.start", "", json!({}), None))
            .await
            .expect_err("missing path");
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn project_list_returns_roster_chunk() {
        let h = handler();
        let mut rx = h
            .handle(req("project.list", "", Value::Null, None))
            .await
            .expect("project.list dispatches");
        let chunk = rx.recv().await.expect("one chunk");
        let projects = chunk["projects"].as_array().expect("projects array");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0]["path"], "/p");
        assert_eq!(projects[0]["status"], "stopped");
        // The stream terminates after the single chunk.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn project_start_outside_whitelist_is_an_error_chunk() {
        let h = handler();
        let mut rx = h
            .handle(req("project.start", "", json!({"path": "/r"}), None))
            .await
            .expect("dispatches");
        let chunk = rx.recv().await.expect("error chunk");
        assert!(chunk["error"]
            .as_str()
            .expect("error string")
            .contains("whitelist"));
    }

    #[tokio::test]
    async fn prompt_without_binding_is_unknown_session() {
        let h = handler();
        let err = h
            .handle(req("prompt", "ses_abc", json!({"content": "hi"}), None))
            .await
            .expect_err("no binding recorded");
        assert!(matches!(err, HandlerError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn explicit_project_path_records_binding() {
        let h = handler();
        // The worker can't actually start (probe never healthy), but the
        // binding must be recorded before the worker is contacted.
        let mut rx = h
            .handle(req("prompt", "ses_abc", json!({"content": "hi"}), Some("/p")))
            .await
            .expect("path resolves");
        assert_eq!(h.bound_path("ses_abc").as_deref(), Some("/p"));
        // The failed worker start surfaces as an error chunk, not a hang.
        let chunk = rx.recv().await.expect("error chunk");
        assert!(chunk.get("error").is_some());
    }

    #[tokio::test]
    async fn session_scoped_requires_session_id() {
        let h = handler();
        let err = h
            .handle(req("session.messages", "", Value::Null, None))
            .await
            .expect_err("missing session id");
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn session_create_requires_directory() {
        let h = handler();
        let err = h
            .handle(req("session.create", "", json!({"title": "T"}), None))
            .await
            .expect_err("missing directory");
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn session_list_without_running_workers_is_empty_array() {
        let h = handler();
        let mut rx = h
            .handle(req("session.list", "", Value::Null, None))
            .await
            .expect("dispatches");
        let chunk = rx.recv().await.expect("one chunk");
        assert_eq!(chunk, json!([]));
    }
}
