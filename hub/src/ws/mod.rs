//! Client-facing WebSocket transport.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws?token=<client_token>` — the token is
//!    validated in constant time before the upgrade completes.
//! 2. All messages are JSON objects with a `"type"` field and an optional
//!    `"id"` correlation field echoed on the corresponding response(s).
//! 3. Outgoing frames are funneled through a bounded mpsc channel so request
//!    tasks can send without holding the socket; on overflow the newest frame
//!    is dropped and the client reconciles via `sync`.
//!
//! ## Message types (client → hub)
//!
//! | Type               | Payload fields            | Handled            |
//! |--------------------|---------------------------|--------------------|
//! | `ping`             | —                         | locally            |
//! | `session.list`     | —                         | agent or fallback  |
//! | `session.create`   | `title`, `directory`      | agent or fallback  |
//! | `session.messages` | `sessionId`               | agent              |
//! | `session.delete`   | `sessionId`               | agent              |
//! | `prompt`           | `sessionId`, `content`    | agent or fallback, streamed + buffered |
//! | `project.list`     | —                         | agent              |
//! | `project.start`    | `path`                    | agent              |
//! | `project.stop`     | `path`                    | agent              |
//! | `sync`             | `sessionId`, `lastAckId`  | locally (replay buffer) |
//! | `ack`              | `msgId`                   | locally            |
//!
//! ## Message types (hub → client)
//!
//! `pong`, `response`, `stream` (with `msgId`), `stream.end` (with `msgId`),
//! `sync.batch`, `error`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::buffer::BufferedMessage;
use crate::state::AppState;
use crate::tunnel::{RequestPayload, MSG_ERROR, MSG_STREAM, MSG_STREAM_END};

/// Maximum inbound message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Outbound frames queued per client connection; overflow drops the newest.
const OUTBOUND_QUEUE: usize = 256;

/// Deadline for list/create/delete/messages forwards.
const FORWARD_WAIT: Duration = Duration::from_secs(10);
/// Deadline for `project.*` forwards (worker startup can take a while).
const PROJECT_WAIT: Duration = Duration::from_secs(30);

/// A frame received from a client.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    payload: Value,
}

/// Session-scoped payload fields shared by several frame types.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    directory: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptPayload {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    last_ack_id: i64,
}

/// Per-connection state shared between the reader and request tasks.
struct Conn {
    state: AppState,
    tx: mpsc::Sender<Value>,
    /// Current-session hint used when a payload omits `sessionId`.
    session_hint: Mutex<String>,
    /// Highest message id the client acknowledged (non-decreasing).
    last_ack_id: AtomicI64,
}

impl Conn {
    /// Enqueue a frame, dropping the newest on overflow.
    fn send(&self, frame: Value) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(frame) {
            warn!("Client send buffer full, dropping message");
        }
    }

    fn send_error(&self, request_id: &str, message: &str) {
        self.send(server_frame("error", request_id, None, json!({ "error": message })));
    }

    fn session_hint(&self) -> String {
        self.session_hint.lock().expect("hint lock poisoned").clone()
    }

    fn set_session_hint(&self, session_id: &str) {
        *self.session_hint.lock().expect("hint lock poisoned") = session_id.to_string();
    }
}

/// Build an outbound frame. `msg_id` of 0 is omitted on the wire.
fn server_frame(kind: &str, id: &str, msg_id: Option<i64>, payload: Value) -> Value {
    let mut frame = json!({ "type": kind, "payload": payload });
    if !id.is_empty() {
        frame["id"] = json!(id);
    }
    if let Some(m) = msg_id.filter(|m| *m != 0) {
        frame["msgId"] = json!(m);
    }
    frame
}

/// A session id is `ses_` followed by one or more alphanumerics.
fn valid_session_id(id: &str) -> bool {
    id.strip_prefix("ses_")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_alphanumeric()))
}

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Token passed as a query parameter (headers aren't available during a
    /// browser WebSocket upgrade).
    #[serde(default)]
    pub token: String,
}

/// `GET /ws?token=<key>` — client WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::token_ok(&state.config.auth.client_token, &query.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main client event loop: one writer task draining the outbound queue, the
/// reader loop dispatching frames. Forwarded requests run in their own tasks
/// so a long-running stream never blocks the reader.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE);

    let live = state.client_count.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Client connected ({live} live)");

    let conn = Arc::new(Conn {
        state,
        tx,
        session_hint: Mutex::new(String::new()),
        last_ack_id: AtomicI64::new(0),
    });

    // Writer: serialize queued frames, ping on a ticker, bounded write waits.
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_PERIOD);
        ticker.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("Failed to serialize client frame: {e}");
                            continue;
                        }
                    };
                    match tokio::time::timeout(WRITE_WAIT, ws_sink.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = ticker.tick() => {
                    match tokio::time::timeout(WRITE_WAIT, ws_sink.send(Message::Ping(Vec::new().into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    // Reader: the deadline restarts on every inbound frame, pongs included.
    loop {
        let msg = match tokio::time::timeout(PONG_WAIT, ws_stream.next()).await {
            Ok(Some(Ok(m))) => m,
            Ok(Some(Err(e))) => {
                warn!("Client read error: {e}");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Client read timeout (no pong)");
                break;
            }
        };

        match msg {
            Message::Text(text) => dispatch(&conn, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    conn.state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!("Client disconnected");
}

/// Dispatch one inbound frame. Local operations run inline; anything that
/// talks to an agent or worker is spawned so the reader keeps draining.
fn dispatch(conn: &Arc<Conn>, text: &str) {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        conn.send_error("", "Invalid message format");
        return;
    };

    match frame.kind.as_str() {
        "ping" => {
            conn.send(server_frame("pong", &frame.id, None, Value::Null));
        }
        "session.list" => {
            let conn = Arc::clone(conn);
            tokio::spawn(async move { handle_session_list(&conn, &frame.id).await });
        }
        "session.create" => {
            let Ok(payload) = serde_json::from_value::<SessionPayload>(frame.payload) else {
                conn.send_error(&frame.id, "Invalid payload format");
                return;
            };
            let conn = Arc::clone(conn);
            tokio::spawn(async move { handle_session_create(&conn, &frame.id, &payload).await });
        }
        "session.messages" => {
            let Ok(payload) = serde_json::from_value::<SessionPayload>(frame.payload) else {
                conn.send_error(&frame.id, "Invalid payload format");
                return;
            };
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                handle_session_messages(&conn, &frame.id, &payload.session_id).await;
            });
        }
        "session.delete" => {
            let Ok(payload) = serde_json::from_value::<SessionPayload>(frame.payload) else {
                conn.send_error(&frame.id, "Invalid payload format");
                return;
            };
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                handle_session_delete(&conn, &frame.id, &payload.session_id).await;
            });
        }
        "prompt" => {
            let Ok(payload) = serde_json::from_value::<PromptPayload>(frame.payload) else {
                conn.send_error(&frame.id, "Invalid payload format");
                return;
            };
            let conn = Arc::clone(conn);
            tokio::spawn(async move { handle_prompt(&conn, &frame.id, payload).await });
        }
        "project.list" | "project.start" | "project.stop" => {
            let conn = Arc::clone(conn);
            let action = frame.kind.clone();
            tokio::spawn(async move {
                handle_project(&conn, &frame.id, &action, frame.payload).await;
            });
        }
        "sync" => {
            let Ok(payload) = serde_json::from_value::<SyncPayload>(frame.payload) else {
                conn.send_error(&frame.id, "Invalid payload format");
                return;
            };
            handle_sync(conn, &frame.id, &payload);
        }
        "ack" => {
            if let Some(msg_id) = frame.payload["msgId"].as_i64() {
                conn.last_ack_id.fetch_max(msg_id, Ordering::Relaxed);
            }
        }
        other => {
            conn.send_error(&frame.id, &format!("Unknown message type: {other}"));
        }
    }
}

const NO_AGENT: &str =
    "No agent connected. Please start the tether agent on your development server.";

async fn handle_session_list(conn: &Conn, request_id: &str) {
    if let Some(agent) = conn.state.tunnel.get_any() {
        forward_once(conn, request_id, &agent.id, "session.list", None, Value::Null, FORWARD_WAIT)
            .await;
        return;
    }

    // Direct mode fallback.
    let Some(proxy) = &conn.state.fallback else {
        conn.send_error(request_id, NO_AGENT);
        return;
    };
    if proxy.health().await.is_err() {
        conn.send_error(
            request_id,
            "No agent connected and the fallback worker is not available. Please start an agent or ensure the worker is running locally.",
        );
        return;
    }
    match proxy.list_sessions().await {
        Ok(sessions) => conn.send(server_frame("response", request_id, None, sessions)),
        Err(e) => conn.send_error(request_id, &format!("Failed to list sessions: {e}")),
    }
}

async fn handle_session_create(conn: &Conn, request_id: &str, payload: &SessionPayload) {
    if let Some(agent) = conn.state.tunnel.get_any() {
        let data = json!({ "title": payload.title, "directory": payload.directory });
        let project_path =
            (!payload.directory.is_empty()).then(|| payload.directory.clone());
        forward_once(
            conn,
            request_id,
            &agent.id,
            "session.create",
            project_path,
            data,
            FORWARD_WAIT,
        )
        .await;
        return;
    }

    let Some(proxy) = &conn.state.fallback else {
        conn.send_error(request_id, NO_AGENT);
        return;
    };
    if proxy.health().await.is_err() {
        conn.send_error(request_id, NO_AGENT);
        return;
    }
    match proxy.create_session(&payload.title).await {
        Ok(session) => {
            if let Some(id) = session["id"].as_str() {
                conn.set_session_hint(id);
            }
            conn.send(server_frame("response", request_id, None, session));
        }
        Err(e) => conn.send_error(request_id, &format!("Failed to create session: {e}")),
    }
}

async fn handle_session_messages(conn: &Conn, request_id: &str, session_id: &str) {
    let session_id = if session_id.is_empty() {
        conn.session_hint()
    } else {
        session_id.to_string()
    };
    if session_id.is_empty() {
        conn.send_error(request_id, "No session ID provided");
        return;
    }

    if let Some(agent) = conn.state.tunnel.get_any() {
        let data = json!({ "sessionId": session_id });
        forward_once(conn, request_id, &agent.id, "session.messages", None, data, PROJECT_WAIT)
            .await;
        return;
    }
    conn.send_error(request_id, NO_AGENT);
}

async fn handle_session_delete(conn: &Conn, request_id: &str, session_id: &str) {
    if session_id.is_empty() {
        conn.send_error(request_id, "No session ID provided");
        return;
    }

    if let Some(agent) = conn.state.tunnel.get_any() {
        let data = json!({ "sessionId": session_id });
        forward_once(conn, request_id, &agent.id, "session.delete", None, data, FORWARD_WAIT)
            .await;
        return;
    }
    conn.send_error(request_id, NO_AGENT);
}

async fn handle_project(conn: &Conn, request_id: &str, action: &str, payload: Value) {
    if let Some(agent) = conn.state.tunnel.get_any() {
        let wait = if action == "project.list" {
            FORWARD_WAIT
        } else {
            PROJECT_WAIT
        };
        forward_once(conn, request_id, &agent.id, action, None, payload, wait).await;
        return;
    }
    conn.send_error(request_id, NO_AGENT);
}

async fn handle_prompt(conn: &Conn, request_id: &str, payload: PromptPayload) {
    let session_id = if payload.session_id.is_empty() {
        conn.session_hint()
    } else {
        payload.session_id.clone()
    };
    if session_id.is_empty() {
        conn.send_error(request_id, "No session ID provided");
        return;
    }
    if !valid_session_id(&session_id) {
        conn.send_error(request_id, "Invalid session ID format");
        return;
    }

    if let Some(agent) = conn.state.tunnel.get_any() {
        let data = json!({ "content": payload.content });
        forward_stream(conn, request_id, &agent.id, &session_id, data).await;
        return;
    }

    // Direct mode fallback: the whole reply arrives at once; re-emit it as
    // the same buffered stream the agent path produces.
    let Some(proxy) = &conn.state.fallback else {
        conn.send_error(request_id, NO_AGENT);
        return;
    };
    match proxy.prompt(&session_id, &payload.content).await {
        Ok(chunks) => {
            for chunk in chunks {
                emit_stream(conn, request_id, &session_id, chunk);
            }
            emit_stream_end(conn, request_id, &session_id);
        }
        Err(e) => conn.send_error(request_id, &format!("Failed to send message: {e}")),
    }
}

fn handle_sync(conn: &Conn, request_id: &str, payload: &SyncPayload) {
    let session_id = if payload.session_id.is_empty() {
        conn.session_hint()
    } else {
        payload.session_id.clone()
    };

    let messages = conn.state.buffer.get_since(&session_id, payload.last_ack_id);
    let latest_id = conn.state.buffer.latest_id(&session_id);

    conn.send(server_frame(
        "sync.batch",
        request_id,
        None,
        json!({ "messages": messages, "latestId": latest_id }),
    ));
}

/// Forward a non-streaming request and relay the first reply.
///
/// Only the first frame on the response channel is consumed; a `stream` reply
/// is relabeled `response`. Non-streaming actions that produce multiple
/// frames lose all but the first.
async fn forward_once(
    conn: &Conn,
    request_id: &str,
    agent_id: &str,
    action: &str,
    project_path: Option<String>,
    data: Value,
    wait: Duration,
) {
    let session_id = data["sessionId"]
        .as_str()
        .map(ToString::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| conn.session_hint());

    let req = RequestPayload {
        session_id,
        action: action.to_string(),
        data,
        project_path,
    };
    let mut reply = match conn.state.tunnel.forward(agent_id, request_id, &req) {
        Ok(r) => r,
        Err(e) => {
            conn.send_error(request_id, &format!("Agent forward failed: {e}"));
            return;
        }
    };

    match tokio::time::timeout(wait, reply.recv()).await {
        Ok(Some(msg)) => {
            let payload = msg.payload.unwrap_or(Value::Null);
            if msg.kind == MSG_ERROR {
                conn.send(server_frame("error", request_id, None, payload));
            } else {
                conn.send(server_frame("response", request_id, None, payload));
            }
        }
        Ok(None) => conn.send_error(request_id, "Agent disconnected"),
        Err(_) => conn.send_error(request_id, "Request timeout"),
    }
    // `reply` drops here, deregistering the pending request.
}

/// Forward a streaming request (`prompt`), buffering every client-visible
/// frame before emission.
async fn forward_stream(
    conn: &Conn,
    request_id: &str,
    agent_id: &str,
    session_id: &str,
    data: Value,
) {
    let req = RequestPayload {
        session_id: session_id.to_string(),
        action: "prompt".to_string(),
        data,
        project_path: None,
    };
    let mut reply = match conn.state.tunnel.forward(agent_id, request_id, &req) {
        Ok(r) => r,
        Err(e) => {
            conn.send_error(request_id, &format!("Agent forward failed: {e}"));
            return;
        }
    };

    // No deadline: prompts are unbounded. The stream ends on `stream.end`,
    // an error, or channel closure (agent gone / displaced).
    while let Some(msg) = reply.recv().await {
        match msg.kind.as_str() {
            MSG_STREAM => {
                emit_stream(conn, request_id, session_id, msg.payload.unwrap_or(Value::Null));
            }
            MSG_STREAM_END => {
                emit_stream_end(conn, request_id, session_id);
                break;
            }
            MSG_ERROR => {
                conn.send(server_frame(
                    "error",
                    request_id,
                    None,
                    msg.payload.unwrap_or(Value::Null),
                ));
                break;
            }
            _ => {}
        }
    }
}

/// Buffer a stream chunk under the session, then emit it with its replay id.
fn emit_stream(conn: &Conn, request_id: &str, session_id: &str, payload: Value) {
    let msg_id = conn.state.buffer.push(
        session_id,
        BufferedMessage::new("stream", request_id, payload.clone()),
    );
    conn.send(server_frame("stream", request_id, Some(msg_id), payload));
}

fn emit_stream_end(conn: &Conn, request_id: &str, session_id: &str) {
    let msg_id = conn.state.buffer.push(
        session_id,
        BufferedMessage::new("stream.end", request_id, Value::Null),
    );
    conn.send(server_frame("stream.end", request_id, Some(msg_id), Value::Null));
    // A completed stream is a natural point to enforce the size cap.
    conn.state.buffer.trim(session_id);
}
