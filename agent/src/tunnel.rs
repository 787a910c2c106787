//! Tunnel client — outbound WS connection from the agent to the hub.
//!
//! Maintains a persistent WebSocket to the hub's `/agent` endpoint with
//! exponential-backoff reconnect. The connection walks
//! idle → dialing → registering → ready: after the dial succeeds, the agent
//! sends `agent.register` and only becomes ready on an
//! `agent.registered{success:true}` reply within a short deadline.
//!
//! In ready, each inbound `agent.request` runs in its own task so long
//! streams never block the reader. All writes are serialized through one
//! bounded channel drained by the connection loop; request tasks block on it
//! rather than dropping chunks, which is what keeps per-request chunk order
//! intact under backpressure.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::handler::Handler;

// Agent → Hub
pub const MSG_REGISTER: &str = "agent.register";
pub const MSG_PONG: &str = "agent.pong";
pub const MSG_RESPONSE: &str = "agent.response";
pub const MSG_STREAM: &str = "agent.stream";
pub const MSG_STREAM_END: &str = "agent.stream.end";
pub const MSG_ERROR: &str = "agent.error";

// Hub → Agent
pub const MSG_REGISTERED: &str = "agent.registered";
pub const MSG_PING: &str = "agent.ping";
pub const MSG_REQUEST: &str = "agent.request";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const REGISTER_WAIT: Duration = Duration::from_secs(10);

/// Outbound frames queued towards the hub. Request tasks block on this
/// queue when the transport is slower than the handlers.
const OUTBOUND_QUEUE: usize = 256;

/// A tunnel protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl TunnelMessage {
    pub fn new(kind: &str, id: &str, payload: Option<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
            payload,
        }
    }
}

/// Registration frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub agent_id: String,
    pub token: String,
    pub capabilities: Vec<String>,
    pub version: String,
}

/// Registration outcome from the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// A forwarded client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default)]
    pub session_id: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub project_path: Option<String>,
}

/// Connection-attempt failures (each one backs off and retries).
#[derive(Debug)]
enum TunnelError {
    Connect(String),
    Transport(String),
    RegisterRejected(String),
    RegisterTimeout,
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Connect(e) => write!(f, "connect failed: {e}"),
            TunnelError::Transport(e) => write!(f, "transport error: {e}"),
            TunnelError::RegisterRejected(e) => write!(f, "registration rejected: {e}"),
            TunnelError::RegisterTimeout => write!(f, "timed out waiting for registration reply"),
        }
    }
}

/// Spawn the tunnel client task. Runs until the agent shuts down.
pub fn spawn(
    hub_url: String,
    agent_id: String,
    token: String,
    handler: Arc<Handler>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(client_loop(hub_url, agent_id, token, handler))
}

/// Main loop: connect, register, serve requests, reconnect on failure.
/// Backoff doubles from 1s to the 30s cap and resets after any session that
/// reached ready.
async fn client_loop(hub_url: String, agent_id: String, token: String, handler: Arc<Handler>) {
    let mut delay = RECONNECT_DELAY;

    loop {
        info!("Tunnel: connecting to hub at {hub_url}");
        match connect_and_run(&hub_url, &agent_id, &token, &handler).await {
            Ok(()) => {
                // Reached ready and later lost the link; retry promptly.
                info!("Tunnel: connection closed, reconnecting...");
                delay = RECONNECT_DELAY;
            }
            Err(e) => {
                warn!("Tunnel: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }
}

/// One connection attempt: dial, register, then serve until disconnect.
/// `Ok(())` means the ready state was reached (backoff resets).
async fn connect_and_run(
    hub_url: &str,
    agent_id: &str,
    token: &str,
    handler: &Arc<Handler>,
) -> Result<(), TunnelError> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(hub_url)
        .await
        .map_err(|e| TunnelError::Connect(e.to_string()))?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // Register.
    let register = TunnelMessage::new(
        MSG_REGISTER,
        "",
        Some(
            serde_json::to_value(RegisterPayload {
                agent_id: agent_id.to_string(),
                token: token.to_string(),
                capabilities: vec!["worker".to_string()],
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .expect("register payload serializes"),
        ),
    );
    send_frame(&mut ws_sink, &register).await?;

    // Wait for the registration verdict.
    let verdict = tokio::time::timeout(REGISTER_WAIT, async {
        while let Some(msg) = ws_stream.next().await {
            let msg = msg.map_err(|e| TunnelError::Transport(e.to_string()))?;
            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                let frame: TunnelMessage = serde_json::from_str(&text)
                    .map_err(|e| TunnelError::Transport(e.to_string()))?;
                if frame.kind == MSG_REGISTERED {
                    let payload: RegisteredPayload = frame
                        .payload
                        .and_then(|p| serde_json::from_value(p).ok())
                        .unwrap_or_else(|| RegisteredPayload {
                            success: false,
                            error: Some("malformed registration reply".to_string()),
                        });
                    return Ok(payload);
                }
            }
        }
        Err(TunnelError::Transport("closed during registration".to_string()))
    })
    .await
    .map_err(|_| TunnelError::RegisterTimeout)??;

    if !verdict.success {
        return Err(TunnelError::RegisterRejected(
            verdict.error.unwrap_or_else(|| "unknown".to_string()),
        ));
    }
    info!("Tunnel: registered with hub as {agent_id}");

    // Ready: serve requests until the link breaks.
    let (out_tx, mut out_rx) = mpsc::channel::<TunnelMessage>(OUTBOUND_QUEUE);
    loop {
        tokio::select! {
            // Single writer: frames from request tasks, serialized in queue
            // order.
            frame = out_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                send_frame(&mut ws_sink, &frame).await?;
            }
            msg = ws_stream.next() => {
                let Some(msg) = msg else { return Ok(()) };
                let msg = msg.map_err(|e| TunnelError::Transport(e.to_string()))?;
                match msg {
                    tokio_tungstenite::tungstenite::Message::Text(text) => {
                        let Ok(frame) = serde_json::from_str::<TunnelMessage>(&text) else {
                            warn!("Tunnel: invalid frame from hub");
                            continue;
                        };
                        match frame.kind.as_str() {
                            MSG_PING => {
                                send_frame(&mut ws_sink, &TunnelMessage::new(MSG_PONG, "", None))
                                    .await?;
                            }
                            MSG_REQUEST => {
                                // Each request gets its own task so a long
                                // stream never blocks this reader.
                                tokio::spawn(handle_request(
                                    Arc::clone(handler),
                                    frame.id,
                                    frame.payload,
                                    out_tx.clone(),
                                ));
                            }
                            other => {
                                warn!("Tunnel: unknown frame type from hub: {other}");
                            }
                        }
                    }
                    tokio_tungstenite::tungstenite::Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &TunnelMessage) -> Result<(), TunnelError>
where
    S: SinkExt<tokio_tungstenite::tungstenite::Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame).map_err(|e| TunnelError::Transport(e.to_string()))?;
    sink.send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))
}

/// Serve one forwarded request.
///
/// Streaming actions (`prompt`) emit every chunk as an `agent.stream` frame
/// in source order and terminate with `agent.stream.end`. Non-stream actions
/// collapse to a single `agent.response` whose payload is the last chunk.
/// Request-level failures collapse to `agent.error`.
async fn handle_request(
    handler: Arc<Handler>,
    request_id: String,
    payload: Option<Value>,
    out: mpsc::Sender<TunnelMessage>,
) {
    let req = payload.and_then(|p| serde_json::from_value::<RequestPayload>(p).ok());
    let Some(req) = req else {
        let _ = out
            .send(TunnelMessage::new(
                MSG_ERROR,
                &request_id,
                Some(json!({ "error": "invalid request payload" })),
            ))
            .await;
        return;
    };
    let streaming = req.action == "prompt";

    let mut chunks = match handler.handle(req).await {
        Ok(rx) => rx,
        Err(e) => {
            let _ = out
                .send(TunnelMessage::new(
                    MSG_ERROR,
                    &request_id,
                    Some(json!({ "error": e.to_string() })),
                ))
                .await;
            return;
        }
    };

    if streaming {
        while let Some(chunk) = chunks.recv().await {
            // Blocking send: backpressure from the transport propagates to
            // the handler instead of dropping chunks.
            if out
                .send(TunnelMessage::new(MSG_STREAM, &request_id, Some(chunk)))
                .await
                .is_err()
            {
                return; // connection gone; clients reconcile via sync
            }
        }
        let _ = out
            .send(TunnelMessage::new(MSG_STREAM_END, &request_id, None))
            .await;
        return;
    }

    let mut last = None;
    while let Some(chunk) = chunks.recv().await {
        last = Some(chunk);
    }
    let _ = out
        .send(TunnelMessage::new(MSG_RESPONSE, &request_id, last))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_frame_wire_shape() {
        let msg = TunnelMessage::new(
            MSG_REGISTER,
            "",
            Some(
                serde_json::to_value(RegisterPayload {
                    agent_id: "dev1".to_string(),
                    token: "s3cret".to_string(),
                    capabilities: vec!["worker".to_string()],
                    version: "0.1.0".to_string(),
                })
                .expect("payload serializes"),
            ),
        );
        let wire = serde_json::to_value(&msg).expect("frame serializes");
        assert_eq!(wire["type"], "agent.register");
        assert!(wire.get("id").is_none());
        assert_eq!(wire["payload"]["agentId"], "dev1");
        assert_eq!(wire["payload"]["token"], "s3cret");
        assert_eq!(wire["payload"]["capabilities"][0], "worker");
    }

    #[test]
    fn request_payload_parses_hub_frame() {
        let req: RequestPayload = serde_json::from_value(serde_json::json!({
            "sessionId": "ses_abc",
            "action": "prompt",
            "data": {"content": "hi"},
        }))
        .expect("request parses");
        assert_eq!(req.session_id, "ses_abc");
        assert_eq!(req.action, "prompt");
        assert_eq!(req.data["content"], "hi");
        assert!(req.project_path.is_none());
    }

    #[test]
    fn registered_payload_tolerates_missing_error() {
        let ok: RegisteredPayload =
            serde_json::from_str(r#"{"success":true}"#).expect("payload parses");
        assert!(ok.success);
        assert!(ok.error.is_none());

        let rejected: RegisteredPayload =
            serde_json::from_str(r#"{"success":false,"error":"unauthorized"}"#)
                .expect("payload parses");
        assert!(!rejected.success);
        assert_eq!(rejected.error.as_deref(), Some("unauthorized"));
    }

    #[tokio::test]
    async fn non_stream_action_collapses_to_single_response() {
        let supervisor = Arc::new(crate::supervisor::WorkerSupervisor::new(
            vec!["/p".to_string()],
            4096,
            4097,
            1,
            std::time::Duration::from_millis(10),
            Arc::new(NoopLauncher),
            Arc::new(NeverHealthy),
        ));
        let handler = Arc::new(Handler::new(supervisor));
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);

        handle_request(
            handler,
            "r1".to_string(),
            Some(serde_json::json!({ "action": "project.list", "data": null })),
            out_tx,
        )
        .await;

        let reply = out_rx.recv().await.expect("response frame");
        assert_eq!(reply.kind, MSG_RESPONSE);
        assert_eq!(reply.id, "r1");
        assert!(reply.payload.expect("payload")["projects"].is_array());
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn prompt_streams_chunks_then_stream_end() {
        // A prompt whose session has no binding fails at the handler and
        // collapses to agent.error; a prompt with a binding but a dead
        // worker streams the error chunk and terminates with stream.end.
        let supervisor = Arc::new(crate::supervisor::WorkerSupervisor::new(
            vec!["/p".to_string()],
            4096,
            4097,
            1,
            std::time::Duration::from_millis(10),
            Arc::new(NoopLauncher),
            Arc::new(NeverHealthy),
        ));
        let handler = Arc::new(Handler::new(supervisor));
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);

        handle_request(
            Arc::clone(&handler),
            "pr1".to_string(),
            Some(serde_json::json!({
                "sessionId": "ses_abc",
                "action": "prompt",
                "data": {"content": "hi"},
                "projectPath": "/p",
            })),
            out_tx,
        )
        .await;

        let chunk = out_rx.recv().await.expect("stream frame");
        assert_eq!(chunk.kind, MSG_STREAM);
        assert_eq!(chunk.id, "pr1");
        assert!(chunk.payload.expect("payload").get("error").is_some());

        let end = out_rx.recv().await.expect("stream end");
        assert_eq!(end.kind, MSG_STREAM_END);
        assert!(end.payload.is_none());
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_request_payload_collapses_to_error() {
        let supervisor = Arc::new(crate::supervisor::WorkerSupervisor::new(
            vec![],
            4096,
            4096,
            1,
            std::time::Duration::from_millis(10),
            Arc::new(NoopLauncher),
            Arc::new(NeverHealthy),
        ));
        let handler = Arc::new(Handler::new(supervisor));
        let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);

        handle_request(handler, "r1".to_string(), None, out_tx).await;

        let err = out_rx.recv().await.expect("error frame");
        assert_eq!(err.kind, MSG_ERROR);
        assert_eq!(err.id, "r1");
        assert_eq!(
            err.payload.expect("payload")["error"],
            "invalid request payload"
        );
        assert!(out_rx.recv().await.is_none());
    }

    use crate::supervisor::launcher::{LaunchError, WorkerLauncher};
    use crate::supervisor::probe::HealthProbe;
    use async_trait::async_trait;

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
}
