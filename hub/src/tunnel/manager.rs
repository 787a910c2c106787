//! Agent registry and request forwarding.
//!
//! One [`AgentHandle`] per live agent connection. Registration displaces any
//! previous holder of the same agent id: the old transport is shut down and
//! its pending requests are closed *before* the new registration is
//! acknowledged, so a forward issued after the ack can only land on the new
//! transport.
//!
//! ## Locking
//!
//! The registry and each agent's pending-request map use `std::sync`
//! read-write locks, held only for map operations and never across an await.
//! Everything that can block (socket I/O, channel sends) happens outside.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use super::{
    RegisterPayload, RegisteredPayload, RequestPayload, TunnelMessage, MSG_ERROR, MSG_PING,
    MSG_REGISTER, MSG_REGISTERED, MSG_REQUEST, MSG_RESPONSE, MSG_STREAM, MSG_STREAM_END,
};
use crate::auth::token_ok;
use crate::state::AppState;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
const REGISTER_WAIT: Duration = Duration::from_secs(10);

/// Outbound frames queued per agent.
const OUTBOUND_QUEUE: usize = 256;
/// Replies queued per pending request.
const RESPONSE_QUEUE: usize = 100;

/// Forwarding failures surfaced to the client server.
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardError {
    /// No live registration for the agent id.
    AgentNotFound,
    /// The agent's outbound queue was full; transient.
    AgentBusy,
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::AgentNotFound => write!(f, "agent not found"),
            ForwardError::AgentBusy => write!(f, "agent send buffer full"),
        }
    }
}

/// A live agent registration.
#[derive(Debug)]
pub struct AgentHandle {
    pub id: String,
    pub capabilities: Vec<String>,
    pub version: String,
    outbound: mpsc::Sender<TunnelMessage>,
    /// requestId → response channel. Writers on register/cancel, readers on
    /// every inbound dispatch.
    pending: RwLock<HashMap<String, mpsc::Sender<TunnelMessage>>>,
    last_seen: Mutex<Instant>,
    /// Fired when this registration is displaced; the connection task exits
    /// and closes the transport.
    shutdown: Notify,
}

impl AgentHandle {
    fn new(payload: &RegisterPayload, outbound: mpsc::Sender<TunnelMessage>) -> Self {
        Self {
            id: payload.agent_id.clone(),
            capabilities: payload.capabilities.clone(),
            version: payload.version.clone(),
            outbound,
            pending: RwLock::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
            shutdown: Notify::new(),
        }
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("last_seen lock poisoned")
    }

    fn touch(&self) {
        *self.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();
    }

    /// Drop every pending sender so waiting forwards observe channel closure.
    fn close_pending(&self) {
        self.pending.write().expect("pending lock poisoned").drain();
    }
}

/// A forwarded request's reply stream. Dropping it deregisters the pending
/// entry, so late agent replies are discarded instead of piling up.
#[derive(Debug)]
pub struct PendingReply {
    rx: mpsc::Receiver<TunnelMessage>,
    agent: Arc<AgentHandle>,
    request_id: String,
}

impl PendingReply {
    pub async fn recv(&mut self) -> Option<TunnelMessage> {
        self.rx.recv().await
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.agent
            .pending
            .write()
            .expect("pending lock poisoned")
            .remove(&self.request_id);
    }
}

/// Registry of live agents plus the forwarding contract.
pub struct TunnelManager {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Install a registration, displacing any previous holder of the same id.
    fn register(
        &self,
        payload: &RegisterPayload,
        outbound: mpsc::Sender<TunnelMessage>,
    ) -> Arc<AgentHandle> {
        let handle = Arc::new(AgentHandle::new(payload, outbound));
        let displaced = {
            let mut agents = self.agents.write().expect("agents lock poisoned");
            agents.insert(handle.id.clone(), Arc::clone(&handle))
        };
        if let Some(old) = displaced {
            warn!(agent_id = %handle.id, "Agent re-registered, displacing previous connection");
            old.close_pending();
            // notify_one stores a permit, so the old connection's reader
            // observes the shutdown even if it wasn't parked yet.
            old.shutdown.notify_one();
        }
        handle
    }

    /// Remove a registration, but only if `handle` is still the current
    /// holder (a displaced connection must not remove its replacement).
    fn deregister(&self, handle: &Arc<AgentHandle>) {
        let mut agents = self.agents.write().expect("agents lock poisoned");
        if agents
            .get(&handle.id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            agents.remove(&handle.id);
        }
        drop(agents);
        handle.close_pending();
    }

    /// Send a request to an agent and return its reply stream.
    pub fn forward(
        &self,
        agent_id: &str,
        request_id: &str,
        req: &RequestPayload,
    ) -> Result<PendingReply, ForwardError> {
        let agent = self.get(agent_id).ok_or(ForwardError::AgentNotFound)?;

        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE);
        agent
            .pending
            .write()
            .expect("pending lock poisoned")
            .insert(request_id.to_string(), tx);

        let msg = TunnelMessage::new(
            MSG_REQUEST,
            request_id,
            Some(serde_json::to_value(req).expect("request payload serializes")),
        );
        if agent.outbound.try_send(msg).is_err() {
            agent
                .pending
                .write()
                .expect("pending lock poisoned")
                .remove(request_id);
            return Err(ForwardError::AgentBusy);
        }

        Ok(PendingReply {
            rx,
            agent,
            request_id: request_id.to_string(),
        })
    }

    /// Route an inbound agent frame to its pending request, if any.
    fn dispatch(&self, agent: &AgentHandle, msg: TunnelMessage) {
        match msg.kind.as_str() {
            super::MSG_PONG => agent.touch(),
            MSG_RESPONSE | MSG_STREAM | MSG_STREAM_END | MSG_ERROR => {
                if msg.id.is_empty() {
                    return;
                }
                let pending = agent.pending.read().expect("pending lock poisoned");
                if let Some(tx) = pending.get(&msg.id) {
                    if tx.try_send(msg.clone()).is_err() {
                        warn!(
                            agent_id = %agent.id,
                            request_id = %msg.id,
                            "Agent response channel full or closed, dropping reply"
                        );
                    }
                }
            }
            other => {
                warn!(agent_id = %agent.id, kind = %other, "Unknown agent frame type");
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.agents
            .read()
            .expect("agents lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// Any live agent, if one exists.
    pub fn get_any(&self) -> Option<Arc<AgentHandle>> {
        self.agents
            .read()
            .expect("agents lock poisoned")
            .values()
            .next()
            .cloned()
    }

    /// Snapshot of live registrations, ordered by agent id.
    pub fn agents(&self) -> Vec<Arc<AgentHandle>> {
        let mut handles: Vec<Arc<AgentHandle>> = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .values()
            .cloned()
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }
}

/// `GET /agent` — agent WebSocket endpoint.
pub async fn agent_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(crate::ws::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // The first frame must be a registration.
    let register = match tokio::time::timeout(REGISTER_WAIT, ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<TunnelMessage>(&text) {
            Ok(msg) if msg.kind == MSG_REGISTER => msg
                .payload
                .and_then(|p| serde_json::from_value::<RegisterPayload>(p).ok()),
            Ok(msg) => {
                warn!(kind = %msg.kind, "Agent expected register frame, closing");
                None
            }
            Err(e) => {
                warn!("Agent sent invalid register frame: {e}");
                None
            }
        },
        _ => {
            warn!("Agent disconnected before registration");
            return;
        }
    };
    let Some(register) = register else { return };

    if !token_ok(&state.config.auth.agent_token, &register.token) {
        warn!(agent_id = %register.agent_id, "Agent unauthorized");
        let reply = registered_frame(false, Some("unauthorized"));
        let _ = ws_sink.send(reply).await;
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<TunnelMessage>(OUTBOUND_QUEUE);
    // Displacement of a previous holder happens inside register(), before the
    // success reply below, so a forward issued after the ack only sees the
    // new transport.
    let handle = state.tunnel.register(&register, out_tx);
    info!(
        agent_id = %handle.id,
        version = %handle.version,
        capabilities = ?handle.capabilities,
        "Agent registered"
    );

    if ws_sink.send(registered_frame(true, None)).await.is_err() {
        state.tunnel.deregister(&handle);
        return;
    }

    // Writer: drains the outbound queue and pings on a ticker.
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_PERIOD);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("Failed to serialize agent frame: {e}");
                            continue;
                        }
                    };
                    match tokio::time::timeout(WRITE_WAIT, ws_sink.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = ticker.tick() => {
                    let ping = TunnelMessage::new(MSG_PING, "", None);
                    let text = serde_json::to_string(&ping).expect("ping frame serializes");
                    match tokio::time::timeout(WRITE_WAIT, ws_sink.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
            }
        }
    });

    // Reader: dispatch frames until transport error, read timeout, or
    // displacement.
    loop {
        let msg = tokio::select! {
            _ = handle.shutdown.notified() => {
                info!(agent_id = %handle.id, "Agent connection displaced");
                break;
            }
            read = tokio::time::timeout(PONG_WAIT, ws_stream.next()) => match read {
                Ok(Some(Ok(m))) => m,
                Ok(Some(Err(e))) => {
                    warn!(agent_id = %handle.id, "Agent read error: {e}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(agent_id = %handle.id, "Agent read timeout (no pong)");
                    break;
                }
            },
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<TunnelMessage>(&text) {
                Ok(frame) => state.tunnel.dispatch(&handle, frame),
                Err(e) => warn!(agent_id = %handle.id, "Agent invalid frame: {e}"),
            },
            Message::Pong(_) => handle.touch(),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.tunnel.deregister(&handle);
    writer.abort();
    info!(agent_id = %handle.id, "Agent disconnected");
}

fn registered_frame(success: bool, error: Option<&str>) -> Message {
    let payload = RegisteredPayload {
        success,
        error: error.map(ToString::to_string),
    };
    let msg = TunnelMessage::new(
        MSG_REGISTERED,
        "",
        Some(serde_json::to_value(&payload).expect("registered payload serializes")),
    );
    Message::Text(
        serde_json::to_string(&msg)
            .expect("registered frame serializes")
            .into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register_payload(id: &str) -> RegisterPayload {
        RegisterPayload {
            agent_id: id.to_string(),
            token: String::new(),
            capabilities: vec!["worker".to_string()],
            version: "0.1.0".to_string(),
        }
    }

    fn request(action: &str) -> RequestPayload {
        RequestPayload {
            session_id: String::new(),
            action: action.to_string(),
            data: Value::Null,
            project_path: None,
        }
    }

    use serde_json::Value;

    #[tokio::test]
    async fn forward_without_agent_fails() {
        let mgr = TunnelManager::new();
        let err = mgr
            .forward("ghost", "r1", &request("session.list"))
            .expect_err("no agent registered");
        assert_eq!(err, ForwardError::AgentNotFound);
    }

    #[tokio::test]
    async fn forward_delivers_request_and_routes_replies() {
        let mgr = TunnelManager::new();
        let (tx, mut agent_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = mgr.register(&register_payload("dev1"), tx);

        let mut reply = mgr
            .forward("dev1", "r1", &request("session.list"))
            .expect("forward succeeds");

        // The request frame landed on the agent's outbound queue.
        let sent = agent_rx.recv().await.expect("request enqueued");
        assert_eq!(sent.kind, MSG_REQUEST);
        assert_eq!(sent.id, "r1");

        // An inbound response for that id reaches the caller.
        mgr.dispatch(
            &handle,
            TunnelMessage::new(MSG_RESPONSE, "r1", Some(json!({"ok": true}))),
        );
        let got = reply.recv().await.expect("response routed");
        assert_eq!(got.kind, MSG_RESPONSE);
        assert_eq!(got.payload.expect("payload present")["ok"], true);
    }

    #[tokio::test]
    async fn stream_replies_arrive_in_order() {
        let mgr = TunnelManager::new();
        let (tx, _agent_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = mgr.register(&register_payload("dev1"), tx);

        let mut reply = mgr
            .forward("dev1", "pr1", &request("prompt"))
            .expect("forward succeeds");

        for text in ["H", "e", "llo"] {
            mgr.dispatch(
                &handle,
                TunnelMessage::new(MSG_STREAM, "pr1", Some(json!({"text": text}))),
            );
        }
        mgr.dispatch(&handle, TunnelMessage::new(MSG_STREAM_END, "pr1", None));

        let mut kinds = Vec::new();
        let mut texts = Vec::new();
        while let Some(msg) = reply.recv().await {
            kinds.push(msg.kind.clone());
            if let Some(p) = &msg.payload {
                texts.push(p["text"].as_str().unwrap_or_default().to_string());
            }
            if msg.kind == MSG_STREAM_END {
                break;
            }
        }
        assert_eq!(kinds, vec![MSG_STREAM, MSG_STREAM, MSG_STREAM, MSG_STREAM_END]);
        assert_eq!(texts, vec!["H", "e", "llo"]);
    }

    #[tokio::test]
    async fn outbound_overflow_is_agent_busy() {
        let mgr = TunnelManager::new();
        let (tx, _agent_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = mgr.register(&register_payload("dev1"), tx);

        // Fill the outbound queue; the receiver is never drained.
        let mut replies = Vec::new();
        for i in 0..OUTBOUND_QUEUE {
            replies.push(
                mgr.forward("dev1", &format!("r{i}"), &request("ping"))
                    .expect("queue has room"),
            );
        }
        let err = mgr
            .forward("dev1", "overflow", &request("ping"))
            .expect_err("queue full");
        assert_eq!(err, ForwardError::AgentBusy);

        // The failed forward left no pending entry behind.
        assert!(!handle
            .pending
            .read()
            .expect("pending lock")
            .contains_key("overflow"));
    }

    #[tokio::test]
    async fn dropping_reply_deregisters_and_drops_late_replies() {
        let mgr = TunnelManager::new();
        let (tx, _agent_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = mgr.register(&register_payload("dev1"), tx);

        let reply = mgr
            .forward("dev1", "r1", &request("session.list"))
            .expect("forward succeeds");
        assert!(handle.pending.read().expect("pending lock").contains_key("r1"));

        drop(reply);
        assert!(!handle.pending.read().expect("pending lock").contains_key("r1"));

        // Late replies for the cancelled request are silently dropped.
        mgr.dispatch(
            &handle,
            TunnelMessage::new(MSG_RESPONSE, "r1", Some(json!({"late": true}))),
        );
        assert!(handle.pending.read().expect("pending lock").is_empty());
    }

    #[tokio::test]
    async fn displacement_closes_old_transport_and_pending() {
        let mgr = TunnelManager::new();
        let (tx1, _rx1) = mpsc::channel(OUTBOUND_QUEUE);
        let first = mgr.register(&register_payload("dev1"), tx1);

        let mut reply = mgr
            .forward("dev1", "r1", &request("session.list"))
            .expect("forward succeeds");

        // Arrange to observe the shutdown notification before displacing.
        let notified = {
            let first = Arc::clone(&first);
            tokio::spawn(async move { first.shutdown.notified().await })
        };
        tokio::task::yield_now().await;

        let (tx2, mut rx2) = mpsc::channel(OUTBOUND_QUEUE);
        let _second = mgr.register(&register_payload("dev1"), tx2);

        // Old transport was told to shut down and its pending channel closed.
        notified.await.expect("shutdown notified");
        assert!(reply.recv().await.is_none());

        // A forward after the second registration lands on the new transport.
        let _r2 = mgr
            .forward("dev1", "r2", &request("session.list"))
            .expect("forward to new registration");
        let sent = rx2.recv().await.expect("delivered to new transport");
        assert_eq!(sent.id, "r2");

        // The displaced connection's deregister must not remove the newcomer.
        mgr.deregister(&first);
        assert!(mgr.get("dev1").is_some());
    }

    #[tokio::test]
    async fn pong_updates_last_seen() {
        let mgr = TunnelManager::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = mgr.register(&register_payload("dev1"), tx);

        let before = handle.last_seen();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.dispatch(&handle, TunnelMessage::new(super::super::MSG_PONG, "", None));
        assert!(handle.last_seen() > before);
    }

    #[tokio::test]
    async fn agents_snapshot_is_sorted() {
        let mgr = TunnelManager::new();
        let mut receivers = Vec::new();
        for id in ["zeta", "alpha", "mid"] {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            receivers.push(rx);
            mgr.register(&register_payload(id), tx);
        }
        let agents = mgr.agents();
        let ids: Vec<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert!(mgr.get_any().is_some());
    }
}
