//! Reverse tunnel between the hub and agents.
//!
//! Agents connect outbound to `/agent`, send a single `agent.register` frame,
//! and from then on receive `agent.request` frames and answer with
//! `agent.response` / `agent.stream` / `agent.stream.end` / `agent.error`,
//! correlated by the top-level `id` field.

pub mod manager;

use serde::{Deserialize, Serialize};
use serde_json::Value;

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

/// A tunnel protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(rename = "type")]
    pub kind: String,
    /// Request correlation id. Empty for control frames.
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

/// Sent by an agent as its first frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub agent_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: String,
}

/// Registration outcome, sent back to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A client request forwarded to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    #[serde(default)]
    pub session_id: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_wire_shape() {
        let req = RequestPayload {
            session_id: "ses_abc".to_string(),
            action: "session.create".to_string(),
            data: json!({"title": "T", "directory": "/p"}),
            project_path: Some("/p".to_string()),
        };
        let msg = TunnelMessage::new(
            MSG_REQUEST,
            "c1",
            Some(serde_json::to_value(&req).expect("payload serializes")),
        );
        let wire = serde_json::to_value(&msg).expect("frame serializes");
        assert_eq!(wire["type"], "agent.request");
        assert_eq!(wire["id"], "c1");
        assert_eq!(wire["payload"]["action"], "session.create");
        assert_eq!(wire["payload"]["projectPath"], "/p");
        assert_eq!(wire["payload"]["sessionId"], "ses_abc");
    }

    #[test]
    fn control_frames_omit_empty_fields() {
        let ping = TunnelMessage::new(MSG_PING, "", None);
        let wire = serde_json::to_string(&ping).expect("frame serializes");
        assert_eq!(wire, r#"{"type":"agent.ping"}"#);
    }

    #[test]
    fn register_payload_parses() {
        let payload: RegisterPayload = serde_json::from_value(json!({
            "agentId": "dev1",
            "token": "s3cret",
            "capabilities": ["worker"],
            "version": "0.1.0",
        }))
        .expect("register payload parses");
        assert_eq!(payload.agent_id, "dev1");
        assert_eq!(payload.capabilities, vec!["worker"]);
    }

    #[test]
    fn project_path_absent_when_none() {
        let req = RequestPayload {
            session_id: String::new(),
            action: "session.list".to_string(),
            data: Value::Null,
            project_path: None,
        };
        let wire = serde_json::to_value(&req).expect("payload serializes");
        assert!(wire.get("projectPath").is_none());
    }
}
