//! Per-session message buffering for Mosh-style sync.
//!
//! Every client-visible `stream` / `stream.end` frame is appended here before
//! it is emitted, keyed by session, with a monotonically increasing id. A
//! reconnecting client sends `sync{sessionId, lastAckId}` and receives the
//! missed tail in a single `sync.batch`.
//!
//! Two implementations satisfy the same contract: [`memory::MemoryBuffer`]
//! (concurrent in-process store with TTL and size cap) and [`NoopBuffer`]
//! (remembers nothing). The gateway functions end-to-end with either; the
//! only observable loss with the no-op is that reconnected clients cannot
//! gap-fill.

pub mod memory;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A buffered outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// Monotonically increasing id, unique within a session.
    pub id: i64,
    /// Message type (`stream`, `stream.end`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Original request id the message belongs to.
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// Unix milliseconds when the message was pushed.
    pub timestamp: i64,
}

impl BufferedMessage {
    /// Build a message ready for `push` (id and timestamp assigned there).
    pub fn new(kind: &str, request_id: &str, payload: Value) -> Self {
        Self {
            id: 0,
            kind: kind.to_string(),
            request_id: request_id.to_string(),
            payload,
            timestamp: 0,
        }
    }
}

/// Unix time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Ordered, bounded, TTL'd per-session message log.
///
/// Implementations are infallible: degradation (e.g. an evicted session) is
/// expressed as "push assigns the next id anyway" / "reads return empty",
/// never as an error that could abort the surrounding request.
pub trait ReplayBuffer: Send + Sync {
    /// Record a message under `session_id`, assigning and returning the next
    /// id for that session. Refreshes the session's TTL.
    fn push(&self, session_id: &str, msg: BufferedMessage) -> i64;

    /// All messages with id strictly greater than `after_id`, in id order.
    fn get_since(&self, session_id: &str, after_id: i64) -> Vec<BufferedMessage>;

    /// Highest id ever assigned to the session (0 if none).
    fn latest_id(&self, session_id: &str) -> i64;

    /// Drop entries beyond the size cap, keeping only the newest.
    fn trim(&self, session_id: &str);
}

/// No-op buffer used when buffering is disabled.
pub struct NoopBuffer;

impl ReplayBuffer for NoopBuffer {
    fn push(&self, _session_id: &str, _msg: BufferedMessage) -> i64 {
        0
    }

    fn get_since(&self, _session_id: &str, _after_id: i64) -> Vec<BufferedMessage> {
        Vec::new()
    }

    fn latest_id(&self, _session_id: &str) -> i64 {
        0
    }

    fn trim(&self, _session_id: &str) {}
}
