//! Concurrent in-process replay buffer.
//!
//! Sessions live in a [`DashMap`], so pushes and reads for distinct sessions
//! never contend; within a session the shard lock serializes pushes, which is
//! what makes the per-session ids gapless. Each session carries its own
//! monotone counter and an expiry instant refreshed on every push. Expired
//! sessions are dropped whole, either lazily on access or by the periodic
//! [`MemoryBuffer::sweep`] the hub main loop runs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{now_ms, BufferedMessage, ReplayBuffer};

/// Per-session log: monotone counter plus a bounded deque of messages.
struct SessionLog {
    /// Last id assigned. The counter survives trims, so ids never repeat
    /// within a session's lifetime.
    last_id: i64,
    entries: VecDeque<BufferedMessage>,
    expires_at: Instant,
}

impl SessionLog {
    fn new(ttl: Duration) -> Self {
        Self {
            last_id: 0,
            entries: VecDeque::new(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process [`ReplayBuffer`] with TTL and size-cap retention.
pub struct MemoryBuffer {
    sessions: DashMap<String, SessionLog>,
    ttl: Duration,
    max_count: usize,
}

impl MemoryBuffer {
    pub fn new(ttl: Duration, max_count: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            max_count: max_count.max(1),
        }
    }

    /// Remove sessions whose TTL elapsed without activity. Returns how many
    /// were evicted.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, log| !log.expired());
        before - self.sessions.len()
    }
}

impl ReplayBuffer for MemoryBuffer {
    fn push(&self, session_id: &str, mut msg: BufferedMessage) -> i64 {
        let mut log = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionLog::new(self.ttl));

        // A session that expired but wasn't swept yet restarts empty. The
        // counter restarts with it, matching the external-store semantics
        // where the id key expires together with the messages.
        if log.expired() {
            *log = SessionLog::new(self.ttl);
        }

        log.last_id += 1;
        msg.id = log.last_id;
        if msg.timestamp == 0 {
            msg.timestamp = now_ms();
        }

        log.entries.push_back(msg);
        while log.entries.len() > self.max_count {
            log.entries.pop_front();
        }
        log.expires_at = Instant::now() + self.ttl;

        log.last_id
    }

    fn get_since(&self, session_id: &str, after_id: i64) -> Vec<BufferedMessage> {
        let Some(log) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        if log.expired() {
            return Vec::new();
        }
        log.entries
            .iter()
            .filter(|m| m.id > after_id)
            .cloned()
            .collect()
    }

    fn latest_id(&self, session_id: &str) -> i64 {
        self.sessions
            .get(session_id)
            .filter(|log| !log.expired())
            .map_or(0, |log| log.last_id)
    }

    fn trim(&self, session_id: &str) {
        if let Some(mut log) = self.sessions.get_mut(session_id) {
            while log.entries.len() > self.max_count {
                log.entries.pop_front();
            }
        }
    }
}
