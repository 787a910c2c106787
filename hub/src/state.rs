//! Shared application state passed to every handler via Axum's `State`
//! extractor.
//!
//! The state is the process-wide root: it outlives every connection, so
//! connections hold plain clones of it rather than back-references. Tests
//! build a fresh state per test; there are no singletons.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::ReplayBuffer;
use crate::config::Config;
use crate::proxy::WorkerProxy;
use crate::tunnel::manager::TunnelManager;

/// Shared application state for the hub.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the hub started (for uptime reporting).
    pub start_time: Instant,
    /// Registry of live agents and the forwarding contract.
    pub tunnel: Arc<TunnelManager>,
    /// Replay buffer for Mosh-style sync (no-op when buffering is disabled).
    pub buffer: Arc<dyn ReplayBuffer>,
    /// Direct-mode worker client, present when a fallback URL is configured.
    pub fallback: Option<Arc<WorkerProxy>>,
    /// Number of live client connections.
    pub client_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        config: Config,
        buffer: Arc<dyn ReplayBuffer>,
    ) -> Self {
        let tunnel = Arc::new(TunnelManager::new());
        let fallback = config
            .fallback
            .as_ref()
            .map(|f| Arc::new(WorkerProxy::new(&f.worker_url)));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            tunnel,
            buffer,
            fallback,
            client_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}
