//! Per-project worker lifecycle management.
//!
//! [`WorkerSupervisor`] is the single authority over worker processes: it
//! maps project paths to instances, reserves ports from a bounded pool,
//! gates startup on the worker's health endpoint, and recovers from crashed
//! workers. Every path must appear in the configured allow-list; anything
//! else is rejected before it can touch pool or process state.
//!
//! ## Concurrency
//!
//! One `RwLock` guards the instance map and the port pool together, so port
//! reservations can never disagree with instance state. Lookups take the
//! read lock; `start` and `stop` hold the write lock across the external
//! launch and health wait, serializing mutations per supervisor.

pub mod instance;
pub mod launcher;
pub mod ports;
pub mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{info, warn};

use instance::{basename, WorkerInstance, WorkerStatus};
use launcher::{instance_name, LaunchError, WorkerLauncher};
use ports::{PortError, PortPool};
use probe::HealthProbe;

/// Interval between startup health probes.
const HEALTH_POLL: Duration = Duration::from_millis(500);

/// Supervisor failures surfaced to request handlers.
#[derive(Debug)]
pub enum SupervisorError {
    /// The path is not in the configured allow-list.
    PathNotWhitelisted(String),
    /// Running-worker ceiling reached; stop another worker first.
    MaxInstancesReached(usize),
    /// Port reservation failed; stop another worker first.
    Port(PortError),
    /// The launcher failed to start or stop the worker.
    Launch(LaunchError),
    /// The worker never answered its health probe in time.
    HealthTimeout(u64),
    /// An operation that needs a running worker found it in another state.
    NotRunning { path: String, status: WorkerStatus },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::PathNotWhitelisted(path) => {
                write!(f, "path not in whitelist: {path}")
            }
            SupervisorError::MaxInstancesReached(max) => {
                write!(f, "max instances reached ({max}), stop another project first")
            }
            SupervisorError::Port(e) => write!(f, "failed to acquire port: {e}"),
            SupervisorError::Launch(e) => write!(f, "{e}"),
            SupervisorError::HealthTimeout(secs) => {
                write!(f, "worker health check timeout after {secs}s")
            }
            SupervisorError::NotRunning { path, status } => {
                write!(f, "project not running: {path} (status: {status})")
            }
        }
    }
}

impl From<PortError> for SupervisorError {
    fn from(e: PortError) -> Self {
        SupervisorError::Port(e)
    }
}

impl From<LaunchError> for SupervisorError {
    fn from(e: LaunchError) -> Self {
        SupervisorError::Launch(e)
    }
}

/// Instance map and port pool, guarded together.
struct Inner {
    instances: HashMap<String, WorkerInstance>,
    ports: PortPool,
}

/// Manages the pool of per-project workers.
pub struct WorkerSupervisor {
    allowed_paths: Vec<String>,
    max_instances: usize,
    health_timeout: Duration,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn HealthProbe>,
    inner: RwLock<Inner>,
}

impl WorkerSupervisor {
    pub fn new(
        allowed_paths: Vec<String>,
        port_min: u16,
        port_max: u16,
        max_instances: usize,
        health_timeout: Duration,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        // Every allow-listed project gets a stopped instance up front, so
        // `project.list` shows the full roster from the start.
        let instances = allowed_paths
            .iter()
            .map(|path| (path.clone(), WorkerInstance::new(path)))
            .collect();

        Self {
            allowed_paths,
            max_instances,
            health_timeout,
            launcher,
            probe,
            inner: RwLock::new(Inner {
                instances,
                ports: PortPool::new(port_min, port_max),
            }),
        }
    }

    /// Reject paths outside the allow-list before any state is touched.
    fn validate_path(&self, path: &str) -> Result<(), SupervisorError> {
        if self.allowed_paths.iter().any(|p| p == path) {
            Ok(())
        } else {
            Err(SupervisorError::PathNotWhitelisted(path.to_string()))
        }
    }

    /// Snapshot of every instance, ordered by path.
    pub async fn list(&self) -> Vec<WorkerInstance> {
        let inner = self.inner.read().await;
        let mut result: Vec<WorkerInstance> = inner.instances.values().cloned().collect();
        result.sort_by(|a, b| a.path.cmp(&b.path));
        result
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Option<WorkerInstance> {
        self.inner.read().await.instances.get(path).cloned()
    }

    /// Start the worker for `path`, health-gated. Returns the running
    /// instance; already-running is a no-op returning the existing one.
    pub async fn start(&self, path: &str) -> Result<WorkerInstance, SupervisorError> {
        self.validate_path(path)?;

        let mut inner = self.inner.write().await;

        let running = inner
            .instances
            .values()
            .filter(|i| i.status == WorkerStatus::Running)
            .count();
        let inst = inner
            .instances
            .get(path)
            .expect("allow-listed paths are seeded at construction");
        if inst.is_running() {
            return Ok(inst.clone());
        }
        if running >= self.max_instances {
            return Err(SupervisorError::MaxInstancesReached(self.max_instances));
        }

        let port = inner
            .ports
            .acquire_available(path, self.probe.as_ref())
            .await?;

        let name = instance_name(&basename(path));
        {
            let inst = inner.instances.get_mut(path).expect("instance exists");
            inst.status = WorkerStatus::Starting;
            inst.port = port;
            inst.error = None;
        }
        info!(path, port, "Starting worker");

        if let Err(e) = self.launcher.start(&name, path, port).await {
            let msg = e.to_string();
            warn!(path, "Worker launch failed: {msg}");
            let _ = inner.ports.release(port);
            let inst = inner.instances.get_mut(path).expect("instance exists");
            inst.reset();
            inst.status = WorkerStatus::Error;
            inst.error = Some(msg);
            return Err(SupervisorError::Launch(e));
        }

        if !self.wait_for_health(port).await {
            let secs = self.health_timeout.as_secs();
            warn!(path, port, "Worker failed health check within {secs}s, tearing down");
            if let Err(e) = self.launcher.stop(&name).await {
                warn!(path, "Teardown after failed health check: {e}");
            }
            let _ = inner.ports.release(port);
            let inst = inner.instances.get_mut(path).expect("instance exists");
            inst.reset();
            inst.status = WorkerStatus::Error;
            inst.error = Some(format!("health check timeout after {secs}s"));
            return Err(SupervisorError::HealthTimeout(secs));
        }

        let inst = inner.instances.get_mut(path).expect("instance exists");
        inst.status = WorkerStatus::Running;
        inst.started_at = Some(now_ms());
        inst.last_used = Some(now_ms());
        info!(path, port, "Worker running");
        Ok(inst.clone())
    }

    /// Poll the worker's health endpoint until it answers or the deadline
    /// passes. Start holds the supervisor lock across this wait by design.
    async fn wait_for_health(&self, port: u16) -> bool {
        let deadline = tokio::time::Instant::now() + self.health_timeout;
        loop {
            if self.probe.healthy(port).await {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(HEALTH_POLL.min(deadline - now)).await;
        }
    }

    /// Stop the worker for `path`. Idempotent; tolerates a worker that is
    /// already gone.
    pub async fn stop(&self, path: &str) -> Result<(), SupervisorError> {
        self.validate_path(path)?;

        let mut inner = self.inner.write().await;
        let inst = inner
            .instances
            .get(path)
            .expect("allow-listed paths are seeded at construction");
        if inst.status == WorkerStatus::Stopped {
            return Ok(());
        }
        let port = inst.port;

        let name = instance_name(&basename(path));
        self.launcher.stop(&name).await?;

        if port > 0 {
            let _ = inner.ports.release(port);
        }
        let inst = inner.instances.get_mut(path).expect("instance exists");
        inst.reset();
        info!(path, "Worker stopped");
        Ok(())
    }

    /// Stop every worker. Used at shutdown; failures are logged, not fatal.
    pub async fn stop_all(&self) {
        let paths: Vec<String> = self.allowed_paths.clone();
        for path in paths {
            if let Err(e) = self.stop(&path).await {
                warn!(path = %path, "Shutdown stop failed: {e}");
            }
        }
    }

    /// Crash recovery: any supposedly-live worker whose external process is
    /// gone transitions to stopped and releases its port.
    pub async fn refresh_status(&self) {
        let mut inner = self.inner.write().await;
        let paths: Vec<String> = inner
            .instances
            .values()
            .filter(|i| {
                i.status == WorkerStatus::Running || i.status == WorkerStatus::Starting
            })
            .map(|i| i.path.clone())
            .collect();

        for path in paths {
            let name = instance_name(&basename(&path));
            if self.launcher.is_running(&name).await {
                continue;
            }
            warn!(path = %path, "Worker process is gone, marking stopped");
            let inst = inner.instances.get_mut(&path).expect("instance exists");
            let port = inst.port;
            inst.reset();
            if port > 0 {
                let _ = inner.ports.release(port);
            }
        }
    }

    /// `http://localhost:{port}` for a running worker, an error naming the
    /// current status otherwise.
    pub async fn worker_url(&self, path: &str) -> Result<String, SupervisorError> {
        self.validate_path(path)?;

        let inner = self.inner.read().await;
        let inst = inner
            .instances
            .get(path)
            .expect("allow-listed paths are seeded at construction");
        if inst.is_running() {
            Ok(inst.worker_url())
        } else {
            Err(SupervisorError::NotRunning {
                path: path.to_string(),
                status: inst.status,
            })
        }
    }

    /// Read-only lookup first; on miss, fall into [`start`](Self::start).
    pub async fn get_or_start_url(&self, path: &str) -> Result<String, SupervisorError> {
        if let Ok(url) = self.worker_url(path).await {
            self.touch(path).await;
            return Ok(url);
        }
        let inst = self.start(path).await?;
        Ok(inst.worker_url())
    }

    /// Record that a worker served a request just now.
    pub async fn touch(&self, path: &str) {
        if let Some(inst) = self.inner.write().await.instances.get_mut(path) {
            inst.last_used = Some(now_ms());
        }
    }

    /// Paths of currently running workers, ordered by path.
    pub async fn running_paths(&self) -> Vec<String> {
        self.list()
            .await
            .into_iter()
            .filter(WorkerInstance::is_running)
            .map(|i| i.path)
            .collect()
    }
}

/// Unix time in milliseconds.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Test double for the external worker host: a launcher whose "workers"
    /// start answering the health probe once launched, through shared state,
    /// mirroring how the real probe sees real workers.
    #[derive(Default)]
    struct MockWorkerHost {
        started: Mutex<Vec<(String, String, u16)>>,
        stopped: Mutex<Vec<String>>,
        alive: Mutex<HashMap<String, u16>>,
        /// Ports currently answering the health endpoint.
        listening: Mutex<Vec<u16>>,
        /// When set, launched workers never become healthy.
        unhealthy: AtomicBool,
        /// When set, launches fail outright.
        fail_start: AtomicBool,
        /// Count of probe calls that reported healthy.
        healthy_hits: AtomicUsize,
    }

    impl MockWorkerHost {
        /// Simulate every worker process dying out from under the agent.
        fn crash_all(&self) {
            self.alive.lock().expect("lock").clear();
            self.listening.lock().expect("lock").clear();
        }
    }

    #[async_trait]
    impl WorkerLauncher for MockWorkerHost {
        async fn start(&self, name: &str, workdir: &str, port: u16) -> Result<(), LaunchError> {
            if self.fail_start.load(Ordering::Relaxed) {
                return Err(LaunchError::Spawn("mock spawn failure".to_string()));
            }
            self.started
                .lock()
                .expect("lock")
                .push((name.to_string(), workdir.to_string(), port));
            self.alive.lock().expect("lock").insert(name.to_string(), port);
            if !self.unhealthy.load(Ordering::Relaxed) {
                self.listening.lock().expect("lock").push(port);
            }
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), LaunchError> {
            self.stopped.lock().expect("lock").push(name.to_string());
            if let Some(port) = self.alive.lock().expect("lock").remove(name) {
                self.listening.lock().expect("lock").retain(|p| *p != port);
            }
            Ok(())
        }

        async fn is_running(&self, name: &str) -> bool {
            self.alive.lock().expect("lock").contains_key(name)
        }
    }

    #[async_trait]
    impl HealthProbe for MockWorkerHost {
        async fn healthy(&self, port: u16) -> bool {
            let healthy = self.listening.lock().expect("lock").contains(&port);
            if healthy {
                self.healthy_hits.fetch_add(1, Ordering::Relaxed);
            }
            healthy
        }
    }

    fn supervisor_with(host: &Arc<MockWorkerHost>, max_instances: usize) -> WorkerSupervisor {
        WorkerSupervisor::new(
            vec!["/p".to_string(), "/q".to_string()],
            4096,
            4097,
            max_instances,
            Duration::from_millis(100),
            Arc::clone(host) as Arc<dyn WorkerLauncher>,
            Arc::clone(host) as Arc<dyn HealthProbe>,
        )
    }

    #[tokio::test]
    async fn start_assigns_port_and_health_gates() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        let inst = sup.start("/p").await.expect("start succeeds");
        assert_eq!(inst.status, WorkerStatus::Running);
        assert_eq!(inst.port, 4096);
        assert!(inst.started_at.is_some());

        // At least one probe succeeded between launch and return.
        assert!(host.healthy_hits.load(Ordering::Relaxed) >= 1);
        let started = host.started.lock().expect("lock");
        assert_eq!(started.len(), 1);
        assert_eq!(started[0], ("tether-worker-p".to_string(), "/p".to_string(), 4096));
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        let first = sup.start("/p").await.expect("first start");
        let second = sup.start("/p").await.expect("second start is a no-op");
        assert_eq!(first.port, second.port);
        assert_eq!(host.started.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn whitelist_rejection_has_no_side_effects() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        let err = sup.start("/r").await.expect_err("path outside allow-list");
        assert!(matches!(err, SupervisorError::PathNotWhitelisted(_)));
        assert!(host.started.lock().expect("lock").is_empty());
        assert!(sup.get("/r").await.is_none());

        assert!(matches!(
            sup.stop("/r").await,
            Err(SupervisorError::PathNotWhitelisted(_))
        ));
        assert!(matches!(
            sup.worker_url("/r").await,
            Err(SupervisorError::PathNotWhitelisted(_))
        ));
    }

    #[tokio::test]
    async fn max_instances_is_enforced() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 1);

        sup.start("/p").await.expect("first worker starts");
        let err = sup.start("/q").await.expect_err("ceiling reached");
        assert!(matches!(err, SupervisorError::MaxInstancesReached(1)));

        // Stopping one frees the slot.
        sup.stop("/p").await.expect("stop");
        sup.start("/q").await.expect("slot freed");
    }

    #[tokio::test]
    async fn health_timeout_tears_down_and_releases_port() {
        let host = Arc::new(MockWorkerHost::default());
        host.unhealthy.store(true, Ordering::Relaxed);
        let sup = supervisor_with(&host, 2);

        let err = sup.start("/p").await.expect_err("health gate fails");
        assert!(matches!(err, SupervisorError::HealthTimeout(_)));

        let inst = sup.get("/p").await.expect("instance exists");
        assert_eq!(inst.status, WorkerStatus::Error);
        assert_eq!(inst.port, 0);
        assert!(inst.error.as_deref().is_some_and(|e| e.contains("health")));
        assert_eq!(host.stopped.lock().expect("lock").as_slice(), ["tether-worker-p"]);

        // The released port goes to the next start once workers are healthy
        // again.
        host.unhealthy.store(false, Ordering::Relaxed);
        let inst = sup.start("/q").await.expect("start /q");
        assert_eq!(inst.port, 4096);
    }

    #[tokio::test]
    async fn launch_failure_marks_error() {
        let host = Arc::new(MockWorkerHost::default());
        host.fail_start.store(true, Ordering::Relaxed);
        let sup = supervisor_with(&host, 2);

        let err = sup.start("/p").await.expect_err("launch fails");
        assert!(matches!(err, SupervisorError::Launch(_)));
        let inst = sup.get("/p").await.expect("instance exists");
        assert_eq!(inst.status, WorkerStatus::Error);
        assert!(inst.error.is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ports_are_reused_lowest_first() {
        // Start /p (4096) and /q (4097), stop /p, start /p again: the freed
        // lowest port comes back.
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        assert_eq!(sup.start("/p").await.expect("start /p").port, 4096);
        assert_eq!(sup.start("/q").await.expect("start /q").port, 4097);

        sup.stop("/p").await.expect("stop /p");
        sup.stop("/p").await.expect("stop again is a no-op");
        let inst = sup.get("/p").await.expect("instance exists");
        assert_eq!(inst.status, WorkerStatus::Stopped);
        assert_eq!(inst.port, 0);

        assert_eq!(sup.start("/p").await.expect("restart /p").port, 4096);
    }

    #[tokio::test]
    async fn refresh_status_recovers_from_crashed_worker() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        sup.start("/p").await.expect("start");
        host.crash_all();

        sup.refresh_status().await;
        let inst = sup.get("/p").await.expect("instance exists");
        assert_eq!(inst.status, WorkerStatus::Stopped);
        assert_eq!(inst.port, 0);

        // The port was released; a different project can take it.
        assert_eq!(sup.start("/q").await.expect("start /q").port, 4096);
    }

    #[tokio::test]
    async fn worker_url_requires_running() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        let err = sup.worker_url("/p").await.expect_err("not running yet");
        assert!(matches!(
            err,
            SupervisorError::NotRunning {
                status: WorkerStatus::Stopped,
                ..
            }
        ));

        sup.start("/p").await.expect("start");
        assert_eq!(
            sup.worker_url("/p").await.expect("running"),
            "http://localhost:4096"
        );
    }

    #[tokio::test]
    async fn get_or_start_url_starts_on_miss() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        let url = sup.get_or_start_url("/p").await.expect("starts on miss");
        assert_eq!(url, "http://localhost:4096");
        // Second call is the read-only fast path.
        let url = sup.get_or_start_url("/p").await.expect("fast path");
        assert_eq!(url, "http://localhost:4096");
        assert_eq!(host.started.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn list_is_ordered_and_running_paths_filters() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        let listed = sup.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, "/p");
        assert_eq!(listed[1].path, "/q");
        assert!(sup.running_paths().await.is_empty());

        sup.start("/q").await.expect("start /q");
        assert_eq!(sup.running_paths().await, vec!["/q"]);
    }

    #[tokio::test]
    async fn stop_all_clears_the_roster() {
        let host = Arc::new(MockWorkerHost::default());
        let sup = supervisor_with(&host, 2);

        sup.start("/p").await.expect("start /p");
        sup.start("/q").await.expect("start /q");
        sup.stop_all().await;

        assert!(sup.running_paths().await.is_empty());
        for inst in sup.list().await {
            assert_eq!(inst.status, WorkerStatus::Stopped);
            assert_eq!(inst.port, 0);
        }
    }
}
