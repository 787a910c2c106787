//! Pluggable worker launch methods.
//!
//! The supervisor doesn't care how a worker comes to exist, only that it
//! serves its HTTP API on the assigned port. Three launchers are provided:
//!
//! - [`ProcessLauncher`] — direct child process (default). Children are
//!   spawned in their own process group so a stop signal reaches the whole
//!   tree, with `kill_on_drop` as a backstop against orphans.
//! - [`DockerLauncher`] — a container named after the project, host network,
//!   project mounted at `/project`.
//! - [`TmuxLauncher`] — a detached tmux session named after the project.
//!
//! Stop is best-effort everywhere: a worker that is already gone is not an
//! error.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Prefix for container / session names, followed by the project basename.
pub const WORKER_NAME_PREFIX: &str = "tether-worker-";

/// Container / tmux-session / process-table name for a project.
pub fn instance_name(project_basename: &str) -> String {
    format!("{WORKER_NAME_PREFIX}{project_basename}")
}

/// Launch failures.
#[derive(Debug)]
pub enum LaunchError {
    /// The worker binary or tool could not be started.
    Spawn(String),
    /// The launch tool ran but reported failure.
    Command(String),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn(e) => write!(f, "failed to spawn worker: {e}"),
            LaunchError::Command(e) => write!(f, "launch command failed: {e}"),
        }
    }
}

/// Starts, stops, and observes worker processes by instance name.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker serving on `port` with `workdir` as its project root.
    async fn start(&self, name: &str, workdir: &str, port: u16) -> Result<(), LaunchError>;

    /// Tear the worker down. Must tolerate "worker already gone".
    async fn stop(&self, name: &str) -> Result<(), LaunchError>;

    /// Whether the external process still exists.
    async fn is_running(&self, name: &str) -> bool;
}

// ─── Direct child process ────────────────────────────────────────────────────

/// Runs workers as direct children of the agent.
pub struct ProcessLauncher {
    command: String,
    children: tokio::sync::Mutex<HashMap<String, Child>>,
}

/// Grace period between the interrupt signal and a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

impl ProcessLauncher {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            children: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn start(&self, name: &str, workdir: &str, port: u16) -> Result<(), LaunchError> {
        let mut children = self.children.lock().await;

        // A stale entry whose process already exited just gets replaced.
        if let Some(existing) = children.get_mut(name) {
            if matches!(existing.try_wait(), Ok(None)) {
                return Ok(());
            }
            children.remove(name);
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(["serve", "--port", &port.to_string()])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| LaunchError::Spawn(e.to_string()))?;
        info!(name, port, pid = ?child.id(), "Worker process started");
        children.insert(name.to_string(), child);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), LaunchError> {
        let mut children = self.children.lock().await;
        let Some(mut child) = children.remove(name) else {
            return Ok(()); // already gone
        };

        if let Some(pid) = child.id() {
            // Interrupt the whole process group, then give it a grace period.
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(-(pid as i32), libc::SIGINT);
            }
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {
                    info!(name, "Worker process exited");
                    return Ok(());
                }
                Err(_) => {
                    warn!(name, "Worker ignored SIGINT, killing");
                }
            }
        }

        let _ = child.start_kill();
        let _ = child.wait().await;
        info!(name, "Worker process killed");
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(name) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

// ─── Docker container ────────────────────────────────────────────────────────

/// Runs workers as docker containers on the host network.
pub struct DockerLauncher {
    image: String,
    command: String,
}

impl DockerLauncher {
    pub fn new(image: &str, command: &str) -> Self {
        Self {
            image: image.to_string(),
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for DockerLauncher {
    async fn start(&self, name: &str, workdir: &str, port: u16) -> Result<(), LaunchError> {
        // A container left over from a previous run is replaced.
        if container_exists(name).await {
            if run_tool("docker", &["start", name]).await.is_ok() {
                return Ok(());
            }
            let _ = self.stop(name).await;
        }

        let port_arg = port.to_string();
        let volume = format!("{workdir}:/project");
        run_tool(
            "docker",
            &[
                "run",
                "-d",
                "--network",
                "host",
                "--name",
                name,
                "-v",
                &volume,
                "-w",
                "/project",
                &self.image,
                &self.command,
                "serve",
                "--port",
                &port_arg,
            ],
        )
        .await?;
        info!(name, port, "Worker container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), LaunchError> {
        // Stop may fail because the container isn't running; removal decides.
        let _ = run_tool("docker", &["stop", name]).await;
        match run_tool("docker", &["rm", name]).await {
            Ok(_) => {
                info!(name, "Worker container removed");
                Ok(())
            }
            Err(LaunchError::Command(output)) if output.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, name: &str) -> bool {
        let filter = format!("name=^{name}$");
        match run_tool("docker", &["ps", "-q", "-f", &filter]).await {
            Ok(output) => !output.trim().is_empty(),
            Err(_) => false,
        }
    }
}

async fn container_exists(name: &str) -> bool {
    let filter = format!("name=^{name}$");
    match run_tool("docker", &["ps", "-a", "-q", "-f", &filter]).await {
        Ok(output) => !output.trim().is_empty(),
        Err(_) => false,
    }
}

// ─── tmux session ────────────────────────────────────────────────────────────

/// Runs workers inside detached tmux sessions, so a developer can attach to
/// a worker's terminal on the machine.
pub struct TmuxLauncher {
    command: String,
}

impl TmuxLauncher {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for TmuxLauncher {
    async fn start(&self, name: &str, workdir: &str, port: u16) -> Result<(), LaunchError> {
        let worker_cmd = format!("{} serve --port {port}", self.command);
        run_tool(
            "tmux",
            &["new-session", "-d", "-s", name, "-c", workdir, &worker_cmd],
        )
        .await?;
        info!(name, port, "Worker tmux session started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), LaunchError> {
        match run_tool("tmux", &["kill-session", "-t", name]).await {
            Ok(_) => Ok(()),
            Err(LaunchError::Command(output))
                if output.contains("no server running") || output.contains("session not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, name: &str) -> bool {
        run_tool("tmux", &["has-session", "-t", name]).await.is_ok()
    }
}

/// Run an external tool to completion, returning combined output on success
/// and [`LaunchError::Command`] with the output on a non-zero exit.
async fn run_tool(tool: &str, args: &[&str]) -> Result<String, LaunchError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| LaunchError::Spawn(format!("{tool}: {e}")))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if output.status.success() {
        Ok(combined)
    } else {
        Err(LaunchError::Command(combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names_carry_the_prefix() {
        assert_eq!(instance_name("app"), "tether-worker-app");
    }

    #[tokio::test]
    async fn process_stop_tolerates_absent_worker() {
        let launcher = ProcessLauncher::new("definitely-not-a-real-binary");
        launcher
            .stop("tether-worker-ghost")
            .await
            .expect("stop of unknown worker is a no-op");
        assert!(!launcher.is_running("tether-worker-ghost").await);
    }

    #[tokio::test]
    async fn process_start_surfaces_spawn_failure() {
        let launcher = ProcessLauncher::new("definitely-not-a-real-binary");
        let err = launcher
            .start("tether-worker-x", "/tmp", 4096)
            .await
            .expect_err("missing binary fails to spawn");
        assert!(matches!(err, LaunchError::Spawn(_)));
    }
}
