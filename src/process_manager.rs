use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::topology::InstanceId;

const LIVENESS_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub ready_timeout: Option<Duration>,
    pub terminate_grace: Duration,
    pub kill_wait: Duration,
}

impl ProcessSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        ProcessSettings {
            ready_timeout: config.client.ready_timeout_secs.map(Duration::from_secs),
            terminate_grace: Duration::from_secs(config.client.terminate_grace_secs),
            kill_wait: Duration::from_secs(config.client.kill_wait_secs),
        }
    }
}

pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub label: String,
    pub ready_marker: String,
}

/// Starts a process and waits until it prints its ready marker on stdout.
/// Returns the pid once the marker is seen, even when the process exits
/// right after printing it; the child is reaped in the background when it
/// eventually ends. Fails if the process ends without the marker or the
/// deadline passes, killing it in the latter case.
pub async fn spawn_ready(spec: SpawnSpec, ready_timeout: Option<Duration>) -> AgentResult<u32> {
    info!(
        "Spawning process '{}': {} {:?}",
        spec.label,
        spec.program.display(),
        spec.args
    );

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            AgentError::ProcessError(format!("Failed to spawn '{}': {}", spec.label, e))
        })?;

    let pid = child.id().ok_or_else(|| {
        AgentError::ProcessError(format!(
            "Process '{}' exited before a pid could be read",
            spec.label
        ))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::InternalError("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::InternalError("Failed to capture stderr".to_string()))?;

    let (ready_tx, mut ready_rx) = oneshot::channel();
    let label = spec.label.clone();
    let marker = spec.ready_marker.clone();
    tokio::spawn(async move {
        let mut ready_tx = Some(ready_tx);
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(" |{}| {}", label, line);
            if line.trim() == marker {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    });

    let label = spec.label.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(" |{}| {}", label, line);
        }
    });

    let wait_secs = ready_timeout.map(|d| d.as_secs()).unwrap_or(0);
    let deadline = async {
        match ready_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        outcome = &mut ready_rx => {
            if outcome.is_err() {
                let _ = child.kill().await;
                return Err(AgentError::ProcessError(format!(
                    "Process '{}' closed its output before signaling readiness",
                    spec.label
                )));
            }
        }
        status = child.wait() => {
            let status = status.map_err(|e| {
                AgentError::ProcessError(format!("Failed to wait on '{}': {}", spec.label, e))
            })?;
            // The reader drains stdout to EOF after exit and then fires or
            // drops the channel, so a marker printed just before the exit
            // still counts as ready.
            if ready_rx.await.is_err() {
                return Err(AgentError::ProcessError(format!(
                    "Process '{}' exited with {} before signaling readiness",
                    spec.label, status
                )));
            }
        }
        _ = deadline => {
            if ready_rx.try_recv().is_err() {
                let _ = child.kill().await;
                return Err(AgentError::ProcessError(format!(
                    "Process '{}' did not signal readiness within {}s",
                    spec.label, wait_secs
                )));
            }
        }
    }

    // Reaping keeps exited children from lingering as zombies, so checking
    // liveness by pid stays accurate.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("Process {} exited with {}", pid, status),
            Err(e) => warn!("Failed to reap process {}: {}", pid, e),
        }
    });

    info!("Process '{}' is ready with pid {}", spec.label, pid);
    Ok(pid)
}

/// Sends SIGTERM, waits up to `grace` for the process to exit, then
/// escalates to SIGKILL and waits up to `kill_wait`. A process that was
/// already gone counts as terminated.
pub async fn terminate(pid: u32, grace: Duration, kill_wait: Duration) -> AgentResult<()> {
    let target = Pid::from_raw(pid as i32);

    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            debug!("Process {} already exited", pid);
            return Ok(());
        }
        Err(e) => {
            return Err(AgentError::ProcessError(format!(
                "Failed to signal process {}: {}",
                pid, e
            )));
        }
    }

    if wait_for_exit(target, grace).await {
        debug!("Process {} exited after SIGTERM", pid);
        return Ok(());
    }

    warn!("Process {} survived SIGTERM, escalating to SIGKILL", pid);
    match kill(target, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => {
            return Err(AgentError::ProcessError(format!(
                "Failed to kill process {}: {}",
                pid, e
            )));
        }
    }

    if wait_for_exit(target, kill_wait).await {
        return Ok(());
    }

    Err(AgentError::ProcessError(format!(
        "Process {} is still alive after SIGKILL",
        pid
    )))
}

async fn wait_for_exit(pid: Pid, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if matches!(kill(pid, None), Err(Errno::ESRCH)) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }
}

/// Spawns and destroys client processes under instance directories.
pub struct ProcessManager {
    config: Arc<AgentConfig>,
    settings: ProcessSettings,
}

impl ProcessManager {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let settings = ProcessSettings::from_config(&config);
        ProcessManager { config, settings }
    }

    /// Launches the client runtime against the library directory that was
    /// previously transferred for this client. Returns the pid once the
    /// client reports ready.
    pub async fn spawn_client(
        &self,
        instance_id: &InstanceId,
        client_name: &str,
    ) -> AgentResult<u32> {
        let client_root = self.config.storage.client_root(instance_id, client_name);
        let lib_dir = client_root.join("lib");
        let search_path = self.build_search_path(&lib_dir, instance_id, client_name).await?;

        info!("Spawning client '{}' for instance {}", client_name, instance_id);
        let spec = SpawnSpec {
            program: self.config.client.runtime.clone(),
            args: vec![
                "--lib-path".to_string(),
                search_path,
                "--node-name".to_string(),
                client_name.to_string(),
                "--root-dir".to_string(),
                self.config.storage.root_dir.display().to_string(),
            ],
            working_dir: client_root,
            label: client_name.to_string(),
            ready_marker: self.config.client.ready_marker.clone(),
        };

        let pid = spawn_ready(spec, self.settings.ready_timeout)
            .await
            .map_err(|e| {
                AgentError::ProcessError(format!("Error spawning client '{}': {}", client_name, e))
            })?;

        info!("Spawned client '{}' with pid {}", client_name, pid);
        Ok(pid)
    }

    async fn build_search_path(
        &self,
        lib_dir: &Path,
        instance_id: &InstanceId,
        client_name: &str,
    ) -> AgentResult<String> {
        let mut entries = tokio::fs::read_dir(lib_dir).await.map_err(|_| {
            AgentError::ProcessError(format!(
                "No client code to spawn from instance {} and client '{}'",
                instance_id, client_name
            ))
        })?;

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            parts.push(entry.path().display().to_string());
        }
        if parts.is_empty() {
            return Err(AgentError::ProcessError(format!(
                "No client code to spawn from instance {} and client '{}'",
                instance_id, client_name
            )));
        }
        parts.sort();
        Ok(parts.join(":"))
    }

    /// Terminates a spawned client and removes its working directory.
    /// Termination failure and directory removal failure are reported as
    /// separate errors.
    pub async fn destroy_client(
        &self,
        instance_id: &InstanceId,
        client_name: &str,
        pid: u32,
    ) -> AgentResult<()> {
        info!("Killing client '{}' with pid {}", client_name, pid);
        terminate(pid, self.settings.terminate_grace, self.settings.kill_wait)
            .await
            .map_err(|e| {
                AgentError::ProcessError(format!(
                    "Failed to terminate client '{}' with pid {}: {}",
                    client_name, pid, e
                ))
            })?;

        let client_root = self.config.storage.client_root(instance_id, client_name);
        info!(
            "Cleaning up directory {} of client '{}'",
            client_root.display(),
            client_name
        );
        match tokio::fs::remove_dir_all(&client_root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::FileSystemError(format!(
                "Client '{}' terminated but its directory {} could not be removed: {}",
                client_name,
                client_root.display(),
                e
            ))),
        }
    }
}
