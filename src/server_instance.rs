use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::errors::{AgentError, AgentResult};
use crate::process_manager::{spawn_ready, terminate, ProcessSettings, SpawnSpec};
use crate::topology::License;

const SERVER_LAUNCHER: &str = "server/bin/start-server";
const SERVER_READY_MARKER: &str = "Server startup complete";
const CONSOLE_LAUNCHER: &str = "management/bin/start-console";
const CONSOLE_READY_MARKER: &str = "Management console started";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotInstalled,
    Stopped,
    Starting,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleState {
    NotInstalled,
    Stopped,
    Starting,
    Started,
}

/// Handle on one clustered server installed from a kit. Start and stop are
/// serialized per handle; state reads never block on them.
#[derive(Clone)]
pub struct ServerInstance {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    name: String,
    hostname: String,
    install_dir: PathBuf,
    settings: ProcessSettings,
    state: Mutex<ServerState>,
    process: AsyncMutex<Option<u32>>,
}

impl ServerInstance {
    pub fn new(
        name: String,
        hostname: String,
        install_dir: PathBuf,
        settings: ProcessSettings,
    ) -> Self {
        ServerInstance {
            inner: Arc::new(ServerInner {
                name,
                hostname,
                install_dir,
                settings,
                state: Mutex::new(ServerState::Stopped),
                process: AsyncMutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    pub async fn start(&self) -> AgentResult<()> {
        let mut process = self.inner.process.lock().await;
        if process.is_some() {
            warn!("Server '{}' is already running", self.inner.name);
            return Ok(());
        }

        *self.inner.state.lock() = ServerState::Starting;
        let spec = SpawnSpec {
            program: self.inner.install_dir.join(SERVER_LAUNCHER),
            args: vec![
                "-n".to_string(),
                self.inner.name.clone(),
                "-s".to_string(),
                self.inner.hostname.clone(),
            ],
            working_dir: self.inner.install_dir.clone(),
            label: self.inner.name.clone(),
            ready_marker: SERVER_READY_MARKER.to_string(),
        };

        match spawn_ready(spec, self.inner.settings.ready_timeout).await {
            Ok(pid) => {
                *process = Some(pid);
                *self.inner.state.lock() = ServerState::Started;
                info!("Server '{}' started with pid {}", self.inner.name, pid);
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ServerState::Stopped;
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> AgentResult<()> {
        let mut process = self.inner.process.lock().await;
        let Some(pid) = process.take() else {
            *self.inner.state.lock() = ServerState::Stopped;
            return Ok(());
        };

        if let Err(e) = terminate(
            pid,
            self.inner.settings.terminate_grace,
            self.inner.settings.kill_wait,
        )
        .await
        {
            *process = Some(pid);
            return Err(e);
        }

        *self.inner.state.lock() = ServerState::Stopped;
        info!("Server '{}' stopped", self.inner.name);
        Ok(())
    }

    pub async fn configure_license(&self, license: &License) -> AgentResult<()> {
        let license_dir = self.inner.install_dir.join("license");
        fs::create_dir_all(&license_dir).await?;
        let license_path = license_dir.join(&license.name);
        fs::write(&license_path, &license.content).await.map_err(|e| {
            AgentError::InstallationError(format!(
                "Failed to configure license {}: {}",
                license_path.display(),
                e
            ))
        })?;
        info!(
            "Configured license '{}' for server '{}'",
            license.name, self.inner.name
        );
        Ok(())
    }
}

/// Handle on the management console of an installation. At most one exists
/// per instance.
#[derive(Clone)]
pub struct ConsoleInstance {
    inner: Arc<ConsoleInner>,
}

struct ConsoleInner {
    hostname: String,
    install_dir: PathBuf,
    settings: ProcessSettings,
    state: Mutex<ConsoleState>,
    process: AsyncMutex<Option<u32>>,
}

impl ConsoleInstance {
    pub fn new(hostname: String, install_dir: PathBuf, settings: ProcessSettings) -> Self {
        ConsoleInstance {
            inner: Arc::new(ConsoleInner {
                hostname,
                install_dir,
                settings,
                state: Mutex::new(ConsoleState::Stopped),
                process: AsyncMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConsoleState {
        *self.inner.state.lock()
    }

    pub async fn start(&self) -> AgentResult<()> {
        let mut process = self.inner.process.lock().await;
        if process.is_some() {
            warn!("Console on '{}' is already running", self.inner.hostname);
            return Ok(());
        }

        *self.inner.state.lock() = ConsoleState::Starting;
        let spec = SpawnSpec {
            program: self.inner.install_dir.join(CONSOLE_LAUNCHER),
            args: vec!["-s".to_string(), self.inner.hostname.clone()],
            working_dir: self.inner.install_dir.clone(),
            label: format!("console@{}", self.inner.hostname),
            ready_marker: CONSOLE_READY_MARKER.to_string(),
        };

        match spawn_ready(spec, self.inner.settings.ready_timeout).await {
            Ok(pid) => {
                *process = Some(pid);
                *self.inner.state.lock() = ConsoleState::Started;
                info!("Console on '{}' started with pid {}", self.inner.hostname, pid);
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ConsoleState::Stopped;
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> AgentResult<()> {
        let mut process = self.inner.process.lock().await;
        let Some(pid) = process.take() else {
            *self.inner.state.lock() = ConsoleState::Stopped;
            return Ok(());
        };

        if let Err(e) = terminate(
            pid,
            self.inner.settings.terminate_grace,
            self.inner.settings.kill_wait,
        )
        .await
        {
            *process = Some(pid);
            return Err(e);
        }

        *self.inner.state.lock() = ConsoleState::Stopped;
        info!("Console on '{}' stopped", self.inner.hostname);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    use super::*;

    fn test_settings() -> ProcessSettings {
        ProcessSettings {
            ready_timeout: Some(Duration::from_secs(5)),
            terminate_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
        }
    }

    fn write_launcher(install_dir: &Path, relative: &str, body: &str) {
        let path = install_dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[tokio::test]
    async fn server_lifecycle_start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        write_launcher(
            dir.path(),
            SERVER_LAUNCHER,
            "#!/bin/sh\necho \"Server startup complete\"\nexec sleep 30\n",
        );

        let server = ServerInstance::new(
            "Server1".to_string(),
            "localhost".to_string(),
            dir.path().to_path_buf(),
            test_settings(),
        );

        assert_eq!(server.state(), ServerState::Stopped);
        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Started);
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn failed_start_leaves_the_server_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerInstance::new(
            "Server1".to_string(),
            "localhost".to_string(),
            dir.path().to_path_buf(),
            test_settings(),
        );

        assert!(server.start().await.is_err());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerInstance::new(
            "Server1".to_string(),
            "localhost".to_string(),
            dir.path().to_path_buf(),
            test_settings(),
        );
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn configure_license_writes_into_the_install() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerInstance::new(
            "Server1".to_string(),
            "localhost".to_string(),
            dir.path().to_path_buf(),
            test_settings(),
        );

        let license = License {
            name: "cluster.key".to_string(),
            content: "licensed".to_string(),
        };
        server.configure_license(&license).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("license/cluster.key")).unwrap();
        assert_eq!(written, "licensed");
    }

    #[tokio::test]
    async fn console_lifecycle_start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        write_launcher(
            dir.path(),
            CONSOLE_LAUNCHER,
            "#!/bin/sh\necho \"Management console started\"\nexec sleep 30\n",
        );

        let console = ConsoleInstance::new(
            "localhost".to_string(),
            dir.path().to_path_buf(),
            test_settings(),
        );

        assert_eq!(console.state(), ConsoleState::Stopped);
        console.start().await.unwrap();
        assert_eq!(console.state(), ConsoleState::Started);
        console.stop().await.unwrap();
        assert_eq!(console.state(), ConsoleState::Stopped);
    }
}
