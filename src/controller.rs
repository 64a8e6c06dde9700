use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::file_transfer::{channel_key, TransferHub};
use crate::install_registry::InstallRegistry;
use crate::kit_manager::KitProvider;
use crate::process_manager::{ProcessManager, ProcessSettings};
use crate::server_instance::{ConsoleInstance, ConsoleState, ServerInstance, ServerState};
use crate::topology::{Distribution, InstanceId, License, Topology};

/// Everything the driver can ask this node to do, behind one facade.
/// Action operations fail loudly; state queries never do.
pub struct AgentController {
    config: Arc<AgentConfig>,
    registry: InstallRegistry,
    processes: ProcessManager,
    transfers: Arc<TransferHub>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub servers: usize,
    pub console: bool,
    pub install_dir: Option<String>,
}

impl AgentController {
    pub fn new(
        config: Arc<AgentConfig>,
        kits: Arc<dyn KitProvider>,
        transfers: Arc<TransferHub>,
    ) -> Self {
        let settings = ProcessSettings::from_config(&config);
        AgentController {
            registry: InstallRegistry::new(kits, settings),
            processes: ProcessManager::new(config.clone()),
            transfers,
            config,
        }
    }

    pub async fn install_server(
        &self,
        instance_id: &InstanceId,
        topology: &Topology,
        server_name: &str,
        offline: bool,
        license: Option<&License>,
        config_index: usize,
    ) -> AgentResult<()> {
        let server = topology.server(server_name).ok_or_else(|| {
            AgentError::InvalidRequest(format!(
                "Server '{}' is not part of the topology",
                server_name
            ))
        })?;
        self.registry
            .install_server(instance_id, topology, server, offline, license, config_index)
            .await
    }

    pub async fn install_console(
        &self,
        instance_id: &InstanceId,
        hostname: &str,
        distribution: &Distribution,
        kit_path: Option<&Path>,
        license: Option<&License>,
    ) -> AgentResult<()> {
        self.registry
            .install_console(instance_id, hostname, distribution, kit_path, license)
            .await
    }

    pub async fn uninstall_server(
        &self,
        instance_id: &InstanceId,
        server_name: &str,
    ) -> AgentResult<usize> {
        self.registry.uninstall_server(instance_id, server_name).await
    }

    pub async fn uninstall_console(&self, instance_id: &InstanceId) -> AgentResult<usize> {
        self.registry.uninstall_console(instance_id).await
    }

    pub async fn start_server(&self, instance_id: &InstanceId, server_name: &str) -> AgentResult<()> {
        let server = self.server_handle(instance_id, server_name).await?;
        info!("Starting server '{}'", server.name());
        server.start().await
    }

    pub async fn stop_server(&self, instance_id: &InstanceId, server_name: &str) -> AgentResult<()> {
        let server = self.server_handle(instance_id, server_name).await?;
        info!("Stopping server '{}'", server.name());
        server.stop().await
    }

    /// Never fails: an unknown instance or server reads as not installed.
    pub async fn server_state(&self, instance_id: &InstanceId, server_name: &str) -> ServerState {
        match self.registry.server(instance_id, server_name).await {
            Some(server) => server.state(),
            None => ServerState::NotInstalled,
        }
    }

    pub async fn start_console(&self, instance_id: &InstanceId) -> AgentResult<()> {
        self.console_handle(instance_id).await?.start().await
    }

    pub async fn stop_console(&self, instance_id: &InstanceId) -> AgentResult<()> {
        self.console_handle(instance_id).await?.stop().await
    }

    /// Never fails: an unknown instance reads as not installed.
    pub async fn console_state(&self, instance_id: &InstanceId) -> ConsoleState {
        match self.registry.console(instance_id).await {
            Some(console) => console.state(),
            None => ConsoleState::NotInstalled,
        }
    }

    pub async fn configure_license(
        &self,
        instance_id: &InstanceId,
        server_name: &str,
        license: &License,
    ) -> AgentResult<()> {
        let server = self.server_handle(instance_id, server_name).await?;
        server.configure_license(license).await
    }

    pub async fn spawn_client(
        &self,
        instance_id: &InstanceId,
        client_name: &str,
    ) -> AgentResult<u32> {
        self.processes.spawn_client(instance_id, client_name).await
    }

    pub async fn destroy_client(
        &self,
        instance_id: &InstanceId,
        client_name: &str,
        pid: u32,
    ) -> AgentResult<()> {
        self.processes.destroy_client(instance_id, client_name, pid).await
    }

    /// Drains the client's transfer channel into its library directory.
    /// Blocks until the sender finishes or breaks the protocol.
    pub async fn download_client(
        &self,
        instance_id: &InstanceId,
        client_name: &str,
    ) -> AgentResult<()> {
        let lib_dir = self.config.storage.client_lib_dir(instance_id, client_name);
        let channel = channel_key(instance_id, client_name);

        info!("Downloading client '{}' into {}", client_name, lib_dir.display());
        self.transfers
            .receive_tree(&channel, &lib_dir)
            .await
            .map_err(|e| {
                AgentError::ProtocolError(format!(
                    "Cannot download client '{}': {}",
                    client_name, e
                ))
            })?;
        info!("Downloaded client '{}' into {}", client_name, lib_dir.display());
        Ok(())
    }

    /// Removes the whole instance directory, clients included. Installed
    /// kits live elsewhere and are governed by uninstall.
    pub async fn cleanup(&self, instance_id: &InstanceId) -> AgentResult<()> {
        let instance_root = self.config.storage.instance_root(instance_id);
        info!("Cleaning up instance {}", instance_id);
        match fs::remove_dir_all(&instance_root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::FileSystemError(format!(
                "Error cleaning up instance root directory {}: {}",
                instance_root.display(),
                e
            ))),
        }
    }

    pub async fn instance_status(&self, instance_id: &InstanceId) -> InstanceStatus {
        InstanceStatus {
            servers: self.registry.server_count(instance_id).await,
            console: self.registry.console_present(instance_id).await,
            install_dir: self
                .registry
                .install_location(instance_id)
                .await
                .map(|location| location.display().to_string()),
        }
    }

    async fn server_handle(
        &self,
        instance_id: &InstanceId,
        server_name: &str,
    ) -> AgentResult<ServerInstance> {
        self.registry.server(instance_id, server_name).await.ok_or_else(|| {
            AgentError::NotFound(format!(
                "No server '{}' installed for instance {}",
                server_name, instance_id
            ))
        })
    }

    async fn console_handle(&self, instance_id: &InstanceId) -> AgentResult<ConsoleInstance> {
        self.registry.console(instance_id).await.ok_or_else(|| {
            AgentError::NotFound(format!(
                "No console installed for instance {}",
                instance_id
            ))
        })
    }
}
