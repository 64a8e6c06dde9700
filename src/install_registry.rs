use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::errors::{AgentError, AgentResult};
use crate::kit_manager::KitProvider;
use crate::process_manager::ProcessSettings;
use crate::server_instance::{ConsoleInstance, ServerInstance};
use crate::topology::{ConfigDescriptor, Distribution, InstanceId, License, ServerSpec, Topology};

/// One kit installation shared by every server and console of an instance
/// on this node. It can be deleted exactly when nothing occupies it.
pub struct KitInstallation {
    location: PathBuf,
    servers: HashMap<String, ServerInstance>,
    console: Option<ConsoleInstance>,
}

impl KitInstallation {
    fn new(location: PathBuf) -> Self {
        KitInstallation {
            location,
            servers: HashMap::new(),
            console: None,
        }
    }

    fn deletable(&self) -> bool {
        self.servers.is_empty() && self.console.is_none()
    }

    fn occupancy(&self) -> usize {
        self.servers.len() + usize::from(self.console.is_some())
    }
}

#[derive(Default)]
struct SlotState {
    installation: Option<KitInstallation>,
    // Set when the installation was deleted; a stale handle that still
    // reaches this slot must re-fetch instead of resurrecting it.
    retired: bool,
}

type Slot = Arc<AsyncMutex<SlotState>>;

/// Tracks kit installations per instance id. All mutations of one instance
/// are serialized on its slot, so overlapping installs acquire the kit once
/// and overlapping uninstalls delete it once.
pub struct InstallRegistry {
    slots: Mutex<HashMap<InstanceId, Slot>>,
    kits: Arc<dyn KitProvider>,
    settings: ProcessSettings,
}

impl InstallRegistry {
    pub fn new(kits: Arc<dyn KitProvider>, settings: ProcessSettings) -> Self {
        InstallRegistry {
            slots: Mutex::new(HashMap::new()),
            kits,
            settings,
        }
    }

    async fn lock_slot(&self, instance_id: &InstanceId) -> OwnedMutexGuard<SlotState> {
        loop {
            let slot = {
                let mut slots = self.slots.lock();
                slots
                    .entry(instance_id.clone())
                    .or_insert_with(Slot::default)
                    .clone()
            };
            let guard = slot.clone().lock_owned().await;
            if !guard.retired {
                return guard;
            }
            drop(guard);
            self.discard_if_current(instance_id, &slot);
        }
    }

    /// Lock without creating a slot; `None` means the instance has no
    /// installation.
    async fn read_slot(&self, instance_id: &InstanceId) -> Option<OwnedMutexGuard<SlotState>> {
        loop {
            let slot = self.slots.lock().get(instance_id).cloned()?;
            let guard = slot.clone().lock_owned().await;
            if !guard.retired {
                return Some(guard);
            }
            drop(guard);
            self.discard_if_current(instance_id, &slot);
        }
    }

    fn discard_if_current(&self, instance_id: &InstanceId, slot: &Slot) {
        let mut slots = self.slots.lock();
        if let Some(current) = slots.get(instance_id) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(instance_id);
            }
        }
    }

    /// Installs the kit for one clustered server, reusing the instance's
    /// installation when it already exists. Repeated calls for the same
    /// server are idempotent.
    pub async fn install_server(
        &self,
        instance_id: &InstanceId,
        topology: &Topology,
        server: &ServerSpec,
        offline: bool,
        license: Option<&License>,
        config_index: usize,
    ) -> AgentResult<()> {
        let mut state = self.lock_slot(instance_id).await;
        let result = self
            .install_server_locked(
                &mut state,
                instance_id,
                topology,
                server,
                offline,
                license,
                config_index,
            )
            .await;
        // A failure that installed nothing must not leave an empty slot in
        // the map.
        if result.is_err() && state.installation.is_none() {
            self.retire(&mut state, instance_id);
        }
        result
    }

    async fn install_server_locked(
        &self,
        state: &mut SlotState,
        instance_id: &InstanceId,
        topology: &Topology,
        server: &ServerSpec,
        offline: bool,
        license: Option<&License>,
        config_index: usize,
    ) -> AgentResult<()> {
        if let Some(install) = state.installation.as_mut() {
            if install.servers.contains_key(&server.name) {
                info!("Kit for server '{}' already installed", server.name);
                return Ok(());
            }
            info!(
                "Kit for instance {} already installed, adding server '{}'",
                instance_id, server.name
            );
            let handle = ServerInstance::new(
                server.name.clone(),
                server.hostname.clone(),
                install.location.clone(),
                self.settings.clone(),
            );
            install.servers.insert(server.name.clone(), handle);
            return Ok(());
        }

        info!(
            "Installing kit for instance {} and server '{}'",
            instance_id, server.name
        );
        let location = self
            .kits
            .acquire_kit(
                instance_id,
                &topology.distribution,
                topology.kit_path.as_deref(),
                license,
                offline,
            )
            .await?;

        write_configs(&location, &topology.configs, config_index).await?;

        let mut install = KitInstallation::new(location.clone());
        let handle = ServerInstance::new(
            server.name.clone(),
            server.hostname.clone(),
            location,
            self.settings.clone(),
        );
        install.servers.insert(server.name.clone(), handle);
        state.installation = Some(install);
        Ok(())
    }

    /// Installs the management console into the instance's installation,
    /// sharing it with any servers already present.
    pub async fn install_console(
        &self,
        instance_id: &InstanceId,
        hostname: &str,
        distribution: &Distribution,
        kit_path: Option<&Path>,
        license: Option<&License>,
    ) -> AgentResult<()> {
        let mut state = self.lock_slot(instance_id).await;
        let result = self
            .install_console_locked(
                &mut state,
                instance_id,
                hostname,
                distribution,
                kit_path,
                license,
            )
            .await;
        if result.is_err() && state.installation.is_none() {
            self.retire(&mut state, instance_id);
        }
        result
    }

    async fn install_console_locked(
        &self,
        state: &mut SlotState,
        instance_id: &InstanceId,
        hostname: &str,
        distribution: &Distribution,
        kit_path: Option<&Path>,
        license: Option<&License>,
    ) -> AgentResult<()> {
        if let Some(install) = state.installation.as_mut() {
            if install.console.is_some() {
                info!("Kit for console on '{}' already installed", hostname);
                return Ok(());
            }
            info!(
                "Kit for instance {} already installed, adding console on '{}'",
                instance_id, hostname
            );
            let handle = ConsoleInstance::new(
                hostname.to_string(),
                install.location.clone(),
                self.settings.clone(),
            );
            install.console = Some(handle);
            return Ok(());
        }

        info!(
            "Installing kit for instance {} and console on '{}'",
            instance_id, hostname
        );
        let location = self
            .kits
            .acquire_kit(instance_id, distribution, kit_path, license, false)
            .await?;

        let mut install = KitInstallation::new(location.clone());
        install.console = Some(ConsoleInstance::new(
            hostname.to_string(),
            location,
            self.settings.clone(),
        ));
        state.installation = Some(install);
        Ok(())
    }

    /// Releases one server's hold on the installation and deletes the kit
    /// when neither servers nor a console remain. Returns how many servers
    /// still hold it.
    pub async fn uninstall_server(
        &self,
        instance_id: &InstanceId,
        server_name: &str,
    ) -> AgentResult<usize> {
        let mut state = self.lock_slot(instance_id).await;

        let (remaining, deletable_location) = match state.installation.as_mut() {
            None => {
                info!("No installed kit for instance {}", instance_id);
                self.retire(&mut state, instance_id);
                return Ok(0);
            }
            Some(install) => {
                // Removing an absent server is a no-op, so a retry after a
                // failed deletion reaches the delete branch again.
                install.servers.remove(server_name);
                let remaining = install.servers.len();
                if install.deletable() {
                    (remaining, Some(install.location.clone()))
                } else {
                    info!(
                        "Kit install still in use by {} occupants",
                        install.occupancy()
                    );
                    (remaining, None)
                }
            }
        };

        if let Some(location) = deletable_location {
            info!("Uninstalling kit for instance {}", instance_id);
            self.kits.delete_install(&location).await?;
            state.installation = None;
            self.retire(&mut state, instance_id);
            info!("Deleted kit installation at {}", location.display());
        }

        Ok(remaining)
    }

    /// Releases the console's hold on the installation, symmetric to
    /// `uninstall_server`. Returns how many servers still hold it.
    pub async fn uninstall_console(&self, instance_id: &InstanceId) -> AgentResult<usize> {
        let mut state = self.lock_slot(instance_id).await;

        let (remaining, deletable_location) = match state.installation.as_mut() {
            None => {
                info!("No installed kit for instance {}", instance_id);
                self.retire(&mut state, instance_id);
                return Ok(0);
            }
            Some(install) => {
                install.console = None;
                let remaining = install.servers.len();
                if install.deletable() {
                    (remaining, Some(install.location.clone()))
                } else {
                    info!("Kit install still in use by {} servers", remaining);
                    (remaining, None)
                }
            }
        };

        if let Some(location) = deletable_location {
            info!("Uninstalling kit for instance {}", instance_id);
            self.kits.delete_install(&location).await?;
            state.installation = None;
            self.retire(&mut state, instance_id);
            info!("Deleted kit installation at {}", location.display());
        }

        Ok(remaining)
    }

    /// Marks the locked slot dead and removes it from the map so stale
    /// handles re-fetch. The caller holds the slot's guard, so the map entry
    /// still points at this slot.
    fn retire(&self, state: &mut SlotState, instance_id: &InstanceId) {
        state.retired = true;
        self.slots.lock().remove(instance_id);
        debug!("Dropped registry slot for instance {}", instance_id);
    }

    pub async fn server(
        &self,
        instance_id: &InstanceId,
        server_name: &str,
    ) -> Option<ServerInstance> {
        let state = self.read_slot(instance_id).await?;
        state
            .installation
            .as_ref()
            .and_then(|install| install.servers.get(server_name).cloned())
    }

    pub async fn console(&self, instance_id: &InstanceId) -> Option<ConsoleInstance> {
        let state = self.read_slot(instance_id).await?;
        state
            .installation
            .as_ref()
            .and_then(|install| install.console.clone())
    }

    pub async fn server_count(&self, instance_id: &InstanceId) -> usize {
        match self.read_slot(instance_id).await {
            Some(state) => state
                .installation
                .as_ref()
                .map(|install| install.servers.len())
                .unwrap_or(0),
            None => 0,
        }
    }

    pub async fn console_present(&self, instance_id: &InstanceId) -> bool {
        match self.read_slot(instance_id).await {
            Some(state) => state
                .installation
                .as_ref()
                .map(|install| install.console.is_some())
                .unwrap_or(false),
            None => false,
        }
    }

    pub async fn install_location(&self, instance_id: &InstanceId) -> Option<PathBuf> {
        let state = self.read_slot(instance_id).await?;
        state
            .installation
            .as_ref()
            .map(|install| install.location.clone())
    }
}

async fn write_configs(
    install_dir: &Path,
    configs: &[ConfigDescriptor],
    config_index: usize,
) -> AgentResult<()> {
    for descriptor in configs {
        let rendered = descriptor.render(install_dir, config_index);
        let path = install_dir.join(&descriptor.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, rendered).await.map_err(|e| {
            AgentError::InstallationError(format!(
                "Failed to write config {}: {}",
                path.display(),
                e
            ))
        })?;
        info!("Config installed at {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::kit_manager::test_support::MockKitProvider;

    fn test_settings() -> ProcessSettings {
        ProcessSettings {
            ready_timeout: Some(Duration::from_secs(1)),
            terminate_grace: Duration::from_secs(1),
            kill_wait: Duration::from_secs(1),
        }
    }

    fn topology() -> Topology {
        Topology {
            distribution: Distribution {
                version: "10.7.0".to_string(),
                archive: "kit-10.7.0.tar.gz".to_string(),
                url: None,
            },
            servers: vec![
                ServerSpec {
                    name: "Server1".to_string(),
                    hostname: "localhost".to_string(),
                },
                ServerSpec {
                    name: "Server2".to_string(),
                    hostname: "localhost".to_string(),
                },
            ],
            configs: vec![ConfigDescriptor {
                path: "conf/cluster.xml".to_string(),
                content: "<logs>{{INSTALL_DIR}}/logs-{{CONFIG_INDEX}}</logs>".to_string(),
            }],
            kit_path: None,
        }
    }

    fn registry(provider: &Arc<MockKitProvider>) -> InstallRegistry {
        InstallRegistry::new(provider.clone() as Arc<dyn KitProvider>, test_settings())
    }

    async fn install(registry: &InstallRegistry, instance_id: &InstanceId, server: &str) {
        let topology = topology();
        let spec = topology.server(server).unwrap().clone();
        registry
            .install_server(instance_id, &topology, &spec, false, None, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_servers_share_one_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;
        install(&registry, &instance_id, "Server2").await;

        assert_eq!(provider.acquired_count(), 1);
        assert_eq!(registry.server_count(&instance_id).await, 2);
    }

    #[tokio::test]
    async fn repeated_install_of_the_same_server_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;
        install(&registry, &instance_id, "Server1").await;

        assert_eq!(provider.acquired_count(), 1);
        assert_eq!(registry.server_count(&instance_id).await, 1);
    }

    #[tokio::test]
    async fn installation_survives_until_the_last_occupant_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;
        install(&registry, &instance_id, "Server2").await;

        assert_eq!(registry.uninstall_server(&instance_id, "Server1").await.unwrap(), 1);
        assert_eq!(provider.deleted_count(), 0);
        assert!(registry.server(&instance_id, "Server2").await.is_some());

        assert_eq!(registry.uninstall_server(&instance_id, "Server2").await.unwrap(), 0);
        assert_eq!(provider.deleted_count(), 1);
        assert!(registry.server(&instance_id, "Server2").await.is_none());
    }

    #[tokio::test]
    async fn console_presence_blocks_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");
        let topology = topology();

        install(&registry, &instance_id, "Server1").await;
        registry
            .install_console(&instance_id, "localhost", &topology.distribution, None, None)
            .await
            .unwrap();

        assert_eq!(provider.acquired_count(), 1);
        assert_eq!(registry.uninstall_server(&instance_id, "Server1").await.unwrap(), 0);
        assert_eq!(provider.deleted_count(), 0);
        assert!(registry.console_present(&instance_id).await);

        assert_eq!(registry.uninstall_console(&instance_id).await.unwrap(), 0);
        assert_eq!(provider.deleted_count(), 1);
        assert!(!registry.console_present(&instance_id).await);
    }

    #[tokio::test]
    async fn failed_deletion_keeps_the_entry_and_a_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;
        provider.fail_next_delete.store(true, Ordering::SeqCst);

        assert!(registry.uninstall_server(&instance_id, "Server1").await.is_err());
        assert_eq!(provider.deleted_count(), 0);
        assert!(registry.install_location(&instance_id).await.is_some());

        assert_eq!(registry.uninstall_server(&instance_id, "Server1").await.unwrap(), 0);
        assert_eq!(provider.deleted_count(), 1);
        assert!(registry.install_location(&instance_id).await.is_none());
    }

    #[tokio::test]
    async fn uninstall_of_an_unknown_instance_is_a_no_op_and_keeps_no_slot() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);

        let remaining = registry
            .uninstall_server(&InstanceId::new("missing"), "Server1")
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(provider.deleted_count(), 0);
        assert!(registry.slots.lock().is_empty());

        registry
            .uninstall_console(&InstanceId::new("also-missing"))
            .await
            .unwrap();
        assert!(registry.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_install_does_not_leave_an_empty_slot() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");
        let topology = topology();
        let spec = topology.server("Server1").unwrap().clone();

        provider.fail_next_acquire.store(true, Ordering::SeqCst);
        assert!(registry
            .install_server(&instance_id, &topology, &spec, false, None, 0)
            .await
            .is_err());
        assert!(registry.slots.lock().is_empty());

        // A retry after the failure installs normally.
        install(&registry, &instance_id, "Server1").await;
        assert_eq!(registry.server_count(&instance_id).await, 1);
    }

    #[tokio::test]
    async fn reinstall_after_full_teardown_acquires_a_fresh_kit() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;
        registry.uninstall_server(&instance_id, "Server1").await.unwrap();
        install(&registry, &instance_id, "Server1").await;

        assert_eq!(provider.acquired_count(), 2);
        assert_eq!(registry.server_count(&instance_id).await, 1);
    }

    #[tokio::test]
    async fn concurrent_uninstalls_delete_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = Arc::new(registry(&provider));
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;
        install(&registry, &instance_id, "Server2").await;

        let first = {
            let registry = registry.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move { registry.uninstall_server(&instance_id, "Server1").await })
        };
        let second = {
            let registry = registry.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move { registry.uninstall_server(&instance_id, "Server2").await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(provider.deleted_count(), 1);
        assert_eq!(registry.server_count(&instance_id).await, 0);
    }

    #[tokio::test]
    async fn writes_rendered_configs_into_a_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockKitProvider::new(dir.path()));
        let registry = registry(&provider);
        let instance_id = InstanceId::new("T1");

        install(&registry, &instance_id, "Server1").await;

        let location = registry.install_location(&instance_id).await.unwrap();
        let config = std::fs::read_to_string(location.join("conf/cluster.xml")).unwrap();
        assert!(config.contains(&format!("{}/logs-0", location.display())));
    }
}
