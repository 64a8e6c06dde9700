use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::topology::InstanceId;

/// Line printed on stdout once the agent accepts commands. A parent agent
/// spawning this process as a remote client watches for it.
pub const AGENT_READY_MARKER: &str = "Agent started, ready for commands";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub driver: DriverConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    pub url: String,
    pub node_id: String,
    pub secret: String,
    pub hostname: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("url", &self.url)
            .field("node_id", &self.node_id)
            .field("secret", &"[REDACTED]")
            .field("hostname", &self.hostname)
            .field("local_port", &self.local_port)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
}

impl StorageConfig {
    pub fn instances_dir(&self) -> PathBuf {
        self.root_dir.join("instances")
    }

    pub fn kits_dir(&self) -> PathBuf {
        self.root_dir.join("kits")
    }

    pub fn kit_cache_dir(&self) -> PathBuf {
        self.root_dir.join("kit-cache")
    }

    pub fn instance_root(&self, instance_id: &InstanceId) -> PathBuf {
        self.instances_dir().join(instance_id.as_str())
    }

    pub fn client_root(&self, instance_id: &InstanceId, client_name: &str) -> PathBuf {
        self.instance_root(instance_id).join(client_name)
    }

    pub fn client_lib_dir(&self, instance_id: &InstanceId, client_name: &str) -> PathBuf {
        self.client_root(instance_id, client_name).join("lib")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Launcher executed for spawned client processes.
    #[serde(default = "default_client_runtime")]
    pub runtime: PathBuf,
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,
    /// None waits for readiness without a deadline.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: Option<u64>,
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
    #[serde(default = "default_kill_wait")]
    pub kill_wait_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            runtime: default_client_runtime(),
            ready_marker: default_ready_marker(),
            ready_timeout_secs: default_ready_timeout(),
            terminate_grace_secs: default_terminate_grace(),
            kill_wait_secs: default_kill_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_local_port() -> u16 {
    8080
}

fn default_client_runtime() -> PathBuf {
    PathBuf::from("/usr/local/bin/rig-agent")
}

fn default_ready_marker() -> String {
    AGENT_READY_MARKER.to_string()
}

fn default_ready_timeout() -> Option<u64> {
    Some(120)
}

fn default_terminate_grace() -> u64 {
    30
}

fn default_kill_wait() -> u64 {
    10
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(AgentConfig {
            driver: DriverConfig {
                url: std::env::var("DRIVER_URL")
                    .unwrap_or_else(|_| "ws://localhost:3000/ws".to_string()),
                node_id: std::env::var("NODE_ID")
                    .map_err(|_| "NODE_ID environment variable is required".to_string())?,
                secret: std::env::var("NODE_SECRET")
                    .map_err(|_| "NODE_SECRET environment variable is required".to_string())?,
                hostname: hostname().map_err(|e| format!("Failed to get hostname: {}", e))?,
                local_port: default_local_port(),
            },
            storage: StorageConfig {
                root_dir: std::env::var("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/var/lib/rig-agent")),
            },
            client: ClientConfig::default(),
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}

fn hostname() -> Result<String, std::io::Error> {
    std::process::Command::new("hostname")
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config_and_applies_client_defaults() {
        let raw = r#"
            [driver]
            url = "ws://driver:3000/ws"
            node_id = "node-1"
            secret = "s3cret"
            hostname = "node-1.example.com"

            [storage]
            root_dir = "/var/lib/rig-agent"

            [logging]
            level = "debug"
            format = "pretty"
        "#;
        let config: AgentConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.driver.local_port, 8080);
        assert_eq!(config.client.ready_marker, AGENT_READY_MARKER);
        assert_eq!(config.client.ready_timeout_secs, Some(120));
        assert_eq!(config.client.terminate_grace_secs, 30);
        assert_eq!(
            config.storage.client_lib_dir(&InstanceId::new("T1"), "C1"),
            PathBuf::from("/var/lib/rig-agent/instances/T1/C1/lib")
        );
    }

    #[test]
    fn debug_output_redacts_secret() {
        let driver = DriverConfig {
            url: "ws://driver:3000/ws".to_string(),
            node_id: "node-1".to_string(),
            secret: "s3cret".to_string(),
            hostname: "node-1".to_string(),
            local_port: 8080,
        };
        let printed = format!("{:?}", driver);
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains("s3cret"));
    }
}
