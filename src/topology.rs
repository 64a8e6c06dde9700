use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Identifier of one test-rig instance. Every installation, client and
/// transfer channel on this node is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        InstanceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        InstanceId(id.to_string())
    }
}

/// Which kit build an instance runs on and where to fetch it from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub version: String,
    pub archive: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub name: String,
    pub content: String,
}

/// One clustered server the driver wants running on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    pub name: String,
    pub hostname: String,
}

/// A configuration file to materialize inside the kit installation.
/// `path` is relative to the installation root; `content` may carry
/// `{{INSTALL_DIR}}` and `{{CONFIG_INDEX}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDescriptor {
    pub path: String,
    pub content: String,
}

impl ConfigDescriptor {
    pub fn render(&self, install_dir: &Path, config_index: usize) -> String {
        let mut content = self.content.clone();
        let substitutions = [
            ("INSTALL_DIR", install_dir.display().to_string()),
            ("CONFIG_INDEX", config_index.to_string()),
        ];
        for (key, value) in substitutions {
            let placeholder = format!("{{{{{}}}}}", key);
            content = content.replace(&placeholder, &value);
        }
        content
    }
}

/// The full shape of an instance as the driver describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub distribution: Distribution,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub configs: Vec<ConfigDescriptor>,
    #[serde(default)]
    pub kit_path: Option<PathBuf>,
}

impl Topology {
    pub fn server(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|server| server.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_config_placeholders() {
        let descriptor = ConfigDescriptor {
            path: "conf/node.xml".to_string(),
            content: "<logs>{{INSTALL_DIR}}/logs-{{CONFIG_INDEX}}</logs>".to_string(),
        };
        let rendered = descriptor.render(Path::new("/data/kits/T1"), 2);
        assert_eq!(rendered, "<logs>/data/kits/T1/logs-2</logs>");
    }

    #[test]
    fn deserializes_topology_from_driver_json() {
        let raw = r#"{
            "distribution": {"version": "10.7.0", "archive": "kit-10.7.0.tar.gz", "url": "http://kits.example.com/kit-10.7.0.tar.gz"},
            "servers": [{"name": "Server1", "hostname": "localhost"}],
            "configs": [{"path": "conf/cluster.xml", "content": "<cluster/>"}]
        }"#;
        let topology: Topology = serde_json::from_str(raw).unwrap();
        assert_eq!(topology.distribution.version, "10.7.0");
        assert!(topology.server("Server1").is_some());
        assert!(topology.server("Server9").is_none());
        assert!(topology.kit_path.is_none());
    }
}
