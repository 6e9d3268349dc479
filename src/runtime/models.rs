use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Metadata of a container as reported by its runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerMetadata {
    pub name: String,
    pub id: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Mount destination to mount source.
    pub volumes: HashMap<String, String>,
    pub created: String,
    pub log_path: String,
    pub image: String,
    /// Host addresses the runtime forwards into the container, keyed by runtime.
    pub host_listens: HashMap<String, Vec<SocketAddr>>,
    pub networks: HashMap<String, ContainerNetwork>,
    pub container_ports: Vec<ContainerPort>,
}

impl ContainerMetadata {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A declared container port, in the shape of the Kubernetes ports annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u32,
    pub protocol: String,
    pub host_port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerNetwork {
    pub network_id: String,
    pub aliases: Vec<String>,
    pub ip_address: String,
}
