//! Cgroup-based process attribution.
//!
//! Every process on the host belongs to a cgroup, and container runtimes
//! place each container into a cgroup whose path embeds the runtime's
//! container id. This module reads `/proc/<pid>/cgroup`, adjusts the path for
//! the agent's own cgroup namespace, and classifies the path into a
//! [`ContainerType`] plus the extracted runtime id.
//!
//! # Key Components
//!
//! - [`CgroupResolver`]: Reads and classifies the cgroup of a PID.
//! - [`CgroupPrefix`]: The host-relative cgroup path of the agent, detected
//!   once at startup when the agent runs in a nested cgroup namespace.
//! - [`container_by_cgroup`]: Pure path classifier.
//!
//! # File Format
//!
//! `/proc/<pid>/cgroup` lines have the form
//! `<hierarchy-id>:<controller-list>:<cgroup-path>`:
//!
//! - v1: arbitrary hierarchy id, comma-separated controllers, per-controller path
//! - v2: hierarchy id `0`, empty controller list, unified path
mod classify;
mod error;
mod namespace;
mod parser;
mod resolver;

use std::collections::HashMap;
use std::fmt;

pub use classify::container_by_cgroup;
pub use error::{Error, Result};
pub use namespace::CgroupPrefix;
pub use parser::{CgroupLine, CgroupLineError, join_cgroup_path, parse_cgroup_line};
pub use resolver::CgroupResolver;

/// Cgroup hierarchy version a path was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

/// Workload kind derived from a cgroup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerType {
    Unknown,
    StandaloneProcess,
    Docker,
    SystemdService,
    Containerd,
    Sandbox,
}

impl ContainerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerType::Unknown => "unknown",
            ContainerType::StandaloneProcess => "standalone",
            ContainerType::Docker => "docker",
            ContainerType::SystemdService => "systemd",
            ContainerType::Containerd => "cri-containerd",
            ContainerType::Sandbox => "sandbox",
        }
    }

    /// Returns `true` for container types whose metadata lives in a container runtime.
    pub fn has_runtime_metadata(&self) -> bool {
        matches!(self, ContainerType::Docker | ContainerType::Containerd)
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for ContainerType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// The cgroup of a single process, resolved relative to the host.
///
/// Constructed fresh on every lookup; only kept when a container is created from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    /// Canonical, host-relative cgroup path. Never empty.
    pub id: String,
    pub version: Version,
    pub container_type: ContainerType,
    /// Runtime-specific id extracted from the path, empty for non-containers.
    pub container_id: String,
    subsystems: HashMap<String, String>,
}

impl Cgroup {
    /// Builds a cgroup without controller paths.
    pub fn new(
        id: impl Into<String>,
        version: Version,
        container_type: ContainerType,
        container_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            container_type,
            container_id: container_id.into(),
            subsystems: HashMap::new(),
        }
    }

    /// Returns the namespace-adjusted path of the given controller.
    ///
    /// Under cgroup v2 the unified hierarchy is stored under the empty name.
    pub fn subsystem(&self, name: &str) -> Option<&str> {
        self.subsystems.get(name).map(String::as_str)
    }
}
