use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::cgroup::{Cgroup, ContainerType};
use crate::kubernetes::{
    LABEL_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE, SANDBOX_CONTAINER_NAME,
};
use crate::runtime::ContainerMetadata;

/// Container name substituted for pod sandboxes.
const SANDBOX_NAME: &str = "sandbox";
const CRIO_CONMON_PREFIX: &str = "/system.slice/crio-conmon-";

/// Stable key under which a container's events are reported.
///
/// # Examples
///
/// ```
/// # use sense_agent::registry::ContainerIdentity;
/// let id = ContainerIdentity::new("/k8s/default/web/nginx");
/// assert_eq!(id.as_ref(), "/k8s/default/web/nginx");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerIdentity(Arc<str>);

impl ContainerIdentity {
    pub fn new(src: impl AsRef<str>) -> Self {
        Self(src.as_ref().into())
    }

    pub fn to_arc(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }
}

impl AsRef<str> for ContainerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ContainerIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Derives the identity of the container owning `cgroup`.
///
/// Returns `None` for cgroups that must not be tracked: host processes, pod
/// sandboxes, pause containers and CRI-O monitor processes.
///
/// * systemd services are keyed by their unit path.
/// * Kubernetes containers are keyed `/k8s/<namespace>/<pod>/<container>`.
/// * Other docker and containerd containers are keyed by their runtime id.
pub fn derive_identity(
    cgroup: &Cgroup,
    metadata: Option<&ContainerMetadata>,
) -> Option<ContainerIdentity> {
    if cgroup.container_type == ContainerType::SystemdService {
        if cgroup.container_id.starts_with(CRIO_CONMON_PREFIX) {
            return None;
        }
        return Some(ContainerIdentity::new(&cgroup.container_id));
    }
    if cgroup.container_id.is_empty() {
        return None;
    }
    if !matches!(
        cgroup.container_type,
        ContainerType::Docker | ContainerType::Containerd | ContainerType::Sandbox
    ) {
        return None;
    }

    let metadata = metadata?;
    match metadata.label(LABEL_POD_NAME).filter(|pod| !pod.is_empty()) {
        Some(pod) => {
            let namespace = metadata.label(LABEL_POD_NAMESPACE).unwrap_or_default();
            let name = if cgroup.container_type == ContainerType::Sandbox {
                SANDBOX_NAME
            } else {
                metadata.label(LABEL_CONTAINER_NAME).unwrap_or_default()
            };
            if name.is_empty() || name == SANDBOX_CONTAINER_NAME {
                return None;
            }
            Some(ContainerIdentity::new(format!("/k8s/{namespace}/{pod}/{name}")))
        }
        None if cgroup.container_type == ContainerType::Sandbox => None,
        None => Some(ContainerIdentity::new(&cgroup.container_id)),
    }
}
