//! Label and annotation keys set by the kubelet on CRI containers.

pub const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
pub const LABEL_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
pub const LABEL_POD_UID: &str = "io.kubernetes.pod.uid";
pub const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";
/// JSON list of the container's declared ports.
pub const ANNOTATION_CONTAINER_PORTS: &str = "io.kubernetes.container.ports";

/// Container name the kubelet gives to pod sandbox ("pause") containers.
pub const SANDBOX_CONTAINER_NAME: &str = "POD";
