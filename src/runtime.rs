//! Container runtime metadata clients.

mod containerd;
mod docker;
mod error;
mod models;
mod unix;

use std::path::Path;

pub use containerd::{ContainerdClient, metadata_from_container};
pub use docker::{DockerClient, metadata_from_inspect};
pub use error::{Error, Result};
pub use models::{ContainerMetadata, ContainerNetwork, ContainerPort};

/// Source of container metadata keyed by runtime container id.
pub trait RuntimeClient: Send + Sync {
    fn container_metadata(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<ContainerMetadata>> + Send;

    fn list_container_ids(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

/// The runtime detected on the host.
#[derive(Debug, Clone)]
pub enum RuntimeClientProvider {
    Containerd(ContainerdClient),
    Docker(DockerClient),
    /// No runtime answered; every lookup fails with [`Error::Unavailable`].
    Unavailable,
}

impl RuntimeClientProvider {
    /// Tries containerd first, then docker.
    pub async fn detect(containerd_socket: impl AsRef<Path>, docker_socket: impl AsRef<Path>) -> Self {
        let containerd_socket = containerd_socket.as_ref();
        match ContainerdClient::connect(containerd_socket).await {
            Ok(client) => {
                log::info!("Detected container runtime: containerd ({})", containerd_socket.display());
                return Self::Containerd(client);
            }
            Err(err) => log::debug!("containerd not available: {}", err),
        }

        let docker_socket = docker_socket.as_ref();
        match DockerClient::connect(docker_socket).await {
            Ok(client) => {
                log::info!("Detected container runtime: docker ({})", docker_socket.display());
                return Self::Docker(client);
            }
            Err(err) => log::debug!("docker not available: {}", err),
        }

        log::warn!("No available docker or containerd runtime detected");
        Self::Unavailable
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Containerd(_) => "containerd",
            Self::Docker(_) => "docker",
            Self::Unavailable => "unavailable",
        }
    }
}

impl RuntimeClient for RuntimeClientProvider {
    async fn container_metadata(&self, id: &str) -> Result<ContainerMetadata> {
        match self {
            Self::Containerd(client) => client.container_metadata(id).await,
            Self::Docker(client) => client.container_metadata(id).await,
            Self::Unavailable => Err(Error::Unavailable),
        }
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        match self {
            Self::Containerd(client) => client.list_container_ids().await,
            Self::Docker(client) => client.list_container_ids().await,
            Self::Unavailable => Err(Error::Unavailable),
        }
    }
}
