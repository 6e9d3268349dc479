//! Docker Engine metadata lookups through `bollard` on the docker unix socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::ContainerInspectResponse;

use super::{ContainerMetadata, ContainerNetwork, ContainerPort, Error, Result, RuntimeClient};

/// Per-request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Key under which docker port forwards appear in [`ContainerMetadata::host_listens`].
pub const HOST_LISTENS_KEY: &str = "docker";

/// Client for the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
    socket_path: PathBuf,
}

impl DockerClient {
    /// Connects to the docker socket at `socket_path` and verifies the daemon answers a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or unhealthy.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let docker = Docker::connect_with_unix(
            &socket_path.to_string_lossy(),
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|source| docker_error("connect", source))?;
        docker
            .ping()
            .await
            .map_err(|source| docker_error("ping", source))?;
        Ok(Self {
            docker,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl RuntimeClient for DockerClient {
    async fn container_metadata(&self, id: &str) -> Result<ContainerMetadata> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| inspect_error(id, source))?;
        Ok(metadata_from_inspect(inspect))
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(None::<ListContainersOptions<String>>)
            .await
            .map_err(|source| docker_error("container list", source))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

fn docker_error(what: &'static str, source: bollard::errors::Error) -> Error {
    Error::Docker { what, source }
}

fn inspect_error(id: &str, source: bollard::errors::Error) -> Error {
    match source {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::NotFound(id.to_owned()),
        source => docker_error("container inspect", source),
    }
}

/// Converts a docker inspect document into runtime-neutral metadata.
pub fn metadata_from_inspect(inspect: ContainerInspectResponse) -> ContainerMetadata {
    let config = inspect.config.unwrap_or_default();
    let mut metadata = ContainerMetadata {
        name: inspect
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_owned(),
        id: inspect.id.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        created: inspect.created.unwrap_or_default(),
        ..Default::default()
    };

    for mount in inspect.mounts.into_iter().flatten() {
        if let (Some(destination), Some(source)) = (mount.destination, mount.source) {
            metadata.volumes.insert(destination, source);
        }
    }
    // Other log drivers do not write a file the agent could read.
    let log_driver = inspect
        .host_config
        .and_then(|h| h.log_config)
        .and_then(|l| l.typ);
    if let Some(log_path) = inspect.log_path.filter(|p| !p.is_empty()) {
        if log_driver.as_deref() == Some("json-file") {
            metadata.log_path = log_path;
        }
    }

    if let Some(settings) = inspect.network_settings {
        let mut listens = Vec::new();
        for (port, bindings) in settings.ports.iter().flatten() {
            let (container_port, protocol) = port.split_once('/').unwrap_or((port.as_str(), "tcp"));
            let container_port = container_port.parse::<u32>().unwrap_or_default();
            for binding in bindings.iter().flatten() {
                let host_port = binding
                    .host_port
                    .as_deref()
                    .and_then(|p| p.parse::<u16>().ok());
                if protocol == "tcp" {
                    let host_ip = binding.host_ip.as_deref().unwrap_or_default();
                    if let Some(addr) = host_port.and_then(|p| host_listen(host_ip, p)) {
                        listens.push(addr);
                    }
                }
                metadata.container_ports.push(ContainerPort {
                    name: String::new(),
                    container_port,
                    protocol: protocol.to_owned(),
                    host_port: host_port.map(u32::from).unwrap_or_default(),
                });
            }
        }
        listens.sort();
        metadata.container_ports.sort_by_key(|p| (p.container_port, p.host_port));
        metadata.host_listens.insert(HOST_LISTENS_KEY.to_owned(), listens);

        for (name, network) in settings.networks.into_iter().flatten() {
            metadata.networks.insert(
                name,
                ContainerNetwork {
                    network_id: network.network_id.unwrap_or_default(),
                    aliases: network.aliases.unwrap_or_default(),
                    ip_address: network.ip_address.unwrap_or_default(),
                },
            );
        }
    }

    metadata
}

fn host_listen(host_ip: &str, port: u16) -> Option<SocketAddr> {
    let ip = if host_ip.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host_ip.parse().ok()?
    };
    Some(SocketAddr::new(ip, port))
}
