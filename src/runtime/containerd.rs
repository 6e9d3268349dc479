//! containerd metadata lookups over the containers gRPC service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;

use super::{ContainerMetadata, ContainerPort, Error, Result, RuntimeClient};
use crate::kubernetes::ANNOTATION_CONTAINER_PORTS;

/// containerd namespace used by the CRI plugin.
const K8S_NAMESPACE: &str = "k8s.io";
const CRI_METADATA_EXTENSION: &str = "io.cri-containerd.container.metadata";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const GET_METHOD: &str = "/containerd.services.containers.v1.Containers/Get";
const LIST_METHOD: &str = "/containerd.services.containers.v1.Containers/List";

/// Subset of `containerd.services.containers.v1.Container`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Container {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
    #[prost(string, tag = "3")]
    pub image: String,
    #[prost(message, optional, tag = "5")]
    pub spec: Option<prost_types::Any>,
    #[prost(message, optional, tag = "8")]
    pub created_at: Option<prost_types::Timestamp>,
    #[prost(map = "string, message", tag = "10")]
    pub extensions: HashMap<String, prost_types::Any>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetContainerRequest {
    #[prost(string, tag = "1")]
    pub id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetContainerResponse {
    #[prost(message, optional, tag = "1")]
    pub container: Option<Container>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListContainersRequest {
    #[prost(string, repeated, tag = "1")]
    pub filters: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListContainersResponse {
    #[prost(message, repeated, tag = "1")]
    pub containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
struct OciSpec {
    #[serde(default)]
    mounts: Vec<OciMount>,
}

#[derive(Debug, Default, Deserialize)]
struct OciMount {
    #[serde(default)]
    destination: String,
    #[serde(default)]
    source: String,
}

#[derive(Debug, Default, Deserialize)]
struct CriMetadataEnvelope {
    #[serde(rename = "Metadata", default)]
    metadata: CriMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct CriMetadata {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "LogPath", default)]
    log_path: String,
    #[serde(rename = "Config", default)]
    config: CriConfig,
}

#[derive(Debug, Default, Deserialize)]
struct CriConfig {
    #[serde(default, alias = "Annotations")]
    annotations: HashMap<String, String>,
}

/// Client for the containerd containers service.
#[derive(Debug, Clone)]
pub struct ContainerdClient {
    socket_path: PathBuf,
    channel: Channel,
}

impl ContainerdClient {
    /// Connects to the containerd socket at `socket_path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GrpcConnect`] if the socket cannot be reached.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let channel = super::unix::channel_for_unix_socket(&socket_path)
            .await
            .map_err(|source| Error::GrpcConnect {
                path: socket_path.clone(),
                source,
            })?;
        Ok(Self {
            socket_path,
            channel,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn unary<Req, Resp>(&self, method: &'static str, message: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let grpc_err = |status: tonic::Status| Error::Grpc {
            method,
            source: Box::new(status),
        };

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|err| grpc_err(tonic::Status::unknown(format!("service was not ready: {err}"))))?;

        let mut request = tonic::Request::new(message);
        request
            .metadata_mut()
            .insert("containerd-namespace", MetadataValue::from_static(K8S_NAMESPACE));

        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let call = grpc.unary(request, PathAndQuery::from_static(method), codec);
        let response = tokio::time::timeout(REQUEST_TIMEOUT, call)
            .await
            .map_err(|_| Error::Timeout(method.to_owned()))?
            .map_err(grpc_err)?;
        Ok(response.into_inner())
    }
}

impl RuntimeClient for ContainerdClient {
    async fn container_metadata(&self, id: &str) -> Result<ContainerMetadata> {
        let response: GetContainerResponse = self
            .unary(GET_METHOD, GetContainerRequest { id: id.to_owned() })
            .await
            .map_err(|err| match err {
                Error::Grpc { source, .. } if source.code() == tonic::Code::NotFound => {
                    Error::NotFound(id.to_owned())
                }
                err => err,
            })?;
        let container = response
            .container
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;
        Ok(metadata_from_container(container))
    }

    async fn list_container_ids(&self) -> Result<Vec<String>> {
        let response: ListContainersResponse = self
            .unary(LIST_METHOD, ListContainersRequest::default())
            .await?;
        Ok(response.containers.into_iter().map(|c| c.id).collect())
    }
}

/// Converts a containerd container record into runtime-neutral metadata.
///
/// Malformed spec or CRI extension payloads are logged and skipped; the rest of
/// the record is still used.
pub fn metadata_from_container(container: Container) -> ContainerMetadata {
    let mut metadata = ContainerMetadata {
        id: container.id,
        labels: container.labels,
        image: container.image,
        created: container
            .created_at
            .map(|ts| ts.to_string())
            .unwrap_or_default(),
        ..Default::default()
    };

    if let Some(spec) = container.spec {
        match serde_json::from_slice::<OciSpec>(&spec.value) {
            Ok(spec) => {
                for mount in spec.mounts {
                    metadata.volumes.insert(mount.destination, mount.source);
                }
            }
            Err(err) => log::warn!("invalid OCI spec of container `{}`: {}", metadata.id, err),
        }
    }

    if let Some(ext) = container.extensions.get(CRI_METADATA_EXTENSION) {
        match serde_json::from_slice::<CriMetadataEnvelope>(&ext.value) {
            Ok(envelope) => {
                let cri = envelope.metadata;
                if let Some(ports) = cri.config.annotations.get(ANNOTATION_CONTAINER_PORTS) {
                    match serde_json::from_str::<Vec<ContainerPort>>(ports) {
                        Ok(ports) => metadata.container_ports = ports,
                        Err(err) => log::warn!(
                            "invalid ports annotation of container `{}`: {}",
                            metadata.id,
                            err
                        ),
                    }
                }
                metadata.annotations = cri.config.annotations;
                metadata.log_path = cri.log_path;
                metadata.name = cri.name;
            }
            Err(err) => log::warn!("invalid CRI metadata of container `{}`: {}", metadata.id, err),
        }
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(type_url: &str, value: &str) -> prost_types::Any {
        prost_types::Any {
            type_url: type_url.to_owned(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn converts_cri_container() {
        let mut labels = HashMap::new();
        labels.insert("io.kubernetes.pod.name".to_owned(), "web".to_owned());
        let mut extensions = HashMap::new();
        extensions.insert(
            CRI_METADATA_EXTENSION.to_owned(),
            any(
                "github.com/containerd/cri/pkg/store/container/Metadata",
                r#"{"Version":"v1","Metadata":{"ID":"abc","Name":"nginx","LogPath":"/var/log/pods/default_web/nginx/0.log","Config":{"annotations":{"io.kubernetes.container.ports":"[{\"name\":\"http\",\"containerPort\":80,\"protocol\":\"TCP\"}]"}}}}"#,
            ),
        );
        let container = Container {
            id: "abc".to_owned(),
            labels,
            image: "docker.io/library/nginx:1.25".to_owned(),
            spec: Some(any(
                "types.containerd.io/opencontainers/runtime-spec/1/Spec",
                r#"{"ociVersion":"1.0.2","mounts":[{"destination":"/data","source":"/var/lib/data","type":"bind"}]}"#,
            )),
            created_at: None,
            extensions,
        };

        let metadata = metadata_from_container(container);
        assert_eq!(metadata.id, "abc");
        assert_eq!(metadata.name, "nginx");
        assert_eq!(metadata.image, "docker.io/library/nginx:1.25");
        assert_eq!(metadata.label("io.kubernetes.pod.name"), Some("web"));
        assert_eq!(metadata.log_path, "/var/log/pods/default_web/nginx/0.log");
        assert_eq!(metadata.volumes.get("/data").map(String::as_str), Some("/var/lib/data"));
        assert_eq!(
            metadata.container_ports,
            vec![ContainerPort {
                name: "http".to_owned(),
                container_port: 80,
                protocol: "TCP".to_owned(),
                host_port: 0,
            }]
        );
        assert!(metadata.annotations.contains_key(ANNOTATION_CONTAINER_PORTS));
    }

    #[test]
    fn malformed_extensions_are_skipped() {
        let mut extensions = HashMap::new();
        extensions.insert(CRI_METADATA_EXTENSION.to_owned(), any("x", "not json"));
        let container = Container {
            id: "abc".to_owned(),
            image: "busybox".to_owned(),
            spec: Some(any("x", "{broken")),
            extensions,
            ..Default::default()
        };

        let metadata = metadata_from_container(container);
        assert_eq!(metadata.id, "abc");
        assert_eq!(metadata.image, "busybox");
        assert!(metadata.name.is_empty());
        assert!(metadata.volumes.is_empty());
    }

    #[test]
    fn message_round_trips_through_prost() {
        use prost::Message;

        let request = GetContainerRequest {
            id: "abc".to_owned(),
        };
        let bytes = request.encode_to_vec();
        assert_eq!(bytes, vec![0x0a, 0x03, b'a', b'b', b'c']);
    }
}
