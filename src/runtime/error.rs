use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no container runtime available")]
    Unavailable,
    #[error("failed to connect to gRPC socket `{path}`: {source}")]
    GrpcConnect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("gRPC request `{method}` failed: {source}")]
    Grpc {
        method: &'static str,
        #[source]
        source: Box<tonic::Status>,
    },
    #[error("docker {what} failed: {source}")]
    Docker {
        what: &'static str,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("container `{0}` not found")]
    NotFound(String),
    #[error("request `{0}` timed out")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;
