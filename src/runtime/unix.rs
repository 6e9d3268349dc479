use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{pin, task};

use hyper_util::rt::TokioIo;
use tonic::transport::{Channel, Endpoint};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connects every gRPC channel request to the same unix socket.
#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = std::io::Error;

    type Future = pin::Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;

            Ok(TokioIo::new(stream))
        })
    }
}

/// Opens a gRPC channel over the unix socket at `path`.
///
/// The connection is established eagerly, so a missing or dead socket fails here.
pub async fn channel_for_unix_socket(
    path: impl AsRef<Path>,
) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref();
    log::debug!("Connecting to {}...", path.display());
    let connector = UnixConnector {
        path: path.to_path_buf(),
    };
    // The authority is ignored by the connector but required by the endpoint.
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_timeout(CONNECT_TIMEOUT)
        .connect_with_connector(connector)
        .await?;
    log::debug!("Created channel for {}.", path.display());

    Ok(channel)
}
