use axum::Json;
use axum::extract::State;
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::registry::{ContainerIndex, ContainerSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind API listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("API server failed: {0}")]
    Serve(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

async fn list_containers(State(containers): State<ContainerIndex>) -> Json<Vec<ContainerSnapshot>> {
    let mut snapshots: Vec<ContainerSnapshot> = containers
        .iter()
        .map(|entry| entry.value().snapshot())
        .collect();
    snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
    Json(snapshots)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Read-only view of the tracked containers.
pub struct APIServer {
    router: axum::Router,
}

impl APIServer {
    pub fn new(containers: ContainerIndex) -> Self {
        let router = axum::Router::new()
            .route("/containers", get(list_containers))
            .route("/healthz", get(healthz))
            .with_state(containers);
        Self { router }
    }

    /// Serves the API until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if `addr` cannot be bound.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(Error::Bind)?;
        if let Ok(local) = listener.local_addr() {
            log::info!("API listening on {}", local);
        }
        axum::serve(listener, self.router.into_make_service())
            .await
            .map_err(Error::Serve)
    }
}
