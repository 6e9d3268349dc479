use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::conntrack::Conntrack;

use super::container::Container;

/// Upper bound of connections resolved per conntrack table scan.
const MAX_BATCH: usize = 256;

/// A freshly opened connection whose post-NAT destination is still unknown.
#[derive(Debug)]
pub struct NatRequest {
    pub container: Arc<Container>,
    pub pid: u32,
    pub fd: u64,
    pub timestamp: u64,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Resolves NAT destinations off the registry task.
///
/// Requests are drained in batches and every batch costs one blocking scan of
/// the conntrack table.
pub struct NatResolver {
    conntrack: Arc<dyn Conntrack>,
    rx: mpsc::Receiver<NatRequest>,
}

impl NatResolver {
    pub fn new(conntrack: Arc<dyn Conntrack>, rx: mpsc::Receiver<NatRequest>) -> Self {
        Self { conntrack, rx }
    }

    /// Runs until every sender is dropped.
    pub async fn run(mut self) {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        while self.rx.recv_many(&mut batch, MAX_BATCH).await > 0 {
            let requests = std::mem::take(&mut batch);
            let conntrack = Arc::clone(&self.conntrack);
            match tokio::task::spawn_blocking(move || resolve_batch(conntrack.as_ref(), requests)).await {
                Ok(resolved) if resolved > 0 => {
                    log::trace!(target: "container registry", "resolved {} NAT destinations", resolved);
                }
                Ok(_) => {}
                Err(err) => {
                    log::error!(target: "container registry", "NAT resolution task failed: {}", err);
                }
            }
        }
        log::debug!(target: "container registry", "NAT queue closed");
    }
}

/// Looks up `requests` in one pass and rewrites the translated connections.
///
/// Returns the number of connections that moved to a new destination.
pub fn resolve_batch(conntrack: &dyn Conntrack, requests: Vec<NatRequest>) -> usize {
    let keys: Vec<_> = requests.iter().map(|r| (r.src, r.dst)).collect();
    let resolved = conntrack.actual_destinations(&keys);
    requests
        .into_iter()
        .zip(resolved)
        .filter(|(request, actual)| match *actual {
            Some(actual) if actual != request.dst => request
                .container
                .resolve_destination(request.pid, request.fd, request.timestamp, actual),
            _ => false,
        })
        .count()
}
