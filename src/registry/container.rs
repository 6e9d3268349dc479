use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::cgroup::{Cgroup, ContainerType};
use crate::runtime::ContainerMetadata;
use crate::tracer::L7Request;

use super::connections::{ConnectionSummary, ConnectionTracker};
use super::identity::ContainerIdentity;

/// A tracked container: its identity, the cgroup it was created from, the
/// processes currently attributed to it and its connection state.
#[derive(Debug)]
pub struct Container {
    identity: ContainerIdentity,
    cgroup: Cgroup,
    metadata: Option<ContainerMetadata>,
    pids: Mutex<BTreeSet<u32>>,
    tracker: RwLock<ConnectionTracker>,
}

impl Container {
    pub fn new(identity: ContainerIdentity, cgroup: Cgroup, metadata: Option<ContainerMetadata>) -> Self {
        Self {
            identity,
            cgroup,
            metadata,
            pids: Mutex::new(BTreeSet::new()),
            tracker: RwLock::new(ConnectionTracker::new()),
        }
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.identity
    }

    pub fn cgroup(&self) -> &Cgroup {
        &self.cgroup
    }

    pub fn metadata(&self) -> Option<&ContainerMetadata> {
        self.metadata.as_ref()
    }

    pub fn add_pid(&self, pid: u32) {
        self.pids().insert(pid);
    }

    /// Removes `pid` and returns the number of pids left.
    pub fn remove_pid(&self, pid: u32) -> usize {
        let mut pids = self.pids();
        pids.remove(&pid);
        pids.len()
    }

    pub fn pid_count(&self) -> usize {
        self.pids().len()
    }

    /// Records a connection attempt made by `pid`.
    ///
    /// The connection is keyed by `dst` until [`Container::resolve_destination`]
    /// supplies the post-NAT address.
    pub fn on_connection_open(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
        pid: u32,
        fd: u64,
        timestamp: u64,
        is_error: bool,
    ) {
        self.tracker_mut()
            .record_open(src, dst, dst, pid, fd, timestamp, is_error, SystemTime::now());
    }

    pub fn resolve_destination(&self, pid: u32, fd: u64, timestamp: u64, actual_dst: SocketAddr) -> bool {
        self.tracker_mut()
            .resolve_destination(pid, fd, timestamp, actual_dst)
    }

    pub fn on_connection_close(&self, pid: u32, fd: u64, timestamp: u64) {
        self.tracker_mut()
            .on_connection_close(pid, fd, timestamp, SystemTime::now());
    }

    /// Closes the connections left open by an exited process.
    pub fn on_pid_exit(&self, pid: u32) -> usize {
        self.tracker_mut().on_pid_exit(pid, SystemTime::now())
    }

    pub fn on_retransmit(&self, src: SocketAddr, dst: SocketAddr) {
        self.tracker_mut().on_retransmit(src, dst);
    }

    pub fn on_listen_open(&self, addr: SocketAddr) {
        self.tracker_mut().on_listen_open(addr);
    }

    pub fn on_listen_close(&self, addr: SocketAddr) {
        self.tracker_mut().on_listen_close(addr);
    }

    /// Returns `false` if the request could not be attributed to an open connection.
    pub fn on_l7_request(&self, pid: u32, fd: u64, timestamp: u64, request: &L7Request) -> bool {
        self.tracker_mut().on_l7_request(pid, fd, timestamp, request)
    }

    pub fn gc(&self, now: SystemTime, ttl: Duration) -> usize {
        self.tracker_mut().gc(now, ttl)
    }

    pub fn connections(&self) -> ConnectionSummary {
        self.tracker().snapshot()
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        let metadata = self.metadata.as_ref();
        ContainerSnapshot {
            identity: self.identity.clone(),
            cgroup: self.cgroup.id.clone(),
            container_type: self.cgroup.container_type,
            container_id: self.cgroup.container_id.clone(),
            pids: self.pids().iter().copied().collect(),
            name: metadata.map(|m| m.name.clone()).unwrap_or_default(),
            image: metadata.map(|m| m.image.clone()).unwrap_or_default(),
            labels: metadata
                .map(|m| m.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            connections: self.connections(),
        }
    }

    // A poisoned lock only means another thread panicked mid-update; the
    // counters it guards stay usable.
    fn pids(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.pids.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn tracker(&self) -> RwLockReadGuard<'_, ConnectionTracker> {
        self.tracker.read().unwrap_or_else(|err| err.into_inner())
    }

    fn tracker_mut(&self) -> RwLockWriteGuard<'_, ConnectionTracker> {
        self.tracker.write().unwrap_or_else(|err| err.into_inner())
    }
}

/// Point-in-time, serialisable view of a [`Container`].
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub identity: ContainerIdentity,
    pub cgroup: String,
    pub container_type: ContainerType,
    pub container_id: String,
    pub pids: Vec<u32>,
    pub name: String,
    pub image: String,
    pub labels: std::collections::BTreeMap<String, String>,
    pub connections: ConnectionSummary,
}
