//! Container identity and PID bookkeeping.
//!
//! The [`Registry`] consumes the tracer's event funnel on a single task. For
//! every process it sees it resolves the cgroup, derives a
//! [`ContainerIdentity`] (querying the container runtime once per new cgroup)
//! and routes connection events to the owning [`Container`].
//!
//! # PID states
//!
//! A pid is either unknown, mapped to a container, or ignored. Ignored pids
//! belong to cgroups that are not tracked (host processes, sandboxes, CRI-O
//! monitors) and are never resolved again. Failed resolutions leave the pid
//! unknown so the next event retries it.
//!
//! Pids mapped to a systemd service are re-read on connection and listen
//! events, since runtime shims may move a process out of the unit's cgroup
//! after it was first seen.
//!
//! A container is garbage collected when its last pid exits. An exiting pid
//! closes the connections it still held.
//!
//! NAT destinations are resolved by a [`NatResolver`] task so the conntrack
//! table is never read on the registry task.
mod connections;
mod container;
mod identity;
mod nat;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::cgroup::{self, Cgroup, CgroupResolver, ContainerType};
use crate::conntrack::Conntrack;
use crate::runtime::{self, ContainerMetadata, RuntimeClient};
use crate::tracer::{Event, EventReason, EventType};

pub use connections::{
    ActiveConnection, AddrPair, ConnectionSummary, ConnectionTracker, DestinationCount, L7Stats,
    L7Summary, PairCount, PidFd,
};
pub use container::{Container, ContainerSnapshot};
pub use identity::{ContainerIdentity, derive_identity};
pub use nat::{NatRequest, NatResolver, resolve_batch};

const GC_INTERVAL: Duration = Duration::from_secs(30);
const INIT_SCOPE: &str = "/init.scope";
const NAT_QUEUE: usize = 4096;

/// Containers by identity, shared with readers outside the registry task.
pub type ContainerIndex = Arc<DashMap<ContainerIdentity, Arc<Container>>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cgroup(#[from] cgroup::Error),
    #[error("failed to get metadata of container `{id}`: {source}")]
    Metadata {
        id: String,
        #[source]
        source: runtime::Error,
    },
}

impl Error {
    pub fn is_process_gone(&self) -> bool {
        matches!(self, Error::Cgroup(err) if err.is_process_gone())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
enum PidState {
    Mapped(Arc<Container>),
    Ignored,
}

pub struct Registry<R> {
    resolver: CgroupResolver,
    runtime: R,
    nat_tx: mpsc::Sender<NatRequest>,
    nat: Option<NatResolver>,
    containers: ContainerIndex,
    by_cgroup: HashMap<String, Arc<Container>>,
    by_pid: HashMap<u32, PidState>,
    connection_ttl: Duration,
}

impl<R: RuntimeClient> Registry<R> {
    pub fn new(
        resolver: CgroupResolver,
        runtime: R,
        conntrack: Arc<dyn Conntrack>,
        connection_ttl: Duration,
    ) -> Self {
        let (nat_tx, nat_rx) = mpsc::channel(NAT_QUEUE);
        Self {
            resolver,
            runtime,
            nat_tx,
            nat: Some(NatResolver::new(conntrack, nat_rx)),
            containers: Arc::new(DashMap::new()),
            by_cgroup: HashMap::new(),
            by_pid: HashMap::new(),
            connection_ttl,
        }
    }

    /// Returns a handle to the identity index for concurrent readers.
    pub fn containers(&self) -> ContainerIndex {
        Arc::clone(&self.containers)
    }

    pub fn container_of(&self, pid: u32) -> Option<&Arc<Container>> {
        match self.by_pid.get(&pid) {
            Some(PidState::Mapped(container)) => Some(container),
            _ => None,
        }
    }

    pub fn container_by_cgroup(&self, cgroup_id: &str) -> Option<&Arc<Container>> {
        self.by_cgroup.get(cgroup_id)
    }

    pub fn is_ignored(&self, pid: u32) -> bool {
        matches!(self.by_pid.get(&pid), Some(PidState::Ignored))
    }

    /// Consumes events until every sender of `rx` is dropped.
    ///
    /// Also runs the NAT resolver, which stops once the registry is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Arc<Event>>) {
        if let Some(nat) = self.nat.take() {
            tokio::spawn(nat.run());
        }
        let mut gc = tokio::time::interval(GC_INTERVAL);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(&event).await,
                    None => break,
                },
                _ = gc.tick() => self.gc_connections(SystemTime::now()),
            }
        }
        log::info!(target: "container registry", "event stream closed, stopping registry");
    }

    pub async fn handle_event(&mut self, event: &Event) {
        match event.kind {
            EventType::ProcessStart => {
                self.on_process_start(event.pid).await;
            }
            EventType::ProcessExit => self.on_process_exit(event.pid, event.reason),
            EventType::ConnectionOpen | EventType::ConnectionError => {
                let (Some(src), Some(dst)) = (event.src, event.dst) else {
                    return;
                };
                let Some(container) = self.ensure_container(event.pid, true).await else {
                    return;
                };
                let is_error = event.kind == EventType::ConnectionError;
                container.on_connection_open(src, dst, event.pid, event.fd, event.timestamp, is_error);
                if !is_error && !dst.ip().is_loopback() {
                    self.queue_nat_lookup(container, event, src, dst);
                }
            }
            EventType::ConnectionClose => {
                if let Some(container) = self.container_of(event.pid) {
                    container.on_connection_close(event.pid, event.fd, event.timestamp);
                }
            }
            EventType::ListenOpen | EventType::ListenClose => {
                let Some(addr) = event.src else {
                    return;
                };
                let recheck = event.kind == EventType::ListenOpen;
                if let Some(container) = self.ensure_container(event.pid, recheck).await {
                    if event.kind == EventType::ListenOpen {
                        container.on_listen_open(addr);
                    } else {
                        container.on_listen_close(addr);
                    }
                }
            }
            EventType::TcpRetransmit => {
                let (Some(src), Some(dst)) = (event.src, event.dst) else {
                    return;
                };
                if let Some(container) = self.ensure_container(event.pid, false).await {
                    container.on_retransmit(src, dst);
                }
            }
            EventType::L7Request => {
                let Some(request) = &event.l7_request else {
                    return;
                };
                if let Some(container) = self.ensure_container(event.pid, false).await {
                    if !container.on_l7_request(event.pid, event.fd, event.timestamp, request) {
                        log::debug!(
                            target: "container registry",
                            "discarding {} request without matching connection: pid={}, fd={}",
                            request.protocol,
                            event.pid,
                            event.fd
                        );
                    }
                }
            }
            EventType::FileOpen => {}
        }
    }

    /// Maps `pid` to its container, creating the container on first sight of its cgroup.
    ///
    /// Returns `None` if the pid is ignored or could not be resolved.
    pub async fn on_process_start(&mut self, pid: u32) -> Option<Arc<Container>> {
        match self.by_pid.get(&pid) {
            Some(PidState::Mapped(container)) => return Some(Arc::clone(container)),
            Some(PidState::Ignored) => return None,
            None => {}
        }

        let cg = match self.read_cgroup(pid) {
            Ok(cg) => cg,
            Err(err) if err.is_process_gone() => {
                log::debug!(target: "container registry", "process exited before resolution: pid={}", pid);
                return None;
            }
            Err(err) => {
                log::warn!(target: "container registry", "failed to read cgroup: pid={}, error={}", pid, err);
                return None;
            }
        };

        if let Some(container) = self.by_cgroup.get(&cg.id) {
            let container = Arc::clone(container);
            self.attach(pid, &container);
            return Some(container);
        }

        let metadata = match self.lookup_metadata(&cg).await {
            Ok(metadata) => metadata,
            Err(err) => {
                log::warn!(target: "container registry", "{}: pid={}", err, pid);
                return None;
            }
        };

        let Some(identity) = derive_identity(&cg, metadata.as_ref()) else {
            if cg.id == INIT_SCOPE && pid != 1 {
                log::debug!(
                    target: "container registry",
                    "ignoring without persisting: cgroup={}, pid={}",
                    cg.id,
                    pid
                );
            } else {
                log::debug!(target: "container registry", "ignoring: cgroup={}, pid={}", cg.id, pid);
            }
            self.by_pid.insert(pid, PidState::Ignored);
            return None;
        };

        // Another cgroup already produced this identity, e.g. a restarted
        // container whose old processes have not exited yet.
        if let Some(existing) = self.containers.get(&identity).map(|c| Arc::clone(c.value())) {
            log::debug!(
                target: "container registry",
                "cgroup joins existing container: id={}, cgroup={}",
                identity,
                cg.id
            );
            self.by_cgroup.insert(cg.id, Arc::clone(&existing));
            self.attach(pid, &existing);
            return Some(existing);
        }

        log::info!(
            target: "container registry",
            "container created: id={}, type={}, cgroup={}, pid={}",
            identity,
            cg.container_type,
            cg.id,
            pid
        );
        let cgroup_id = cg.id.clone();
        let container = Arc::new(Container::new(identity.clone(), cg, metadata));
        self.containers.insert(identity, Arc::clone(&container));
        self.by_cgroup.insert(cgroup_id, Arc::clone(&container));
        self.attach(pid, &container);
        Some(container)
    }

    /// Forgets `pid` and removes its container once no pid references it.
    pub fn on_process_exit(&mut self, pid: u32, reason: EventReason) {
        let Some(state) = self.by_pid.remove(&pid) else {
            return;
        };
        let PidState::Mapped(container) = state else {
            return;
        };

        if reason == EventReason::OomKill {
            log::warn!(
                target: "container registry",
                "process killed by the OOM killer: id={}, pid={}",
                container.identity(),
                pid
            );
        }

        let closed = container.on_pid_exit(pid);
        if closed > 0 {
            log::debug!(
                target: "container registry",
                "closed {} connections of exited process: id={}, pid={}",
                closed,
                container.identity(),
                pid
            );
        }

        if container.remove_pid(pid) > 0 {
            return;
        }

        self.by_cgroup.retain(|_, c| !Arc::ptr_eq(c, &container));
        self.containers
            .remove_if(container.identity(), |_, c| Arc::ptr_eq(c, &container));
        log::info!(target: "container registry", "container removed: id={}", container.identity());
    }

    /// Purges expired closed connections of every container.
    pub fn gc_connections(&self, now: SystemTime) {
        let mut purged = 0;
        for entry in self.containers.iter() {
            purged += entry.value().gc(now, self.connection_ttl);
        }
        if purged > 0 {
            log::debug!(target: "container registry", "purged {} closed connections", purged);
        }
    }

    /// Returns the container of `pid`, resolving unseen pids.
    ///
    /// With `recheck`, a pid mapped to a systemd service is re-read and moved
    /// if its cgroup changed.
    async fn ensure_container(&mut self, pid: u32, recheck: bool) -> Option<Arc<Container>> {
        match self.by_pid.get(&pid) {
            Some(PidState::Mapped(container)) => {
                let container = Arc::clone(container);
                if recheck && container.cgroup().container_type == ContainerType::SystemdService {
                    return self.remap_if_moved(pid, container).await;
                }
                Some(container)
            }
            Some(PidState::Ignored) => None,
            None => self.on_process_start(pid).await,
        }
    }

    async fn remap_if_moved(&mut self, pid: u32, container: Arc<Container>) -> Option<Arc<Container>> {
        let cg = match self.read_cgroup(pid) {
            Ok(cg) => cg,
            Err(err) => {
                log::debug!(target: "container registry", "failed to re-read cgroup: pid={}, error={}", pid, err);
                return Some(container);
            }
        };
        if cg.id == container.cgroup().id {
            return Some(container);
        }
        log::debug!(
            target: "container registry",
            "process changed cgroup: pid={}, from={}, to={}",
            pid,
            container.cgroup().id,
            cg.id
        );
        self.on_process_exit(pid, EventReason::None);
        self.on_process_start(pid).await
    }

    fn queue_nat_lookup(&self, container: Arc<Container>, event: &Event, src: SocketAddr, dst: SocketAddr) {
        let request = NatRequest {
            container,
            pid: event.pid,
            fd: event.fd,
            timestamp: event.timestamp,
            src,
            dst,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.nat_tx.try_send(request) {
            log::debug!(
                target: "container registry",
                "NAT queue full, keeping observed destination: pid={}, dst={}",
                event.pid,
                dst
            );
        }
    }

    fn read_cgroup(&self, pid: u32) -> Result<Cgroup> {
        Ok(self.resolver.read_cgroup_by_pid(pid)?)
    }

    async fn lookup_metadata(&self, cg: &Cgroup) -> Result<Option<ContainerMetadata>> {
        if !cg.container_type.has_runtime_metadata() || cg.container_id.is_empty() {
            return Ok(None);
        }
        self.runtime
            .container_metadata(&cg.container_id)
            .await
            .map(Some)
            .map_err(|source| Error::Metadata {
                id: cg.container_id.clone(),
                source,
            })
    }

    fn attach(&mut self, pid: u32, container: &Arc<Container>) {
        container.add_pid(pid);
        self.by_pid.insert(pid, PidState::Mapped(Arc::clone(container)));
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cgroup::CgroupPrefix;
    use crate::conntrack::NoConntrack;
    use crate::kubernetes::{LABEL_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE};
    use crate::tracer::{L7Request, Protocol};

    const ID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ID_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[derive(Default)]
    struct FakeRuntime {
        metadata: HashMap<String, ContainerMetadata>,
        calls: AtomicUsize,
    }

    impl FakeRuntime {
        fn with(mut self, id: &str, metadata: ContainerMetadata) -> Self {
            self.metadata.insert(id.to_owned(), metadata);
            self
        }
    }

    impl RuntimeClient for FakeRuntime {
        async fn container_metadata(&self, id: &str) -> runtime::Result<ContainerMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.metadata
                .get(id)
                .cloned()
                .ok_or_else(|| runtime::Error::NotFound(id.to_owned()))
        }

        async fn list_container_ids(&self) -> runtime::Result<Vec<String>> {
            Ok(self.metadata.keys().cloned().collect())
        }
    }

    fn k8s(pod: &str, container: &str) -> ContainerMetadata {
        let mut metadata = ContainerMetadata::default();
        for (k, v) in [
            (LABEL_POD_NAME, pod),
            (LABEL_POD_NAMESPACE, "default"),
            (LABEL_CONTAINER_NAME, container),
        ] {
            metadata.labels.insert(k.to_owned(), v.to_owned());
        }
        metadata
    }

    fn write_cgroup(proc_root: &Path, pid: u32, path: &str) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cgroup"), format!("0::{path}\n")).unwrap();
    }

    fn containerd_path(id: &str) -> String {
        format!("/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod1.slice/cri-containerd-{id}.scope")
    }

    fn registry(proc_root: &Path, runtime: FakeRuntime) -> Registry<FakeRuntime> {
        Registry::new(
            CgroupResolver::new(proc_root, CgroupPrefix::none()),
            runtime,
            Arc::new(NoConntrack),
            Duration::from_secs(300),
        )
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn process_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));

        let first = reg.on_process_start(100).await.unwrap();
        let second = reg.on_process_start(100).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.identity().as_ref(), "/k8s/default/web/nginx");
        assert_eq!(first.pid_count(), 1);
        assert_eq!(reg.containers().len(), 1);
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pids_of_one_cgroup_share_a_container() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        write_cgroup(dir.path(), 101, &containerd_path(ID_A));
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));

        let a = reg.on_process_start(100).await.unwrap();
        let b = reg.on_process_start(101).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.pid_count(), 2);
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 1);

        reg.on_process_exit(100, EventReason::None);
        assert_eq!(reg.containers().len(), 1);
        assert!(reg.container_of(101).is_some());
    }

    #[tokio::test]
    async fn last_pid_exit_removes_container_from_all_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = containerd_path(ID_A);
        write_cgroup(dir.path(), 100, &path);
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));

        let container = reg.on_process_start(100).await.unwrap();
        let cgroup_id = container.cgroup().id.clone();
        assert_eq!(cgroup_id, path);
        reg.on_process_exit(100, EventReason::OomKill);

        assert!(reg.containers().is_empty());
        assert!(reg.container_by_cgroup(&cgroup_id).is_none());
        assert!(reg.container_of(100).is_none());

        // The old cgroup is resolved afresh.
        write_cgroup(dir.path(), 200, &path);
        let fresh = reg.on_process_start(200).await.unwrap();
        assert!(!Arc::ptr_eq(&container, &fresh));
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pause_container_is_ignored_permanently() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_B));
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_B, k8s("web", "POD")));

        assert!(reg.on_process_start(100).await.is_none());
        assert!(reg.is_ignored(100));
        assert!(reg.on_process_start(100).await.is_none());
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 1);
        assert!(reg.containers().is_empty());

        reg.on_process_exit(100, EventReason::None);
        assert!(!reg.is_ignored(100));
    }

    #[tokio::test]
    async fn metadata_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        let mut reg = registry(dir.path(), FakeRuntime::default());

        assert!(reg.on_process_start(100).await.is_none());
        assert!(!reg.is_ignored(100));
        assert!(reg.on_process_start(100).await.is_none());
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn host_processes_are_ignored_without_runtime_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 1, "/init.scope");
        write_cgroup(dir.path(), 2, "/init.scope");
        write_cgroup(dir.path(), 3, "/user.slice/user-1000.slice/session-2.scope");
        let mut reg = registry(dir.path(), FakeRuntime::default());

        for pid in [1, 2, 3] {
            assert!(reg.on_process_start(pid).await.is_none());
            assert!(reg.is_ignored(pid));
        }
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn systemd_service_needs_no_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 300, "/system.slice/nginx.service");
        let mut reg = registry(dir.path(), FakeRuntime::default());

        let container = reg.on_process_start(300).await.unwrap();
        assert_eq!(container.identity().as_ref(), "/system.slice/nginx.service");
        assert!(container.metadata().is_none());
        assert_eq!(reg.runtime.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vanished_process_is_not_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path(), FakeRuntime::default());
        assert!(reg.on_process_start(4242).await.is_none());
        assert!(!reg.is_ignored(4242));
    }

    #[tokio::test]
    async fn connection_events_resolve_unseen_pids() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));

        let mut open = Event::new(EventType::ConnectionOpen, 100);
        open.fd = 5;
        open.timestamp = 77;
        open.src = Some(addr("10.0.0.2:40000"));
        open.dst = Some(addr("10.0.0.9:80"));
        reg.handle_event(&open).await;

        let mut request = Event::new(EventType::L7Request, 100);
        request.fd = 5;
        request.timestamp = 77;
        request.l7_request = Some(L7Request {
            protocol: Protocol::Http,
            status: 500,
            duration: Duration::from_millis(3),
            method: 1,
            statement_id: 0,
            payload: b"GET / HTTP/1.1".to_vec(),
        });
        reg.handle_event(&request).await;

        let mut close = Event::new(EventType::ConnectionClose, 100);
        close.fd = 5;
        close.timestamp = 77;
        reg.handle_event(&close).await;

        let container = reg.container_of(100).unwrap();
        let summary = container.connections();
        assert_eq!(summary.open, 0);
        assert_eq!(summary.successful.len(), 1);
        assert_eq!(summary.l7[0].requests, 1);
        assert_eq!(summary.l7[0].failed, 1);
    }

    fn open_event(pid: u32, fd: u64, src: SocketAddr, dst: &str) -> Event {
        let mut open = Event::new(EventType::ConnectionOpen, pid);
        open.fd = fd;
        open.timestamp = fd + 1;
        open.src = Some(src);
        open.dst = Some(addr(dst));
        open
    }

    #[tokio::test]
    async fn exited_pid_leaves_no_connection_state_behind() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        write_cgroup(dir.path(), 101, &containerd_path(ID_A));
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));
        reg.on_process_start(101).await.unwrap();

        for fd in 0..1000u64 {
            let src = SocketAddr::new("10.0.0.2".parse().unwrap(), 20_000 + fd as u16);
            reg.handle_event(&open_event(100, fd, src, "10.0.0.9:80")).await;
        }
        let container = Arc::clone(reg.container_of(100).unwrap());
        assert_eq!(container.connections().open, 1000);

        // No close events arrive; the process just exits.
        reg.on_process_exit(100, EventReason::None);
        assert_eq!(container.connections().open, 0);

        reg.gc_connections(SystemTime::now() + Duration::from_secs(100_000));
        let summary = container.connections();
        assert_eq!(summary.open, 0);
        assert!(summary.successful.is_empty());
        assert!(reg.containers().contains_key("/k8s/default/web/nginx"));
    }

    #[tokio::test]
    async fn systemd_mapped_pid_follows_cgroup_change() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, "/system.slice/containerd.service");
        let mut reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));

        let service = reg.on_process_start(100).await.unwrap();
        assert_eq!(service.identity().as_ref(), "/system.slice/containerd.service");

        // The shim moved the process into the container's cgroup.
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        reg.handle_event(&open_event(100, 5, addr("10.0.0.2:40000"), "10.0.0.9:80")).await;

        let container = reg.container_of(100).unwrap();
        assert_eq!(container.identity().as_ref(), "/k8s/default/web/nginx");
        assert_eq!(container.connections().open, 1);
        assert!(reg.container_by_cgroup("/system.slice/containerd.service").is_none());
        assert!(!reg.containers().contains_key("/system.slice/containerd.service"));
    }

    #[tokio::test]
    async fn systemd_mapped_pid_stays_while_cgroup_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 300, "/system.slice/nginx.service");
        let mut reg = registry(dir.path(), FakeRuntime::default());

        let service = reg.on_process_start(300).await.unwrap();
        let mut listen = Event::new(EventType::ListenOpen, 300);
        listen.src = Some(addr("0.0.0.0:80"));
        reg.handle_event(&listen).await;

        assert!(Arc::ptr_eq(reg.container_of(300).unwrap(), &service));
        assert_eq!(service.connections().listens, vec![addr("0.0.0.0:80")]);
    }

    #[tokio::test]
    async fn run_drains_channel_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        write_cgroup(dir.path(), 100, &containerd_path(ID_A));
        let reg = registry(dir.path(), FakeRuntime::default().with(ID_A, k8s("web", "nginx")));
        let containers = reg.containers();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(reg.run(rx));
        tx.send(Arc::new(Event::process_start(100))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(containers.contains_key("/k8s/default/web/nginx"));
    }
}
