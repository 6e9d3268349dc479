use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::tracer::{L7Request, Protocol};

/// One open socket of one process. Fds are reused, so entries are overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PidFd {
    pub pid: u32,
    pub fd: u64,
}

/// A logical connection keyed by its source and post-NAT destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrPair {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveConnection {
    pub src: SocketAddr,
    pub dest: SocketAddr,
    pub actual_dest: SocketAddr,
    pub pid: u32,
    pub fd: u64,
    /// Kernel timestamp of the open, used to detect fd reuse.
    pub timestamp: u64,
    /// `None` while the connection is open.
    pub closed: Option<SystemTime>,
}

impl ActiveConnection {
    fn same_connection(&self, other: &ActiveConnection) -> bool {
        self.pid == other.pid && self.fd == other.fd && self.timestamp == other.timestamp
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L7Stats {
    pub requests: u64,
    pub failed: u64,
    pub total_duration: Duration,
}

/// Connection state of a single container.
///
/// The tracker itself is not synchronized; [`super::Container`] wraps it in a
/// reader/writer lock.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    by_pid_fd: HashMap<PidFd, ActiveConnection>,
    active: HashMap<AddrPair, ActiveConnection>,
    successful: HashMap<AddrPair, u64>,
    failed: HashMap<SocketAddr, u64>,
    last_attempt: HashMap<SocketAddr, SystemTime>,
    retransmits: HashMap<SocketAddr, u64>,
    listens: BTreeSet<SocketAddr>,
    l7: HashMap<(Protocol, SocketAddr), L7Stats>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connection attempt to `dst`.
    ///
    /// `actual_dst` is the post-NAT destination of successful opens; failed
    /// opens only bump the failure counter of `dst`. Loopback destinations are
    /// ignored.
    #[allow(clippy::too_many_arguments)]
    pub fn record_open(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        actual_dst: SocketAddr,
        pid: u32,
        fd: u64,
        timestamp: u64,
        is_error: bool,
        now: SystemTime,
    ) {
        if dst.ip().is_loopback() {
            return;
        }
        self.last_attempt.insert(dst, now);
        if is_error {
            *self.failed.entry(dst).or_default() += 1;
            return;
        }

        let conn = ActiveConnection {
            src,
            dest: dst,
            actual_dest: actual_dst,
            pid,
            fd,
            timestamp,
            closed: None,
        };
        let pair = AddrPair {
            src,
            dst: actual_dst,
        };
        self.by_pid_fd.insert(PidFd { pid, fd }, conn);
        self.active.insert(pair, conn);
        *self.successful.entry(pair).or_default() += 1;
    }

    /// Marks the connection held by `pid`/`fd` as closed.
    ///
    /// A non-zero `timestamp` that disagrees with the recorded open belongs to
    /// an older use of the fd and is ignored. Returns whether a connection was closed.
    pub fn on_connection_close(&mut self, pid: u32, fd: u64, timestamp: u64, now: SystemTime) -> bool {
        let key = PidFd { pid, fd };
        match self.by_pid_fd.get(&key) {
            Some(conn) if timestamp == 0 || conn.timestamp == timestamp => {}
            _ => return false,
        }
        if let Some(conn) = self.by_pid_fd.remove(&key) {
            self.stamp_closed(&conn, now);
        }
        true
    }

    /// Closes every connection still held by `pid`.
    ///
    /// Close events can be dropped under load, so an exiting process must not
    /// leave its connections open. Returns the number of connections closed.
    pub fn on_pid_exit(&mut self, pid: u32, now: SystemTime) -> usize {
        let mut gone = Vec::new();
        self.by_pid_fd.retain(|key, conn| {
            if key.pid == pid {
                gone.push(*conn);
                false
            } else {
                true
            }
        });
        for conn in &gone {
            self.stamp_closed(conn, now);
        }
        gone.len()
    }

    /// Moves an open connection to the post-NAT destination `actual_dst`.
    ///
    /// Returns `false` if the fd no longer holds the connection opened at
    /// `timestamp`, or if it already points at `actual_dst`.
    pub fn resolve_destination(&mut self, pid: u32, fd: u64, timestamp: u64, actual_dst: SocketAddr) -> bool {
        let Some(conn) = self.by_pid_fd.get_mut(&PidFd { pid, fd }) else {
            return false;
        };
        if conn.timestamp != timestamp || conn.actual_dest == actual_dst {
            return false;
        }
        let old = AddrPair {
            src: conn.src,
            dst: conn.actual_dest,
        };
        conn.actual_dest = actual_dst;
        let updated = *conn;
        let new = AddrPair {
            src: updated.src,
            dst: actual_dst,
        };

        if self.active.get(&old).is_some_and(|a| a.same_connection(&updated)) {
            self.active.remove(&old);
        }
        self.active.insert(new, updated);
        if let Some(count) = self.successful.get_mut(&old) {
            *count -= 1;
            if *count == 0 {
                self.successful.remove(&old);
            }
        }
        *self.successful.entry(new).or_default() += 1;
        true
    }

    fn stamp_closed(&mut self, conn: &ActiveConnection, now: SystemTime) {
        let pair = AddrPair {
            src: conn.src,
            dst: conn.actual_dest,
        };
        if let Some(active) = self.active.get_mut(&pair) {
            if active.same_connection(conn) {
                active.closed = Some(now);
            }
        }
    }

    pub fn on_retransmit(&mut self, _src: SocketAddr, dst: SocketAddr) {
        *self.retransmits.entry(dst).or_default() += 1;
    }

    pub fn on_listen_open(&mut self, addr: SocketAddr) {
        self.listens.insert(addr);
    }

    pub fn on_listen_close(&mut self, addr: SocketAddr) {
        self.listens.remove(&addr);
    }

    /// Attributes an L7 request to the connection open on `pid`/`fd`.
    ///
    /// Returns `false` when the request was discarded because no connection is
    /// open on the fd, or because `timestamp` is non-zero and names a different
    /// connection than the one currently using the fd.
    pub fn on_l7_request(&mut self, pid: u32, fd: u64, timestamp: u64, request: &L7Request) -> bool {
        let Some(conn) = self.by_pid_fd.get(&PidFd { pid, fd }) else {
            return false;
        };
        if timestamp != 0 && conn.timestamp != timestamp {
            return false;
        }
        let stats = self
            .l7
            .entry((request.protocol, conn.actual_dest))
            .or_default();
        stats.requests += 1;
        if request.is_failed() {
            stats.failed += 1;
        }
        stats.total_duration += request.duration;
        true
    }

    pub fn active_connection(&self, pid: u32, fd: u64) -> Option<&ActiveConnection> {
        self.by_pid_fd.get(&PidFd { pid, fd })
    }

    /// Drops closed connections whose close is older than `ttl`, together with
    /// their success counters, and forgets destinations not attempted within `ttl`.
    ///
    /// Returns the number of connections dropped.
    pub fn gc(&mut self, now: SystemTime, ttl: Duration) -> usize {
        let expired = |at: SystemTime| now.duration_since(at).unwrap_or_default() >= ttl;

        let before = self.active.len();
        self.active.retain(|_, conn| !conn.closed.is_some_and(expired));
        let purged = before - self.active.len();

        let active = &self.active;
        self.successful.retain(|pair, _| active.contains_key(pair));
        self.last_attempt.retain(|_, at| !expired(*at));
        let last_attempt = &self.last_attempt;
        self.failed.retain(|dst, _| last_attempt.contains_key(dst));
        purged
    }

    pub fn snapshot(&self) -> ConnectionSummary {
        let mut summary = ConnectionSummary {
            open: self.by_pid_fd.len(),
            ..Default::default()
        };

        for (pair, count) in &self.successful {
            summary.successful.push(PairCount {
                src: pair.src,
                dst: pair.dst,
                count: *count,
            });
        }
        for (dst, count) in &self.failed {
            summary.failed.push(DestinationCount {
                dst: *dst,
                count: *count,
            });
        }
        for (dst, count) in &self.retransmits {
            summary.retransmits.push(DestinationCount {
                dst: *dst,
                count: *count,
            });
        }
        for ((protocol, dst), stats) in &self.l7 {
            summary.l7.push(L7Summary {
                protocol: *protocol,
                dst: *dst,
                requests: stats.requests,
                failed: stats.failed,
                total_duration_ms: stats.total_duration.as_secs_f64() * 1000.0,
            });
        }
        summary.listens = self.listens.iter().copied().collect();

        summary.successful.sort_by_key(|c| (c.dst, c.src));
        summary.failed.sort_by_key(|c| c.dst);
        summary.retransmits.sort_by_key(|c| c.dst);
        summary.l7.sort_by_key(|s| (s.dst, s.protocol));
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub open: usize,
    pub successful: Vec<PairCount>,
    pub failed: Vec<DestinationCount>,
    pub retransmits: Vec<DestinationCount>,
    pub listens: Vec<SocketAddr>,
    pub l7: Vec<L7Summary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairCount {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationCount {
    pub dst: SocketAddr,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct L7Summary {
    pub protocol: Protocol,
    pub dst: SocketAddr,
    pub requests: u64,
    pub failed: u64,
    pub total_duration_ms: f64,
}
