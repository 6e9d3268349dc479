//! Resolution of NAT-translated connection destinations.

use std::collections::HashMap;
use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::ResultOkLogExt;
use crate::{fsutil, proc};

/// Maps the destination a process connected to onto the address the kernel
/// actually translated it to.
pub trait Conntrack: Send + Sync {
    /// Returns the post-NAT destination of the connection `src -> observed_dst`,
    /// or `None` if no translation is known.
    fn actual_destination(&self, src: SocketAddr, observed_dst: SocketAddr) -> Option<SocketAddr>;

    /// Resolves many `(src, observed_dst)` pairs at once; the result is index
    /// aligned with `keys`.
    fn actual_destinations(&self, keys: &[(SocketAddr, SocketAddr)]) -> Vec<Option<SocketAddr>> {
        keys.iter()
            .map(|&(src, dst)| self.actual_destination(src, dst))
            .collect()
    }
}

/// A resolver that never knows a translation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConntrack;

impl Conntrack for NoConntrack {
    fn actual_destination(&self, _: SocketAddr, _: SocketAddr) -> Option<SocketAddr> {
        None
    }
}

/// Reads the host conntrack table from `nf_conntrack` on every lookup.
#[derive(Debug, Clone)]
pub struct ProcConntrack {
    path: PathBuf,
}

impl ProcConntrack {
    /// Uses the conntrack table of the host network namespace under `proc_root`.
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        Self::from_file(proc::path(proc_root, 1, ["net", "nf_conntrack"]))
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Whether the table can currently be read.
    pub fn is_available(&self) -> bool {
        fsutil::open_file_reader(&self.path).is_ok()
    }

    /// Resolves all `keys` in a single pass over the table.
    fn lookup_many(
        &self,
        keys: &[(SocketAddr, SocketAddr)],
    ) -> Result<Vec<Option<SocketAddr>>, fsutil::FileOpenError> {
        let mut resolved = vec![None; keys.len()];
        let mut pending: HashMap<(SocketAddr, SocketAddr), Vec<usize>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            pending.entry(*key).or_default().push(i);
        }

        let reader = fsutil::open_file_reader(&self.path)?;
        for line in reader.lines() {
            if pending.is_empty() {
                break;
            }
            let line = line.map_err(|source| fsutil::FileOpenError {
                path: self.path.clone(),
                source,
            })?;
            let Some(entry) = parse_entry(&line) else {
                continue;
            };
            if let Some(indices) = pending.remove(&(entry.original.src, entry.original.dst)) {
                for i in indices {
                    resolved[i] = Some(entry.reply.src);
                }
            }
        }
        Ok(resolved)
    }
}

impl Conntrack for ProcConntrack {
    fn actual_destination(&self, src: SocketAddr, observed_dst: SocketAddr) -> Option<SocketAddr> {
        self.actual_destinations(&[(src, observed_dst)])
            .pop()
            .flatten()
    }

    fn actual_destinations(&self, keys: &[(SocketAddr, SocketAddr)]) -> Vec<Option<SocketAddr>> {
        self.lookup_many(keys)
            .ok_log_at(log::Level::Warn)
            .unwrap_or_else(|| vec![None; keys.len()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tuple {
    src: SocketAddr,
    dst: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    original: Tuple,
    reply: Tuple,
}

/// Parses one `nf_conntrack` line. The first `src`/`dst`/`sport`/`dport` group is
/// the original direction, the second one the reply direction.
fn parse_entry(line: &str) -> Option<Entry> {
    let mut ips: [Vec<IpAddr>; 2] = [Vec::with_capacity(2), Vec::with_capacity(2)];
    let mut ports: [Vec<u16>; 2] = [Vec::with_capacity(2), Vec::with_capacity(2)];

    for field in line.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "src" | "dst" => ips[usize::from(key == "dst")].push(value.parse().ok()?),
            "sport" | "dport" => ports[usize::from(key == "dport")].push(value.parse().ok()?),
            _ => {}
        }
    }

    let [srcs, dsts] = &ips;
    let [sports, dports] = &ports;
    if srcs.len() < 2 || dsts.len() < 2 || sports.len() < 2 || dports.len() < 2 {
        return None;
    }
    let tuple = |i: usize| Tuple {
        src: SocketAddr::new(srcs[i], sports[i]),
        dst: SocketAddr::new(dsts[i], dports[i]),
    };
    Some(Entry {
        original: tuple(0),
        reply: tuple(1),
    })
}
