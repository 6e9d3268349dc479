use std::fs::File;
use std::path::{Path, PathBuf};

use nix::sched::{CloneFlags, setns};

use super::parser::{join_cgroup_path, parse_cgroup_line};
use super::{Error, Result};
use crate::fsutil;

/// Host-relative cgroup path of the agent itself.
///
/// When the agent runs inside its own cgroup namespace, the kernel renders every
/// cgroup path relative to the agent's cgroup. Joining those paths onto this
/// prefix turns them back into host-relative paths. On the host the prefix is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupPrefix(String);

impl CgroupPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// A prefix for an agent that shares the host cgroup namespace.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Detects the prefix by comparing the agent's cgroup namespace with the one
    /// of the init process.
    ///
    /// If they differ, a dedicated thread joins the host cgroup namespace, reads
    /// the agent's own cgroup path from there and switches back before exiting.
    /// The switch is undone even if reading fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace links cannot be read, either namespace
    /// switch fails, or the agent's cgroup file cannot be parsed.
    pub fn detect(proc_root: impl AsRef<Path>) -> Result<Self> {
        let proc_root = proc_root.as_ref().to_path_buf();
        let self_ns_path = proc_root.join("self/ns/cgroup");
        let host_ns_path = proc_root.join("1/ns/cgroup");

        if !is_cgroup_namespace_isolated(&self_ns_path, &host_ns_path)? {
            log::debug!("Agent shares the host cgroup namespace");
            return Ok(Self::none());
        }

        log::info!("Agent runs in a nested cgroup namespace, resolving host prefix");
        let worker = std::thread::Builder::new()
            .name("cgroupns".to_owned())
            .spawn(move || read_prefix_from_host_namespace(&proc_root, &self_ns_path, &host_ns_path))
            .map_err(Error::SpawnNamespaceWorker)?;
        let prefix = worker.join().map_err(|_| Error::NamespaceWorkerPanicked)??;

        log::info!("Detected cgroup prefix `{}`", prefix.as_str());
        Ok(prefix)
    }
}

fn is_cgroup_namespace_isolated(self_ns: &Path, host_ns: &Path) -> Result<bool> {
    let read = |path: &Path| {
        std::fs::read_link(path).map_err(|source| Error::ReadNamespace {
            path: path.to_path_buf(),
            source,
        })
    };
    Ok(read(self_ns)? != read(host_ns)?)
}

fn read_prefix_from_host_namespace(
    proc_root: &Path,
    self_ns_path: &Path,
    host_ns_path: &Path,
) -> Result<CgroupPrefix> {
    let open = |path: &Path| {
        File::open(path).map_err(|source| Error::ReadNamespace {
            path: path.to_path_buf(),
            source,
        })
    };
    let original = open(self_ns_path)?;
    let host = open(host_ns_path)?;

    let guard = NamespaceGuard::enter(original, &host, host_ns_path)?;
    let prefix = read_own_cgroup_path(&proc_root.join("self/cgroup"));
    guard.restore()?;

    Ok(CgroupPrefix(prefix?))
}

fn read_own_cgroup_path(path: &Path) -> Result<String> {
    let content = fsutil::read_to_string(path)?;
    own_cgroup_path_from_str(&content, path)
}

/// Picks the agent's cgroup path from a cgroup file: the `cpu` controller under
/// v1, otherwise the unified v2 path.
fn own_cgroup_path_from_str(content: &str, origin: &Path) -> Result<String> {
    let mut unified = None;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let cgl = parse_cgroup_line(line).map_err(|source| Error::Line {
            path: origin.to_path_buf(),
            source,
        })?;
        if cgl.controller_list.contains(&"cpu") {
            return Ok(join_cgroup_path("", cgl.cgroup_path));
        }
        if cgl.controller_list.is_empty() {
            unified = Some(join_cgroup_path("", cgl.cgroup_path));
        }
    }
    unified.ok_or_else(|| Error::MissingPath {
        path: origin.to_path_buf(),
    })
}

/// Switches the calling thread into a cgroup namespace and switches it back on drop.
struct NamespaceGuard {
    original: Option<File>,
}

impl NamespaceGuard {
    fn enter(original: File, target: &File, target_path: &Path) -> Result<Self> {
        setns(target, CloneFlags::CLONE_NEWCGROUP).map_err(|source| Error::SwitchNamespace {
            path: PathBuf::from(target_path),
            source,
        })?;
        Ok(Self {
            original: Some(original),
        })
    }

    fn restore(mut self) -> Result<()> {
        match self.original.take() {
            Some(original) => {
                setns(&original, CloneFlags::CLONE_NEWCGROUP).map_err(Error::RestoreNamespace)
            }
            None => Ok(()),
        }
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(err) = setns(&original, CloneFlags::CLONE_NEWCGROUP) {
                log::error!("failed to restore the original cgroup namespace: {}", err);
            }
        }
    }
}
