//! Helpers for procfs paths and host information.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to list processes in `{path}`: {source}")]
    ListPids {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to query kernel release: {0}")]
    Uname(#[source] nix::Error),
    #[error("invalid kernel version `{0}`")]
    InvalidKernelVersion(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns `<proc_root>/<pid>/<subpath...>`.
pub fn path<I, S>(proc_root: impl AsRef<Path>, pid: u32, subpath: I) -> PathBuf
where
    I: IntoIterator<Item = S>,
    S: AsRef<Path>,
{
    let mut out = proc_root.as_ref().join(pid.to_string());
    for part in subpath {
        out.push(part);
    }
    out
}

/// Resolves `subpath` under the root filesystem of the host init process.
///
/// Runtime sockets are reached this way so the agent does not need the host
/// filesystem mounted into its own mount namespace.
pub fn host_root_path(proc_root: impl AsRef<Path>, subpath: impl AsRef<Path>) -> PathBuf {
    let subpath = subpath.as_ref();
    let subpath = subpath.strip_prefix("/").unwrap_or(subpath);
    path(proc_root, 1, ["root"]).join(subpath)
}

/// Lists all numeric entries of the proc root, i.e., every live process.
///
/// # Errors
///
/// Returns [`Error::ListPids`] if the proc root cannot be read.
pub fn list_pids(proc_root: impl AsRef<Path>) -> Result<Vec<u32>> {
    let proc_root = proc_root.as_ref();
    let entries = std::fs::read_dir(proc_root).map_err(|source| Error::ListPids {
        path: proc_root.to_path_buf(),
        source,
    })?;

    let mut pids = Vec::with_capacity(256);
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();

    Ok(pids)
}

/// Returns the release string of the running kernel, e.g. `5.15.0-91-generic`.
///
/// # Errors
///
/// Returns [`Error::Uname`] if `uname(2)` fails.
pub fn kernel_release() -> Result<String> {
    let uts = nix::sys::utsname::uname().map_err(Error::Uname)?;
    Ok(uts.release().to_string_lossy().into_owned())
}

/// Major and minor version of a Linux kernel.
///
/// Ordering is numeric on `(major, minor)`, which matches semantic-version
/// ordering of the normalized `vMAJOR.MINOR` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses the leading `MAJOR.MINOR` of a kernel release string.
    ///
    /// An optional `v` prefix is accepted so image names like `v5.1` parse too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKernelVersion`] if no `MAJOR.MINOR` prefix is present.
    pub fn parse(release: &str) -> Result<Self> {
        let invalid = || Error::InvalidKernelVersion(release.to_owned());
        let s = release.trim();
        let s = s.strip_prefix('v').unwrap_or(s);

        let mut parts = s.splitn(3, '.');
        let major = parts
            .next()
            .and_then(leading_number)
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(leading_number)
            .ok_or_else(invalid)?;

        Ok(Self { major, minor })
    }
}

fn leading_number(s: &str) -> Option<u32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

impl FromStr for KernelVersion {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path() {
        assert_eq!(
            path("/proc", 9708, ["net", "dev"]),
            PathBuf::from("/proc/9708/net/dev")
        );
        assert_eq!(
            path("/host/proc", 1, ["cgroup"]),
            PathBuf::from("/host/proc/1/cgroup")
        );
    }

    #[test]
    fn test_host_root_path() {
        assert_eq!(
            host_root_path("/proc", "/run/containerd/containerd.sock"),
            PathBuf::from("/proc/1/root/run/containerd/containerd.sock")
        );
    }

    #[test]
    fn test_list_pids_skips_non_numeric() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1", "42", "self", "net", "1337"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("99"), "not a dir").unwrap();

        let pids = list_pids(dir.path()).unwrap();
        assert_eq!(pids, vec![1, 42, 1337]);
    }

    #[test]
    fn test_list_pids_missing_root() {
        let err = list_pids("/definitely/does/not/exist").unwrap_err();
        assert!(matches!(err, Error::ListPids { .. }));
    }

    #[test]
    fn test_kernel_version_parse() {
        assert_eq!(
            KernelVersion::parse("5.15.0-91-generic").unwrap(),
            KernelVersion::new(5, 15)
        );
        assert_eq!(KernelVersion::parse("v4.16").unwrap(), KernelVersion::new(4, 16));
        assert_eq!(KernelVersion::parse("6.1").unwrap(), KernelVersion::new(6, 1));
        assert_eq!(
            KernelVersion::parse("6.8-rc1").unwrap(),
            KernelVersion::new(6, 8)
        );
        assert!(KernelVersion::parse("garbage").is_err());
        assert!(KernelVersion::parse("5").is_err());
    }

    #[test]
    fn test_kernel_version_ordering() {
        assert!(KernelVersion::new(5, 10) > KernelVersion::new(5, 9));
        assert!(KernelVersion::new(6, 0) > KernelVersion::new(5, 15));
        assert_eq!(KernelVersion::new(5, 1).to_string(), "v5.1");
    }
}
