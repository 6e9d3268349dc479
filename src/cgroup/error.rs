use std::path::PathBuf;

use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Read(#[from] fsutil::FileOpenError),
    #[error("invalid line in cgroup file `{path}`: {source}")]
    Line {
        path: PathBuf,
        #[source]
        source: super::CgroupLineError,
    },
    #[error("no cgroup path found in `{path}`")]
    MissingPath { path: PathBuf },
    #[error("invalid docker cgroup `{0}`")]
    InvalidDockerCgroup(String),
    #[error("invalid systemd cgroup `{0}`")]
    InvalidSystemdCgroup(String),
    #[error("unknown container cgroup `{0}`")]
    UnknownContainer(String),
    #[error("failed to read cgroup namespace link `{path}`: {source}")]
    ReadNamespace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to switch to cgroup namespace `{path}`: {source}")]
    SwitchNamespace {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to restore the original cgroup namespace: {0}")]
    RestoreNamespace(#[source] nix::Error),
    #[error("failed to spawn cgroup namespace worker: {0}")]
    SpawnNamespaceWorker(#[source] std::io::Error),
    #[error("cgroup namespace worker panicked")]
    NamespaceWorkerPanicked,
}

impl Error {
    /// Returns `true` if the error means the process no longer exists.
    pub fn is_process_gone(&self) -> bool {
        matches!(self, Error::Read(err) if err.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
