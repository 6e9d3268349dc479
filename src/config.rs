//! Agent configuration.
//!
//! The agent runs as a privileged daemon, so all settings come from the
//! environment. Every value has a default that matches a standard host layout.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_EBPF_DIR: &str = "/usr/lib/sense-agent/ebpf";
pub const DEFAULT_CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_DOCKER_SOCKET: &str = "/run/docker.sock";
/// Depth of the funnel channel between the tracer and the registry.
pub const DEFAULT_EVENT_BUFFER: usize = 10_000;
pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Mount point of procfs as seen by the agent.
    pub proc_root: PathBuf,
    /// Directory containing the per-architecture instrumentation images.
    pub ebpf_dir: PathBuf,
    pub api_listen: SocketAddr,
    /// containerd socket path, relative to the host root filesystem.
    pub containerd_socket: PathBuf,
    /// docker socket path, relative to the host root filesystem.
    pub docker_socket: PathBuf,
    pub event_buffer: usize,
    pub disable_l7: bool,
    /// How long a closed connection is kept before it is purged.
    pub connection_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            ebpf_dir: PathBuf::from(DEFAULT_EBPF_DIR),
            api_listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            containerd_socket: PathBuf::from(DEFAULT_CONTAINERD_SOCKET),
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            event_buffer: DEFAULT_EVENT_BUFFER,
            disable_l7: false,
            connection_ttl: DEFAULT_CONNECTION_TTL,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if a value is present but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("SENSE_PROC_ROOT") {
            config.proc_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENSE_EBPF_DIR") {
            config.ebpf_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENSE_API_LISTEN") {
            config.api_listen = v.parse().map_err(|err: std::net::AddrParseError| {
                Error::InvalidValue {
                    key: "SENSE_API_LISTEN",
                    value: v.clone(),
                    reason: err.to_string(),
                }
            })?;
        }
        if let Some(v) = lookup("SENSE_CONTAINERD_SOCKET") {
            config.containerd_socket = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENSE_DOCKER_SOCKET") {
            config.docker_socket = PathBuf::from(v);
        }
        if let Some(v) = lookup("SENSE_EVENT_BUFFER") {
            config.event_buffer = parse_positive("SENSE_EVENT_BUFFER", &v)?;
        }
        if let Some(v) = lookup("SENSE_DISABLE_L7") {
            config.disable_l7 = parse_bool("SENSE_DISABLE_L7", &v)?;
        }
        if let Some(v) = lookup("SENSE_CONNECTION_TTL_SECS") {
            let secs = parse_positive("SENSE_CONNECTION_TTL_SECS", &v)?;
            config.connection_ttl = Duration::from_secs(secs as u64);
        }

        log::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(Error::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "must be greater than zero".to_owned(),
        }),
        Ok(n) => Ok(n),
        Err(err) => Err(Error::InvalidValue {
            key,
            value: value.to_owned(),
            reason: err.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "expected a boolean".to_owned(),
        }),
    }
}
