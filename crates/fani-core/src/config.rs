//! Node configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use crate::discovery::LanConfig;
use crate::orchestrator::{InputAssembly, StageTimeouts};
use crate::sandbox::SandboxConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a fani node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the on-disk block store.
    pub home: PathBuf,

    /// Directory for verified bytecode.
    pub cache_dir: PathBuf,

    /// Block server bind address. Port 0 picks a free port.
    pub listen: SocketAddr,

    /// Peers to connect to at startup, as `host:port`.
    pub bootstrap: Vec<String>,

    /// Enable LAN discovery (default: true).
    pub discovery_enabled: bool,

    /// UDP port for LAN announcements (default: 4690).
    pub discovery_port: u16,

    /// Capacity of the discovery event queue (default: 64).
    pub discovery_queue: usize,

    /// WebAssembly runtime binary (default: `wasmtime`).
    pub runtime: PathBuf,

    /// Limit for each fetch and store write (default: 30s).
    pub fetch_timeout: Duration,

    /// Limit for one module run (default: 60s).
    pub exec_timeout: Duration,

    /// How call arguments become module input (default: first argument only).
    pub input_assembly: InputAssembly,

    /// Keep blocks in memory instead of under `home`.
    pub ephemeral: bool,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bootstrap peer {0:?}, expected host:port")]
    InvalidBootstrap(String),

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("discovery queue capacity must be greater than zero")]
    ZeroQueue,

    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("./.fani"),
            cache_dir: PathBuf::from("./cache"),
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            bootstrap: Vec::new(),
            discovery_enabled: true,
            discovery_port: 4690,
            discovery_queue: 64,
            runtime: PathBuf::from("wasmtime"),
            fetch_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(60),
            input_assembly: InputAssembly::FirstArgument,
            ephemeral: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `FANI_HOME` | `./.fani` |
    /// | `FANI_CACHE_DIR` | `./cache` |
    /// | `FANI_LISTEN` | `0.0.0.0:0` |
    /// | `FANI_BOOTSTRAP` | empty (comma-separated `host:port`) |
    /// | `FANI_DISCOVERY` | `true` |
    /// | `FANI_DISCOVERY_PORT` | `4690` |
    /// | `FANI_DISCOVERY_QUEUE` | `64` |
    /// | `FANI_RUNTIME` | `wasmtime` |
    /// | `FANI_FETCH_TIMEOUT_SECS` | `30` |
    /// | `FANI_EXEC_TIMEOUT_SECS` | `60` |
    /// | `FANI_INPUT_MODE` | `first` (first, framed) |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            home: std::env::var("FANI_HOME")
                .map(PathBuf::from)
                .unwrap_or(default.home),
            cache_dir: std::env::var("FANI_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.cache_dir),
            listen: std::env::var("FANI_LISTEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.listen),
            bootstrap: std::env::var("FANI_BOOTSTRAP")
                .map(|v| parse_list(&v))
                .unwrap_or(default.bootstrap),
            discovery_enabled: std::env::var("FANI_DISCOVERY")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.discovery_enabled),
            discovery_port: std::env::var("FANI_DISCOVERY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.discovery_port),
            discovery_queue: std::env::var("FANI_DISCOVERY_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.discovery_queue),
            runtime: std::env::var("FANI_RUNTIME")
                .map(PathBuf::from)
                .unwrap_or(default.runtime),
            fetch_timeout: std::env::var("FANI_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.fetch_timeout),
            exec_timeout: std::env::var("FANI_EXEC_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.exec_timeout),
            input_assembly: std::env::var("FANI_INPUT_MODE")
                .ok()
                .and_then(|v| InputAssembly::parse(&v))
                .unwrap_or(default.input_assembly),
            ephemeral: default.ephemeral,
        }
    }

    /// Validate the configuration.
    ///
    /// Call this at startup to get clear error messages about bad values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for peer in &self.bootstrap {
            if !looks_like_host_port(peer) {
                return Err(ConfigError::InvalidBootstrap(peer.clone()));
            }
        }

        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("fetch timeout"));
        }
        if self.exec_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("exec timeout"));
        }
        if self.discovery_queue == 0 {
            return Err(ConfigError::ZeroQueue);
        }

        for dir in [&self.home, &self.cache_dir] {
            if dir.exists() && !dir.is_dir() {
                return Err(ConfigError::NotADirectory(dir.clone()));
            }
        }

        Ok(())
    }

    /// Log warnings for problems that only matter once a function runs.
    pub fn validate_warn(&self) {
        if !runtime_available(&self.runtime) {
            tracing::warn!("WebAssembly runtime not found: {:?}", self.runtime);
        }
    }

    pub fn stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            resolve: self.fetch_timeout,
            fetch: self.fetch_timeout,
            execute: self.exec_timeout,
            publish: self.fetch_timeout,
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            runtime: self.runtime.clone(),
            ..SandboxConfig::default()
        }
    }

    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            port: self.discovery_port,
            ..LanConfig::default()
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Whether `runtime` is a path to a file or a name found on `PATH`.
fn runtime_available(runtime: &std::path::Path) -> bool {
    if runtime.components().count() > 1 {
        return runtime.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(runtime).is_file()))
        .unwrap_or(false)
}

fn looks_like_host_port(value: &str) -> bool {
    if value.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
