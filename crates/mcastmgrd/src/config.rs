//! Configuration file support for mcastmgrd
//!
//! Loads and validates daemon configuration from TOML files.
//! Default location: /etc/mcastmgrd/mcastmgrd.toml

use crate::error::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mcastmgrd/mcastmgrd.toml";

/// Which control plane backs the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPlaneKind {
    /// Kernel IP stack via socket options (Linux only)
    Kernel,
    /// In-process bookkeeping, no kernel changes
    Memory,
}

impl ControlPlaneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlPlaneKind::Kernel => "kernel",
            ControlPlaneKind::Memory => "memory",
        }
    }
}

/// Control socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unix stream socket the daemon listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Maximum number of concurrently open sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

/// Membership engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Maximum distinct groups one session may hold
    #[serde(default = "default_max_groups_per_session")]
    pub max_groups_per_session: usize,

    /// Control plane implementation
    #[serde(default = "default_control_plane")]
    pub control_plane: ControlPlaneKind,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Complete mcastmgrd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/mcastmgrd.sock")
}

fn default_max_sessions() -> usize {
    1024
}

// Per session. Same value as the Linux per-socket net.ipv4.igmp_max_memberships.
fn default_max_groups_per_session() -> usize {
    20
}

fn default_control_plane() -> ControlPlaneKind {
    if cfg!(target_os = "linux") {
        ControlPlaneKind::Kernel
    } else {
        ControlPlaneKind::Memory
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            max_groups_per_session: default_max_groups_per_session(),
            control_plane: default_control_plane(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DaemonError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map_err(|e| {
                DaemonError::Configuration(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(DaemonError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.socket_path.as_os_str().is_empty() {
            return Err(DaemonError::Configuration(
                "socket_path cannot be empty".to_string(),
            ));
        }

        if self.server.max_sessions == 0 {
            return Err(DaemonError::Configuration(
                "max_sessions must be > 0".to_string(),
            ));
        }

        if self.membership.max_groups_per_session == 0 {
            return Err(DaemonError::Configuration(
                "max_groups_per_session must be > 0".to_string(),
            ));
        }

        if self.membership.control_plane == ControlPlaneKind::Kernel
            && !cfg!(target_os = "linux")
        {
            return Err(DaemonError::Configuration(
                "kernel control plane is only available on Linux".to_string(),
            ));
        }

        Ok(())
    }
}
