//! Multicast membership daemon
//!
//! Each connection to the control socket is one membership session: it binds
//! to an interface, then joins and leaves IPv4 multicast groups. Memberships
//! are refcounted per session and released when the connection ends.

pub mod client;
pub mod config;
pub mod error;
#[cfg(target_os = "linux")]
pub mod kernel;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use config::{ControlPlaneKind, DaemonConfig, DEFAULT_CONFIG_PATH};
pub use error::{DaemonError, Result};
#[cfg(target_os = "linux")]
pub use kernel::{KernelInterfaceResolver, SocketControlPlane};
pub use protocol::{ProtocolError, Request};
pub use server::MembershipServer;
