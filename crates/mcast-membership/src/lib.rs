//! Per-session IPv4 multicast membership engine.
//!
//! A [`Session`] binds to one network interface and joins/leaves multicast
//! groups on it. Joins are refcounted per session: only the first join of a
//! group and the leave that drops it back to zero reach the
//! [`MulticastControlPlane`]. Closing a session releases every membership it
//! still holds, whatever its count.
//!
//! - [`GroupRegistry`]: lock-free lookups, serialized mutation, deferred reclamation
//! - [`InterfaceBinding`]: resolution of an index or local address to an interface
//! - [`Session`]: `Unbound -> Bound -> Closed` lifecycle
//! - [`memory`]: in-process control plane and resolver
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use mcast_membership::{BindRequest, GroupAddress, Session};
//! use mcast_membership::memory::{InMemoryControlPlane, StaticInterfaceResolver};
//!
//! let resolver = Arc::new(StaticInterfaceResolver::new());
//! resolver.add_interface(2, "eth0", [Ipv4Addr::new(10, 0, 0, 1)]);
//! let plane = Arc::new(InMemoryControlPlane::new());
//!
//! let session = Session::new(plane.clone(), resolver.clone());
//! session.bind(BindRequest::by_index(2)).unwrap();
//!
//! let group = GroupAddress::from(Ipv4Addr::new(239, 1, 2, 3));
//! assert_eq!(session.join(group).unwrap(), 1);
//! assert_eq!(session.join(group).unwrap(), 2);
//! assert_eq!(plane.increments(), 1);
//!
//! session.close();
//! assert_eq!(plane.decrements(), 1);
//! ```

mod binding;
mod control_plane;
mod error;
pub mod memory;
mod registry;
mod session;
mod types;

pub use binding::{BindRequest, InterfaceBinding};
pub use control_plane::{Interface, InterfaceHandle, InterfaceResolver, MulticastControlPlane};
pub use error::{MembershipError, Result};
pub use registry::{DrainReport, GroupMembership, GroupRegistry, RegistrySnapshot};
pub use session::{CloseReport, Session, SessionId, SessionState};
pub use types::{ANY_INTERFACE, GroupAddress};
