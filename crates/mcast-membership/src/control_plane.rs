//! Seams to the network stack.
//!
//! The engine never touches an interface directly. It asks an
//! [`InterfaceResolver`] for a handle when a session binds, and asks a
//! [`MulticastControlPlane`] to add or drop a group on that handle when a
//! session's refcount for the group crosses zero.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::Result;
use crate::types::GroupAddress;

/// A network interface as seen by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name (e.g. "eth0").
    pub name: String,
}

impl Interface {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

/// Owning reference to a resolved interface.
///
/// A resolver hands one out per successful bind and the session keeps it until
/// close. Dropping the handle releases the reference.
#[derive(Debug)]
pub struct InterfaceHandle {
    interface: Arc<Interface>,
}

impl InterfaceHandle {
    pub fn new(interface: Arc<Interface>) -> Self {
        Self { interface }
    }

    pub fn index(&self) -> u32 {
        self.interface.index
    }

    pub fn name(&self) -> &str {
        &self.interface.name
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }
}

/// Resolves bind requests to interface handles.
pub trait InterfaceResolver: Send + Sync {
    /// Returns the interface with the given index, if it exists.
    fn by_index(&self, if_index: u32) -> Option<InterfaceHandle>;

    /// Returns the interface that owns the given local IPv4 address, if any.
    fn by_address(&self, addr: Ipv4Addr) -> Option<InterfaceHandle>;
}

/// The only component allowed to change an interface's effective multicast
/// membership.
///
/// Implementations serialize concurrent calls against the same interface
/// themselves; the registry only serializes calls made by one session.
pub trait MulticastControlPlane: Send + Sync {
    /// Adds one user of `group` on `interface`.
    fn increment(&self, interface: &InterfaceHandle, group: GroupAddress) -> Result<()>;

    /// Removes one user of `group` on `interface`.
    fn decrement(&self, interface: &InterfaceHandle, group: GroupAddress) -> Result<()>;
}

impl<T: InterfaceResolver + ?Sized> InterfaceResolver for Arc<T> {
    fn by_index(&self, if_index: u32) -> Option<InterfaceHandle> {
        (**self).by_index(if_index)
    }

    fn by_address(&self, addr: Ipv4Addr) -> Option<InterfaceHandle> {
        (**self).by_address(addr)
    }
}

impl<T: MulticastControlPlane + ?Sized> MulticastControlPlane for Arc<T> {
    fn increment(&self, interface: &InterfaceHandle, group: GroupAddress) -> Result<()> {
        (**self).increment(interface, group)
    }

    fn decrement(&self, interface: &InterfaceHandle, group: GroupAddress) -> Result<()> {
        (**self).decrement(interface, group)
    }
}
