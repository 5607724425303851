//! Interface binding resolution.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::debug;

use crate::control_plane::{InterfaceHandle, InterfaceResolver};
use crate::error::{MembershipError, Result};
use crate::types::ANY_INTERFACE;

/// Which interface a session should attach to.
///
/// When `if_index` is [`ANY_INTERFACE`] the interface owning `ifaddr` is used
/// and the index is ignored; otherwise `ifaddr` is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    /// Local interface address, used only with [`ANY_INTERFACE`].
    pub ifaddr: Ipv4Addr,
    /// Interface index, or [`ANY_INTERFACE`].
    pub if_index: u32,
}

impl BindRequest {
    /// Bind to the interface with the given index.
    pub fn by_index(if_index: u32) -> Self {
        Self {
            ifaddr: Ipv4Addr::UNSPECIFIED,
            if_index,
        }
    }

    /// Bind to the interface that owns `ifaddr`.
    pub fn by_address(ifaddr: Ipv4Addr) -> Self {
        Self {
            ifaddr,
            if_index: ANY_INTERFACE,
        }
    }

    pub fn resolves_by_address(&self) -> bool {
        self.if_index == ANY_INTERFACE
    }
}

/// The interface a session is attached to.
///
/// Holds the resolver's handle for as long as the binding lives.
#[derive(Debug)]
pub struct InterfaceBinding {
    if_index: u32,
    handle: InterfaceHandle,
}

impl InterfaceBinding {
    /// Resolves `request` through exactly one path: by address when the index
    /// is the sentinel, by index otherwise.
    pub fn resolve(resolver: &dyn InterfaceResolver, request: &BindRequest) -> Result<Self> {
        let handle = if request.resolves_by_address() {
            resolver.by_address(request.ifaddr).ok_or_else(|| {
                MembershipError::address_not_available(format!("local address {}", request.ifaddr))
            })?
        } else {
            resolver.by_index(request.if_index).ok_or_else(|| {
                MembershipError::address_not_available(format!("ifindex {}", request.if_index))
            })?
        };

        debug!(
            if_index = handle.index(),
            ifname = handle.name(),
            by_address = request.resolves_by_address(),
            "Resolved interface"
        );

        Ok(Self {
            if_index: handle.index(),
            handle,
        })
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn handle(&self) -> &InterfaceHandle {
        &self.handle
    }
}
