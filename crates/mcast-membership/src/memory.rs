//! In-process control plane and interface resolver.
//!
//! These stand in for the kernel on platforms without one and in tests. The
//! control plane keeps per-interface group user counts the way the IP stack
//! does, behind one lock per interface, and counts every call it receives.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::control_plane::{Interface, InterfaceHandle, InterfaceResolver, MulticastControlPlane};
use crate::error::{MembershipError, Result};
use crate::types::GroupAddress;

/// Per-interface group user counts.
type GroupUsers = HashMap<GroupAddress, u32>;

/// Control plane that records memberships in memory.
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    interfaces: DashMap<u32, Arc<Mutex<GroupUsers>>>,
    increments: AtomicUsize,
    decrements: AtomicUsize,
    increment_calls: AtomicUsize,
    decrement_calls: AtomicUsize,
    fail_increments: AtomicBool,
    fail_decrements: AtomicBool,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following increment fail (or succeed again).
    pub fn fail_increments(&self, fail: bool) {
        self.fail_increments.store(fail, Ordering::SeqCst);
    }

    /// Makes every following decrement fail (or succeed again).
    pub fn fail_decrements(&self, fail: bool) {
        self.fail_decrements.store(fail, Ordering::SeqCst);
    }

    /// Number of successful increments.
    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    /// Number of successful decrements.
    pub fn decrements(&self) -> usize {
        self.decrements.load(Ordering::SeqCst)
    }

    /// Number of increment calls, including failed ones.
    pub fn increment_calls(&self) -> usize {
        self.increment_calls.load(Ordering::SeqCst)
    }

    /// Number of decrement calls, including failed ones.
    pub fn decrement_calls(&self) -> usize {
        self.decrement_calls.load(Ordering::SeqCst)
    }

    /// Current number of users of `group` on interface `if_index`.
    pub fn users(&self, if_index: u32, group: GroupAddress) -> u32 {
        self.interfaces
            .get(&if_index)
            .and_then(|users| users.lock().get(&group).copied())
            .unwrap_or(0)
    }

    /// Returns true if interface `if_index` currently has `group` joined.
    pub fn is_member(&self, if_index: u32, group: GroupAddress) -> bool {
        self.users(if_index, group) > 0
    }

    fn interface(&self, if_index: u32) -> Arc<Mutex<GroupUsers>> {
        Arc::clone(&self.interfaces.entry(if_index).or_default())
    }
}

impl MulticastControlPlane for InMemoryControlPlane {
    fn increment(&self, interface: &InterfaceHandle, group: GroupAddress) -> Result<()> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(MembershipError::control_plane(
                "increment",
                group,
                interface.index(),
                "injected failure",
            ));
        }

        let users = self.interface(interface.index());
        let mut users = users.lock();
        let count = users.entry(group).or_insert(0);
        *count += 1;
        trace!(%group, if_index = interface.index(), users = *count, "Added group user");

        self.increments.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn decrement(&self, interface: &InterfaceHandle, group: GroupAddress) -> Result<()> {
        self.decrement_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_decrements.load(Ordering::SeqCst) {
            return Err(MembershipError::control_plane(
                "decrement",
                group,
                interface.index(),
                "injected failure",
            ));
        }

        let users = self.interface(interface.index());
        let mut users = users.lock();
        let Some(count) = users.get_mut(&group) else {
            return Err(MembershipError::control_plane(
                "decrement",
                group,
                interface.index(),
                "group has no users",
            ));
        };
        *count -= 1;
        trace!(%group, if_index = interface.index(), users = *count, "Removed group user");
        if *count == 0 {
            users.remove(&group);
        }

        self.decrements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct StaticEntry {
    interface: Arc<Interface>,
    addresses: Vec<Ipv4Addr>,
}

/// Resolver over a fixed table of interfaces.
///
/// Every handle it gives out shares the table's `Arc<Interface>`, so the
/// number of outstanding references can be observed.
#[derive(Debug, Default)]
pub struct StaticInterfaceResolver {
    entries: RwLock<HashMap<u32, StaticEntry>>,
}

impl StaticInterfaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an interface with its local IPv4 addresses.
    pub fn add_interface(
        &self,
        index: u32,
        name: impl Into<String>,
        addresses: impl IntoIterator<Item = Ipv4Addr>,
    ) {
        let entry = StaticEntry {
            interface: Arc::new(Interface::new(index, name)),
            addresses: addresses.into_iter().collect(),
        };
        self.entries.write().insert(index, entry);
    }

    /// Removes an interface. Handles already given out stay valid.
    pub fn remove_interface(&self, index: u32) -> bool {
        self.entries.write().remove(&index).is_some()
    }

    /// Number of handles to interface `index` that are still held.
    pub fn outstanding_references(&self, index: u32) -> usize {
        self.entries
            .read()
            .get(&index)
            .map(|entry| Arc::strong_count(&entry.interface) - 1)
            .unwrap_or(0)
    }
}

impl InterfaceResolver for StaticInterfaceResolver {
    fn by_index(&self, if_index: u32) -> Option<InterfaceHandle> {
        self.entries
            .read()
            .get(&if_index)
            .map(|entry| InterfaceHandle::new(Arc::clone(&entry.interface)))
    }

    fn by_address(&self, addr: Ipv4Addr) -> Option<InterfaceHandle> {
        self.entries
            .read()
            .values()
            .find(|entry| entry.addresses.contains(&addr))
            .map(|entry| InterfaceHandle::new(Arc::clone(&entry.interface)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(last: u8) -> GroupAddress {
        GroupAddress::from(Ipv4Addr::new(239, 0, 0, last))
    }

    #[test]
    fn test_users_aggregate_across_callers() {
        let plane = InMemoryControlPlane::new();
        let eth0 = InterfaceHandle::new(Arc::new(Interface::new(2, "eth0")));
        let eth1 = InterfaceHandle::new(Arc::new(Interface::new(3, "eth1")));

        plane.increment(&eth0, g(1)).unwrap();
        plane.increment(&eth0, g(1)).unwrap();
        plane.increment(&eth1, g(1)).unwrap();

        assert_eq!(plane.users(2, g(1)), 2);
        assert_eq!(plane.users(3, g(1)), 1);

        plane.decrement(&eth0, g(1)).unwrap();
        assert!(plane.is_member(2, g(1)));
        plane.decrement(&eth0, g(1)).unwrap();
        assert!(!plane.is_member(2, g(1)));
        assert_eq!(plane.decrements(), 2);
    }

    #[test]
    fn test_decrement_without_users_fails() {
        let plane = InMemoryControlPlane::new();
        let eth0 = InterfaceHandle::new(Arc::new(Interface::new(2, "eth0")));
        assert!(plane.decrement(&eth0, g(1)).is_err());
        assert_eq!(plane.decrement_calls(), 1);
        assert_eq!(plane.decrements(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let plane = InMemoryControlPlane::new();
        let eth0 = InterfaceHandle::new(Arc::new(Interface::new(2, "eth0")));

        plane.fail_increments(true);
        assert!(plane.increment(&eth0, g(1)).is_err());
        assert_eq!(plane.increment_calls(), 1);
        assert_eq!(plane.increments(), 0);
        assert!(!plane.is_member(2, g(1)));
    }

    #[test]
    fn test_resolver_by_index_and_address() {
        let resolver = StaticInterfaceResolver::new();
        resolver.add_interface(2, "eth0", [Ipv4Addr::new(10, 0, 0, 1)]);
        resolver.add_interface(3, "eth1", [Ipv4Addr::new(10, 0, 1, 1), Ipv4Addr::new(10, 0, 1, 2)]);

        assert_eq!(resolver.by_index(2).unwrap().name(), "eth0");
        assert!(resolver.by_index(9).is_none());
        assert_eq!(resolver.by_address(Ipv4Addr::new(10, 0, 1, 2)).unwrap().index(), 3);
        assert!(resolver.by_address(Ipv4Addr::new(192, 168, 0, 1)).is_none());
    }

    #[test]
    fn test_resolver_tracks_references() {
        let resolver = StaticInterfaceResolver::new();
        resolver.add_interface(2, "eth0", []);

        let first = resolver.by_index(2).unwrap();
        let second = resolver.by_index(2).unwrap();
        assert_eq!(resolver.outstanding_references(2), 2);

        drop(first);
        drop(second);
        assert_eq!(resolver.outstanding_references(2), 0);
    }
}
