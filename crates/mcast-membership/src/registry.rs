//! Refcounted group registry with lock-free lookups.
//!
//! The registry publishes an immutable snapshot of its entries through an
//! [`ArcSwap`]. Readers load the current snapshot without taking any lock and
//! can never see a half-built entry or a torn map. Writers hold one coarse
//! lock around "build the next snapshot, call the control plane, publish".
//!
//! Entries are `Arc`s shared between snapshots. Removing an entry only
//! unpublishes it; its storage is freed once the last snapshot or
//! [`find`](GroupRegistry::find) handle that still references it is dropped.
//! A reader that loaded the entry before it was removed keeps a valid
//! reference; a reader that starts afterwards does not find it.
//!
//! The control plane is called only on the 0 -> 1 and 1 -> 0 transitions,
//! plus once per entry when the registry is drained.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::control_plane::{InterfaceHandle, MulticastControlPlane};
use crate::error::{MembershipError, Result};
use crate::types::GroupAddress;

type Entries = HashMap<GroupAddress, Arc<GroupMembership>>;

/// One group joined by a session, with the number of outstanding joins.
#[derive(Debug)]
pub struct GroupMembership {
    group: GroupAddress,
    refcount: AtomicU32,
}

impl GroupMembership {
    fn new(group: GroupAddress) -> Self {
        Self {
            group,
            refcount: AtomicU32::new(1),
        }
    }

    pub fn group(&self) -> GroupAddress {
        self.group
    }

    /// Returns the number of outstanding joins.
    ///
    /// Reads 0 only once the entry has been removed from the registry.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

/// Outcome of [`GroupRegistry::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Groups whose control-plane membership was dropped.
    pub released: Vec<GroupAddress>,
    /// Decrements the control plane refused. The entries are gone regardless.
    pub failures: Vec<MembershipError>,
}

impl DrainReport {
    /// Number of entries the drain removed.
    pub fn removed(&self) -> usize {
        self.released.len() + self.failures.len()
    }

    /// Returns true if every decrement succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pinned, immutable view of the registry at one instant.
///
/// Holding a snapshot keeps every entry it references alive, even after a
/// writer has removed them.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    entries: Arc<Entries>,
}

impl RegistrySnapshot {
    pub fn get(&self, group: &GroupAddress) -> Option<&Arc<GroupMembership>> {
        self.entries.get(group)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<GroupMembership>> {
        self.entries.values()
    }
}

/// The set of memberships held by one session.
#[derive(Debug)]
pub struct GroupRegistry {
    entries: ArcSwap<Entries>,
    /// Serializes writers against each other and against their control-plane call.
    write_lock: Mutex<()>,
    max_groups: usize,
}

impl GroupRegistry {
    /// Creates an empty registry with no limit on distinct groups.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Creates an empty registry that refuses to hold more than `max_groups`
    /// distinct groups.
    pub fn with_limit(max_groups: usize) -> Self {
        Self {
            entries: ArcSwap::from_pointee(Entries::new()),
            write_lock: Mutex::new(()),
            max_groups,
        }
    }

    /// Looks up the membership for `group` without blocking.
    pub fn find(&self, group: GroupAddress) -> Option<Arc<GroupMembership>> {
        self.entries.load().get(&group).cloned()
    }

    /// Returns the refcount for `group`, or `None` if it is not joined.
    pub fn refcount(&self, group: GroupAddress) -> Option<u32> {
        self.entries.load().get(&group).map(|m| m.refcount())
    }

    /// Pins the current view of the registry.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: self.entries.load_full(),
        }
    }

    /// Returns every joined group with its refcount.
    pub fn groups(&self) -> Vec<(GroupAddress, u32)> {
        self.entries
            .load()
            .values()
            .map(|m| (m.group, m.refcount()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Adds one join of `group`.
    ///
    /// Returns the new refcount. The control plane is asked to increment only
    /// when the group was not yet joined; if it refuses, nothing is inserted.
    pub fn join(
        &self,
        plane: &dyn MulticastControlPlane,
        interface: &InterfaceHandle,
        group: GroupAddress,
    ) -> Result<u32> {
        let _writer = self.write_lock.lock();
        let current = self.entries.load_full();

        if let Some(existing) = current.get(&group) {
            let count = existing
                .refcount()
                .checked_add(1)
                .ok_or(MembershipError::OutOfMemory { group })?;
            existing.refcount.store(count, Ordering::Release);
            debug!(%group, refcount = count, "Incremented group refcount");
            return Ok(count);
        }

        if current.len() >= self.max_groups {
            debug!(%group, limit = self.max_groups, "Group limit reached");
            return Err(MembershipError::OutOfMemory { group });
        }

        let mut next = Entries::new();
        next.try_reserve(current.len() + 1)
            .map_err(|_| MembershipError::OutOfMemory { group })?;
        next.extend(current.iter().map(|(g, m)| (*g, Arc::clone(m))));
        next.insert(group, Arc::new(GroupMembership::new(group)));

        plane.increment(interface, group)?;
        self.entries.store(Arc::new(next));

        debug!(%group, if_index = interface.index(), "Joined new group");
        Ok(1)
    }

    /// Removes one join of `group`.
    ///
    /// Returns the new refcount. When it reaches zero the entry is removed
    /// and the control plane is asked to decrement. If that call fails the
    /// entry stays joined at refcount 1 so that close can still release it.
    pub fn leave(
        &self,
        plane: &dyn MulticastControlPlane,
        interface: &InterfaceHandle,
        group: GroupAddress,
    ) -> Result<u32> {
        let _writer = self.write_lock.lock();
        let current = self.entries.load_full();

        let Some(entry) = current.get(&group) else {
            debug!(%group, "Group not joined");
            return Err(MembershipError::NotMember { group });
        };

        let count = entry.refcount();
        if count > 1 {
            entry.refcount.store(count - 1, Ordering::Release);
            debug!(%group, refcount = count - 1, "Decremented group refcount");
            return Ok(count - 1);
        }

        plane.decrement(interface, group)?;

        let mut next = (*current).clone();
        next.remove(&group);
        self.entries.store(Arc::new(next));
        entry.refcount.store(0, Ordering::Release);

        debug!(%group, if_index = interface.index(), "Left group");
        Ok(0)
    }

    /// Removes every entry, asking the control plane to decrement each one
    /// exactly once whatever its refcount.
    ///
    /// A failing decrement is logged and recorded; the drain always runs to
    /// the end. Draining an empty registry does nothing.
    pub fn drain(
        &self,
        plane: &dyn MulticastControlPlane,
        interface: &InterfaceHandle,
    ) -> DrainReport {
        let _writer = self.write_lock.lock();
        let previous = self.entries.swap(Arc::new(Entries::new()));

        let mut report = DrainReport::default();
        for (group, entry) in previous.iter() {
            debug!(%group, refcount = entry.refcount(), "Releasing membership at close");
            match plane.decrement(interface, *group) {
                Ok(()) => report.released.push(*group),
                Err(e) => {
                    warn!(%group, error = %e, "Failed to release membership, continuing");
                    report.failures.push(e);
                }
            }
            entry.refcount.store(0, Ordering::Release);
        }

        report
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::Interface;
    use crate::memory::InMemoryControlPlane;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn iface() -> InterfaceHandle {
        InterfaceHandle::new(Arc::new(Interface::new(2, "eth0")))
    }

    fn g(last: u8) -> GroupAddress {
        GroupAddress::from(Ipv4Addr::new(239, 0, 0, last))
    }

    #[test]
    fn test_find_never_creates() {
        let registry = GroupRegistry::new();
        assert!(registry.find(g(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_first_join_increments_once() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        assert_eq!(registry.join(&plane, &iface, g(1)).unwrap(), 1);
        assert_eq!(registry.join(&plane, &iface, g(1)).unwrap(), 2);
        assert_eq!(registry.join(&plane, &iface, g(1)).unwrap(), 3);

        assert_eq!(plane.increments(), 1);
        assert_eq!(registry.refcount(g(1)), Some(3));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_leave_unknown_group() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();

        let err = registry.leave(&plane, &iface(), g(9)).unwrap_err();
        assert_eq!(err, MembershipError::NotMember { group: g(9) });
        assert_eq!(plane.decrements(), 0);
    }

    #[test]
    fn test_last_leave_removes_and_decrements() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        registry.join(&plane, &iface, g(1)).unwrap();
        registry.join(&plane, &iface, g(1)).unwrap();

        assert_eq!(registry.leave(&plane, &iface, g(1)).unwrap(), 1);
        assert_eq!(plane.decrements(), 0);
        assert!(registry.find(g(1)).is_some());

        assert_eq!(registry.leave(&plane, &iface, g(1)).unwrap(), 0);
        assert_eq!(plane.decrements(), 1);
        assert!(registry.find(g(1)).is_none());
    }

    #[test]
    fn test_removed_entry_stays_valid_for_existing_holder() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        registry.join(&plane, &iface, g(1)).unwrap();
        let held = registry.find(g(1)).unwrap();
        let pinned = registry.snapshot();

        registry.leave(&plane, &iface, g(1)).unwrap();

        // A reader starting now does not see it.
        assert!(registry.find(g(1)).is_none());
        // Readers that started before still do, and the storage is alive.
        assert_eq!(held.group(), g(1));
        assert_eq!(held.refcount(), 0);
        assert!(pinned.get(&g(1)).is_some());

        let weak = Arc::downgrade(&held);
        drop(held);
        assert!(weak.upgrade().is_some());
        drop(pinned);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_failed_increment_inserts_nothing() {
        let plane = InMemoryControlPlane::new();
        plane.fail_increments(true);
        let registry = GroupRegistry::new();

        let err = registry.join(&plane, &iface(), g(1)).unwrap_err();
        assert!(matches!(err, MembershipError::ControlPlaneFailure { operation: "increment", .. }));
        assert!(registry.find(g(1)).is_none());

        plane.fail_increments(false);
        assert_eq!(registry.join(&plane, &iface(), g(1)).unwrap(), 1);
    }

    #[test]
    fn test_failed_last_decrement_keeps_entry() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        registry.join(&plane, &iface, g(1)).unwrap();
        plane.fail_decrements(true);

        assert!(registry.leave(&plane, &iface, g(1)).is_err());
        assert_eq!(registry.refcount(g(1)), Some(1));

        plane.fail_decrements(false);
        assert_eq!(registry.leave(&plane, &iface, g(1)).unwrap(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_group_limit() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::with_limit(2);
        let iface = iface();

        registry.join(&plane, &iface, g(1)).unwrap();
        registry.join(&plane, &iface, g(2)).unwrap();
        let err = registry.join(&plane, &iface, g(3)).unwrap_err();
        assert_eq!(err, MembershipError::OutOfMemory { group: g(3) });
        assert!(registry.find(g(3)).is_none());
        assert_eq!(plane.increments(), 2);

        // Joining an existing group is not limited.
        assert_eq!(registry.join(&plane, &iface, g(2)).unwrap(), 2);
    }

    #[test]
    fn test_drain_releases_each_entry_once() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        for _ in 0..3 {
            registry.join(&plane, &iface, g(1)).unwrap();
        }
        registry.join(&plane, &iface, g(2)).unwrap();

        let report = registry.drain(&plane, &iface);
        assert!(report.is_clean());
        assert_eq!(report.removed(), 2);
        assert_eq!(plane.decrements(), 2);
        assert!(registry.is_empty());

        let again = registry.drain(&plane, &iface);
        assert_eq!(again.removed(), 0);
        assert_eq!(plane.decrements(), 2);
    }

    #[test]
    fn test_drain_continues_past_failures() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        registry.join(&plane, &iface, g(1)).unwrap();
        registry.join(&plane, &iface, g(2)).unwrap();
        registry.join(&plane, &iface, g(3)).unwrap();
        plane.fail_decrements(true);

        let report = registry.drain(&plane, &iface);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.removed(), 3);
        assert!(registry.is_empty());
        assert_eq!(plane.decrement_calls(), 3);
    }

    #[test]
    fn test_groups_listing() {
        let plane = InMemoryControlPlane::new();
        let registry = GroupRegistry::new();
        let iface = iface();

        registry.join(&plane, &iface, g(1)).unwrap();
        registry.join(&plane, &iface, g(2)).unwrap();
        registry.join(&plane, &iface, g(2)).unwrap();

        let mut groups = registry.groups();
        groups.sort_by_key(|(group, _)| group.octets());
        assert_eq!(groups, vec![(g(1), 1), (g(2), 2)]);
    }
}
