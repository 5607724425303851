//! Session lifecycle: `Unbound -> Bound -> Closed`.
//!
//! A session is what one control-channel connection operates on. It owns at
//! most one interface binding and one group registry. Closing it releases
//! every membership it still holds, whatever the refcount, and then the
//! interface reference. A session dropped without an explicit close is closed
//! on drop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::binding::{BindRequest, InterfaceBinding};
use crate::control_plane::{InterfaceResolver, MulticastControlPlane};
use crate::error::{MembershipError, Result};
use crate::registry::{GroupMembership, GroupRegistry};
use crate::types::GroupAddress;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unbound => "unbound",
            SessionState::Bound => "bound",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
enum Lifecycle {
    Unbound,
    Bound(InterfaceBinding),
    Closed,
}

/// What a call to [`Session::close`] released.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Groups whose control-plane membership was dropped.
    pub released: Vec<GroupAddress>,
    /// Decrements that failed; the memberships were removed anyway.
    pub failures: Vec<MembershipError>,
    /// Interface whose reference was released, if the session was bound.
    pub if_index: Option<u32>,
    /// True if the session had already been closed and nothing was done.
    pub already_closed: bool,
}

/// One joiner's view of the multicast memberships on one interface.
pub struct Session {
    id: SessionId,
    plane: Arc<dyn MulticastControlPlane>,
    resolver: Arc<dyn InterfaceResolver>,
    /// Read-locked by join/leave, write-locked by bind/close.
    lifecycle: RwLock<Lifecycle>,
    memberships: GroupRegistry,
}

impl Session {
    /// Opens an unbound session with no limit on distinct groups.
    pub fn new(
        plane: Arc<dyn MulticastControlPlane>,
        resolver: Arc<dyn InterfaceResolver>,
    ) -> Self {
        Self::with_registry(plane, resolver, GroupRegistry::new())
    }

    /// Opens an unbound session that holds at most `max_groups` distinct groups.
    pub fn with_group_limit(
        plane: Arc<dyn MulticastControlPlane>,
        resolver: Arc<dyn InterfaceResolver>,
        max_groups: usize,
    ) -> Self {
        Self::with_registry(plane, resolver, GroupRegistry::with_limit(max_groups))
    }

    fn with_registry(
        plane: Arc<dyn MulticastControlPlane>,
        resolver: Arc<dyn InterfaceResolver>,
        memberships: GroupRegistry,
    ) -> Self {
        let id = SessionId::next();
        debug!(session = %id, "Opened session");
        Self {
            id,
            plane,
            resolver,
            lifecycle: RwLock::new(Lifecycle::Unbound),
            memberships,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match &*self.lifecycle.read() {
            Lifecycle::Unbound => SessionState::Unbound,
            Lifecycle::Bound(_) => SessionState::Bound,
            Lifecycle::Closed => SessionState::Closed,
        }
    }

    /// Index of the bound interface, if any.
    pub fn if_index(&self) -> Option<u32> {
        match &*self.lifecycle.read() {
            Lifecycle::Bound(binding) => Some(binding.if_index()),
            _ => None,
        }
    }

    pub fn memberships(&self) -> &GroupRegistry {
        &self.memberships
    }

    /// Looks up a membership without blocking on writers.
    pub fn find(&self, group: GroupAddress) -> Option<Arc<GroupMembership>> {
        self.memberships.find(group)
    }

    /// Attaches the session to an interface.
    ///
    /// Returns the bound interface index. A session binds once: a second bind
    /// fails with [`MembershipError::AlreadyBound`] and keeps the first
    /// binding.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn bind(&self, request: BindRequest) -> Result<u32> {
        let mut lifecycle = self.lifecycle.write();
        match &*lifecycle {
            Lifecycle::Closed => return Err(MembershipError::SessionClosed),
            Lifecycle::Bound(binding) => {
                warn!(if_index = binding.if_index(), "Rejecting rebind of bound session");
                return Err(MembershipError::AlreadyBound {
                    if_index: binding.if_index(),
                });
            }
            Lifecycle::Unbound => {}
        }

        let binding = InterfaceBinding::resolve(&*self.resolver, &request)?;
        let if_index = binding.if_index();
        info!(
            if_index,
            ifname = binding.handle().name(),
            "Bound session to interface"
        );
        *lifecycle = Lifecycle::Bound(binding);
        Ok(if_index)
    }

    /// Joins `group` once more, returning the session's refcount for it.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn join(&self, group: GroupAddress) -> Result<u32> {
        match &*self.lifecycle.read() {
            Lifecycle::Bound(binding) => {
                self.memberships.join(&*self.plane, binding.handle(), group)
            }
            Lifecycle::Unbound => Err(MembershipError::NotBound),
            Lifecycle::Closed => Err(MembershipError::SessionClosed),
        }
    }

    /// Leaves `group` once, returning the session's remaining refcount for it.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn leave(&self, group: GroupAddress) -> Result<u32> {
        match &*self.lifecycle.read() {
            Lifecycle::Bound(binding) => {
                self.memberships.leave(&*self.plane, binding.handle(), group)
            }
            Lifecycle::Unbound => Err(MembershipError::NotBound),
            Lifecycle::Closed => Err(MembershipError::SessionClosed),
        }
    }

    /// Releases every membership and the interface reference.
    ///
    /// Runs to completion even if some decrements fail. Closing an already
    /// closed session does nothing.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn close(&self) -> CloseReport {
        let mut lifecycle = self.lifecycle.write();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Closed => {
                debug!("Session already closed");
                CloseReport {
                    already_closed: true,
                    ..CloseReport::default()
                }
            }
            Lifecycle::Unbound => {
                debug!("Closed unbound session");
                CloseReport::default()
            }
            Lifecycle::Bound(binding) => {
                let drained = self.memberships.drain(&*self.plane, binding.handle());
                let if_index = binding.if_index();
                drop(binding);

                info!(
                    if_index,
                    released = drained.released.len(),
                    failed = drained.failures.len(),
                    "Closed session"
                );
                CloseReport {
                    released: drained.released,
                    failures: drained.failures,
                    if_index: Some(if_index),
                    already_closed: false,
                }
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("groups", &self.memberships.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !matches!(*self.lifecycle.get_mut(), Lifecycle::Closed) {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryControlPlane, StaticInterfaceResolver};
    use std::net::Ipv4Addr;

    fn setup() -> (Arc<InMemoryControlPlane>, Arc<StaticInterfaceResolver>) {
        let resolver = Arc::new(StaticInterfaceResolver::new());
        resolver.add_interface(2, "eth0", [Ipv4Addr::new(10, 0, 0, 1)]);
        (Arc::new(InMemoryControlPlane::new()), resolver)
    }

    fn g(last: u8) -> GroupAddress {
        GroupAddress::from(Ipv4Addr::new(239, 0, 0, last))
    }

    #[test]
    fn test_new_session_is_unbound() {
        let (plane, resolver) = setup();
        let session = Session::new(plane, resolver);
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(session.if_index(), None);
        assert!(session.memberships().is_empty());
    }

    #[test]
    fn test_join_before_bind() {
        let (plane, resolver) = setup();
        let session = Session::new(plane.clone(), resolver);
        assert_eq!(session.join(g(1)), Err(MembershipError::NotBound));
        assert_eq!(session.leave(g(1)), Err(MembershipError::NotBound));
        assert_eq!(plane.increment_calls(), 0);
    }

    #[test]
    fn test_bind_transitions_to_bound() {
        let (plane, resolver) = setup();
        let session = Session::new(plane, resolver);
        assert_eq!(session.bind(BindRequest::by_index(2)).unwrap(), 2);
        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(session.if_index(), Some(2));
    }

    #[test]
    fn test_failed_bind_stays_unbound() {
        let (plane, resolver) = setup();
        let session = Session::new(plane, resolver);
        let err = session.bind(BindRequest::by_index(77)).unwrap_err();
        assert!(matches!(err, MembershipError::AddressNotAvailable { .. }));
        assert_eq!(session.state(), SessionState::Unbound);
    }

    #[test]
    fn test_rebind_rejected_without_leaking() {
        let (plane, resolver) = setup();
        resolver.add_interface(3, "eth1", []);
        let session = Session::new(plane, resolver.clone());

        session.bind(BindRequest::by_index(2)).unwrap();
        let err = session.bind(BindRequest::by_index(3)).unwrap_err();
        assert_eq!(err, MembershipError::AlreadyBound { if_index: 2 });
        assert_eq!(session.if_index(), Some(2));
        assert_eq!(resolver.outstanding_references(2), 1);
        assert_eq!(resolver.outstanding_references(3), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (plane, resolver) = setup();
        let session = Session::new(plane.clone(), resolver.clone());
        session.bind(BindRequest::by_index(2)).unwrap();
        session.join(g(1)).unwrap();

        let first = session.close();
        assert_eq!(first.released, vec![g(1)]);
        assert_eq!(first.if_index, Some(2));
        assert!(!first.already_closed);
        assert_eq!(resolver.outstanding_references(2), 0);

        let second = session.close();
        assert!(second.already_closed);
        assert!(second.released.is_empty());
        assert_eq!(plane.decrement_calls(), 1);
    }

    #[test]
    fn test_operations_after_close() {
        let (plane, resolver) = setup();
        let session = Session::new(plane, resolver);
        session.bind(BindRequest::by_index(2)).unwrap();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.join(g(1)), Err(MembershipError::SessionClosed));
        assert_eq!(session.leave(g(1)), Err(MembershipError::SessionClosed));
        assert_eq!(
            session.bind(BindRequest::by_index(2)),
            Err(MembershipError::SessionClosed)
        );
    }

    #[test]
    fn test_close_unbound_session() {
        let (plane, resolver) = setup();
        let session = Session::new(plane.clone(), resolver);
        let report = session.close();
        assert_eq!(report.if_index, None);
        assert!(report.released.is_empty());
        assert_eq!(plane.decrement_calls(), 0);
    }

    #[test]
    fn test_drop_closes_session() {
        let (plane, resolver) = setup();
        {
            let session = Session::new(plane.clone(), resolver.clone());
            session.bind(BindRequest::by_index(2)).unwrap();
            session.join(g(1)).unwrap();
            session.join(g(1)).unwrap();
            session.join(g(2)).unwrap();
        }
        assert_eq!(plane.decrements(), 2);
        assert!(!plane.is_member(2, g(1)));
        assert!(!plane.is_member(2, g(2)));
        assert_eq!(resolver.outstanding_references(2), 0);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let (plane, resolver) = setup();
        let a = Session::new(plane.clone(), resolver.clone());
        let b = Session::new(plane, resolver);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("session-"));
    }

    #[test]
    fn test_group_limit_applies() {
        let (plane, resolver) = setup();
        let session = Session::with_group_limit(plane, resolver, 1);
        session.bind(BindRequest::by_index(2)).unwrap();
        session.join(g(1)).unwrap();
        assert_eq!(
            session.join(g(2)),
            Err(MembershipError::OutOfMemory { group: g(2) })
        );
    }
}
