//! Kernel-backed interface resolution and multicast membership.
//!
//! Group memberships are held by a pool of UDP sockets per interface; the
//! kernel keeps a group joined for as long as its socket carries the membership.

use dashmap::DashMap;
use mcast_membership::{
    GroupAddress, Interface, InterfaceHandle, InterfaceResolver, MembershipError,
    MulticastControlPlane,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Resolves interfaces through the kernel's interface tables
#[derive(Debug, Default)]
pub struct KernelInterfaceResolver;

impl KernelInterfaceResolver {
    pub fn new() -> Self {
        Self
    }

    fn name_of(index: u32) -> Option<String> {
        match nix::net::if_::if_indextoname(index) {
            Ok(name) => Some(name.to_string_lossy().into_owned()),
            Err(e) => {
                debug!(if_index = index, error = %e, "if_indextoname failed");
                None
            }
        }
    }
}

impl InterfaceResolver for KernelInterfaceResolver {
    fn by_index(&self, index: u32) -> Option<InterfaceHandle> {
        let name = Self::name_of(index)?;
        Some(InterfaceHandle::new(Arc::new(Interface::new(index, name))))
    }

    fn by_address(&self, addr: Ipv4Addr) -> Option<InterfaceHandle> {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(error = %e, "getifaddrs failed");
                return None;
            }
        };

        for ifaddr in addrs {
            let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                continue;
            };
            if Ipv4Addr::from(sin.ip()) != addr {
                continue;
            }

            let index = match nix::net::if_::if_nametoindex(ifaddr.interface_name.as_str()) {
                Ok(index) => index,
                Err(e) => {
                    debug!(interface = %ifaddr.interface_name, error = %e, "if_nametoindex failed");
                    return None;
                }
            };
            return Some(InterfaceHandle::new(Arc::new(Interface::new(
                index,
                ifaddr.interface_name,
            ))));
        }

        None
    }
}

/// One socket carrying kernel memberships, and how many it holds
struct MembershipSocket {
    socket: UdpSocket,
    members: usize,
}

impl MembershipSocket {
    fn open() -> io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?,
            members: 0,
        })
    }

    fn set_membership(
        &self,
        option: libc::c_int,
        group: GroupAddress,
        if_index: u32,
    ) -> io::Result<()> {
        let ifindex = libc::c_int::try_from(if_index)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mreq = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(group.octets()),
            },
            imr_address: libc::in_addr {
                s_addr: libc::INADDR_ANY,
            },
            imr_ifindex: ifindex,
        };

        // SAFETY: mreq is a valid ip_mreqn living for the duration of the call
        // and the length matches its size.
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                option,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Which socket holds a group, and how many sessions use it
#[derive(Debug, Clone, Copy)]
struct GroupSlot {
    socket: usize,
    users: u32,
}

/// Membership sockets and group user counts for one interface
///
/// The kernel caps memberships per socket (`net.ipv4.igmp_max_memberships`),
/// so a join that hits the cap moves on to the next socket, opening one
/// when every socket is full.
#[derive(Default)]
struct InterfaceMemberships {
    sockets: Vec<MembershipSocket>,
    groups: HashMap<GroupAddress, GroupSlot>,
}

impl InterfaceMemberships {
    fn add(&mut self, group: GroupAddress, if_index: u32) -> io::Result<usize> {
        for (index, socket) in self.sockets.iter_mut().enumerate() {
            match socket.set_membership(libc::IP_ADD_MEMBERSHIP, group, if_index) {
                Ok(()) => {
                    socket.members += 1;
                    return Ok(index);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => continue,
                Err(e) => return Err(e),
            }
        }

        let mut socket = MembershipSocket::open()?;
        socket.set_membership(libc::IP_ADD_MEMBERSHIP, group, if_index)?;
        socket.members = 1;
        self.sockets.push(socket);
        debug!(if_index, sockets = self.sockets.len(), "Opened membership socket");
        Ok(self.sockets.len() - 1)
    }

    fn drop_membership(
        &mut self,
        slot: GroupSlot,
        group: GroupAddress,
        if_index: u32,
    ) -> io::Result<()> {
        let socket = self
            .sockets
            .get_mut(slot.socket)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        socket.set_membership(libc::IP_DROP_MEMBERSHIP, group, if_index)?;
        socket.members = socket.members.saturating_sub(1);
        Ok(())
    }
}

/// Joins and leaves groups in the kernel IP stack
///
/// Sessions sharing an interface share its memberships; the group is dropped
/// from the kernel only when the last session releases it.
#[derive(Default)]
pub struct SocketControlPlane {
    interfaces: DashMap<u32, Arc<Mutex<InterfaceMemberships>>>,
}

impl SocketControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn interface(&self, if_index: u32) -> Arc<Mutex<InterfaceMemberships>> {
        Arc::clone(self.interfaces.entry(if_index).or_default().value())
    }

    /// Number of sessions currently holding `group` on `if_index`
    pub fn users(&self, if_index: u32, group: GroupAddress) -> u32 {
        self.interfaces
            .get(&if_index)
            .and_then(|m| m.lock().groups.get(&group).map(|slot| slot.users))
            .unwrap_or(0)
    }

    /// Number of membership sockets opened for `if_index`
    pub fn socket_count(&self, if_index: u32) -> usize {
        self.interfaces
            .get(&if_index)
            .map(|m| m.lock().sockets.len())
            .unwrap_or(0)
    }
}

impl MulticastControlPlane for SocketControlPlane {
    #[instrument(skip(self, interface), fields(if_index = interface.index()))]
    fn increment(
        &self,
        interface: &InterfaceHandle,
        group: GroupAddress,
    ) -> mcast_membership::Result<()> {
        let if_index = interface.index();
        let memberships = self.interface(if_index);
        let mut memberships = memberships.lock();

        if let Some(slot) = memberships.groups.get_mut(&group) {
            slot.users += 1;
            debug!(%group, users = slot.users, "Group already joined");
            return Ok(());
        }

        let socket = memberships
            .add(group, if_index)
            .map_err(|e| MembershipError::control_plane_os("increment", group, if_index, &e))?;
        memberships.groups.insert(group, GroupSlot { socket, users: 1 });
        info!(%group, interface = interface.name(), socket, "Joined multicast group");
        Ok(())
    }

    #[instrument(skip(self, interface), fields(if_index = interface.index()))]
    fn decrement(
        &self,
        interface: &InterfaceHandle,
        group: GroupAddress,
    ) -> mcast_membership::Result<()> {
        let if_index = interface.index();
        let Some(memberships) = self.interfaces.get(&if_index).map(|m| Arc::clone(m.value()))
        else {
            return Err(MembershipError::control_plane(
                "decrement",
                group,
                if_index,
                "no memberships on interface",
            ));
        };
        let mut memberships = memberships.lock();

        let Some(slot) = memberships.groups.get(&group).copied() else {
            return Err(MembershipError::control_plane(
                "decrement",
                group,
                if_index,
                "group has no users",
            ));
        };

        if slot.users > 1 {
            let users = slot.users - 1;
            memberships.groups.insert(group, GroupSlot { users, ..slot });
            debug!(%group, users, "Group still in use");
            return Ok(());
        }

        memberships
            .drop_membership(slot, group, if_index)
            .map_err(|e| MembershipError::control_plane_os("decrement", group, if_index, &e))?;
        memberships.groups.remove(&group);
        info!(%group, interface = interface.name(), "Left multicast group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcast_membership::{BindRequest, Session};

    #[test]
    fn test_loopback_resolves_by_index_and_address() {
        let resolver = KernelInterfaceResolver::new();
        let Ok(lo) = nix::net::if_::if_nametoindex("lo") else {
            return;
        };

        let handle = resolver.by_index(lo).unwrap();
        assert_eq!(handle.name(), "lo");

        if let Some(handle) = resolver.by_address(Ipv4Addr::LOCALHOST) {
            assert_eq!(handle.index(), lo);
        }
    }

    #[test]
    fn test_unknown_index_does_not_resolve() {
        let resolver = KernelInterfaceResolver::new();
        assert!(resolver.by_index(0).is_none());
        assert!(resolver.by_address(Ipv4Addr::new(192, 0, 2, 254)).is_none());
    }

    fn loopback() -> Option<u32> {
        nix::net::if_::if_nametoindex("lo").ok()
    }

    fn loopback_session(plane: &Arc<SocketControlPlane>, lo: u32) -> Session {
        let session = Session::with_group_limit(
            plane.clone(),
            Arc::new(KernelInterfaceResolver::new()),
            20,
        );
        session.bind(BindRequest::by_index(lo)).unwrap();
        session
    }

    #[test]
    fn test_loopback_membership_shared_between_sessions() {
        let Some(lo) = loopback() else {
            return;
        };
        let plane = Arc::new(SocketControlPlane::new());
        let group = GroupAddress::from(Ipv4Addr::new(239, 76, 0, 1));

        let first = loopback_session(&plane, lo);
        if first.join(group).is_err() {
            // No multicast support on this host.
            return;
        }
        let second = loopback_session(&plane, lo);
        second.join(group).unwrap();
        assert_eq!(plane.users(lo, group), 2);

        first.close();
        assert_eq!(plane.users(lo, group), 1);
        second.close();
        assert_eq!(plane.users(lo, group), 0);
    }

    #[test]
    fn test_loopback_sessions_exceed_per_socket_cap() {
        let Some(lo) = loopback() else {
            return;
        };
        let plane = Arc::new(SocketControlPlane::new());
        let sessions: Vec<Session> = (0..3).map(|_| loopback_session(&plane, lo)).collect();

        let first_group = GroupAddress::from(Ipv4Addr::new(239, 77, 9, 9));
        if sessions[0].join(first_group).is_err() {
            return;
        }
        sessions[0].leave(first_group).unwrap();

        // 30 distinct groups on one interface, above the default cap of 20 per socket.
        for (n, session) in sessions.iter().enumerate() {
            for g in 0..10u8 {
                let group = GroupAddress::from(Ipv4Addr::new(239, 77, n as u8, g));
                assert_eq!(session.join(group), Ok(1), "session {} group {}", n, group);
                assert_eq!(plane.users(lo, group), 1);
            }
        }
        assert!(plane.socket_count(lo) >= 1);

        for session in &sessions {
            let report = session.close();
            assert!(report.failures.is_empty(), "{:?}", report.failures);
            assert_eq!(report.released.len(), 10);
        }
        for n in 0..3u8 {
            let group = GroupAddress::from(Ipv4Addr::new(239, 77, n, 0));
            assert_eq!(plane.users(lo, group), 0);
        }
    }

    #[test]
    fn test_decrement_without_membership_fails() {
        let plane = SocketControlPlane::new();
        let handle = InterfaceHandle::new(Arc::new(Interface::new(1, "lo")));
        let group = GroupAddress::from(Ipv4Addr::new(239, 255, 0, 1));

        let err = plane.decrement(&handle, group).unwrap_err();
        assert!(matches!(err, MembershipError::ControlPlaneFailure { .. }));
        assert_eq!(plane.users(1, group), 0);
    }
}
