//! Error types for membership operations.
//!
//! Every operation reports failure synchronously through [`MembershipError`];
//! nothing is retried inside the engine.

use thiserror::Error;

use crate::types::GroupAddress;

/// Result type alias for membership operations.
pub type Result<T> = std::result::Result<T, MembershipError>;

/// Errors that can occur while binding, joining, leaving or closing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// Join or leave issued before the session was bound to an interface.
    #[error("Session is not bound to an interface")]
    NotBound,

    /// Bind could not resolve an interface.
    #[error("No interface matches {target}")]
    AddressNotAvailable {
        /// What the bind tried to resolve (an index or a local address).
        target: String,
    },

    /// Storage for a new membership could not be obtained.
    #[error("Cannot allocate membership for group {group}")]
    OutOfMemory {
        /// The group that was being joined.
        group: GroupAddress,
    },

    /// Leave issued for a group with no active membership.
    #[error("Not a member of group {group}")]
    NotMember {
        /// The group that was being left.
        group: GroupAddress,
    },

    /// The control plane refused to add or remove the membership.
    #[error("Control plane {operation} failed for group {group} on ifindex {if_index}: {message}")]
    ControlPlaneFailure {
        /// "increment" or "decrement".
        operation: &'static str,
        /// The group involved.
        group: GroupAddress,
        /// The interface the call targeted.
        if_index: u32,
        /// Human-readable cause.
        message: String,
        /// OS error number, when the control plane is backed by the kernel.
        errno: Option<i32>,
    },

    /// Bind issued on a session that already holds an interface.
    #[error("Session is already bound to ifindex {if_index}")]
    AlreadyBound {
        /// The interface the session is bound to.
        if_index: u32,
    },

    /// Operation issued after the session was closed.
    #[error("Session is closed")]
    SessionClosed,
}

impl MembershipError {
    /// Creates an address-not-available error.
    pub fn address_not_available(target: impl Into<String>) -> Self {
        Self::AddressNotAvailable {
            target: target.into(),
        }
    }

    /// Creates a control-plane failure without an OS error number.
    pub fn control_plane(
        operation: &'static str,
        group: GroupAddress,
        if_index: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::ControlPlaneFailure {
            operation,
            group,
            if_index,
            message: message.into(),
            errno: None,
        }
    }

    /// Creates a control-plane failure from an OS error.
    pub fn control_plane_os(
        operation: &'static str,
        group: GroupAddress,
        if_index: u32,
        err: &std::io::Error,
    ) -> Self {
        Self::ControlPlaneFailure {
            operation,
            group,
            if_index,
            message: err.to_string(),
            errno: err.raw_os_error(),
        }
    }

    /// Returns the positive errno this error is reported as on the control channel.
    pub fn errno(&self) -> i32 {
        match self {
            MembershipError::NotBound => libc::ENODEV,
            MembershipError::AddressNotAvailable { .. } => libc::EADDRNOTAVAIL,
            MembershipError::OutOfMemory { .. } => libc::ENOMEM,
            MembershipError::NotMember { .. } => libc::EINVAL,
            MembershipError::ControlPlaneFailure { errno, .. } => errno.unwrap_or(libc::EIO),
            MembershipError::AlreadyBound { .. } => libc::EBUSY,
            MembershipError::SessionClosed => libc::EBADF,
        }
    }

    /// Returns the negative status code written back on the control channel.
    pub fn status_code(&self) -> i32 {
        -self.errno()
    }
}
