//! Control-channel framing.
//!
//! A request is 12 bytes: a big-endian opcode followed by an 8-byte payload.
//! A response is a single big-endian `i32` status.

use byteorder::{BigEndian, ByteOrder};
use mcast_membership::{BindRequest, GroupAddress, MembershipError};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Size of a request frame in bytes
pub const REQUEST_LEN: usize = 12;

/// Size of a response frame in bytes
pub const RESPONSE_LEN: usize = 4;

const OPCODE_BASE: u32 = 0x0012_0000;

/// Join a multicast group
pub const OP_JOIN: u32 = OPCODE_BASE | 0x01;
/// Leave a multicast group
pub const OP_LEAVE: u32 = OPCODE_BASE | 0x02;
/// Bind the session to an interface
pub const OP_BIND: u32 = OPCODE_BASE | 0x03;

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown opcode {0:#x}")]
    UnknownOpcode(u32),
}

impl ProtocolError {
    /// Negative status written back for this error
    ///
    /// An unknown opcode is `-ENOTTY`, the errno for an unsupported control
    /// request, rather than `-EINVAL`, which already means "not a member".
    pub fn status_code(&self) -> i32 {
        match self {
            ProtocolError::UnknownOpcode(_) => -libc::ENOTTY,
        }
    }
}

/// A decoded control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Join(GroupAddress),
    Leave(GroupAddress),
    Bind(BindRequest),
}

impl Request {
    pub fn opcode(&self) -> u32 {
        match self {
            Request::Join(_) => OP_JOIN,
            Request::Leave(_) => OP_LEAVE,
            Request::Bind(_) => OP_BIND,
        }
    }

    /// Encodes the request into a wire frame
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut frame = [0u8; REQUEST_LEN];
        BigEndian::write_u32(&mut frame[0..4], self.opcode());
        match self {
            Request::Join(group) | Request::Leave(group) => {
                frame[4..8].copy_from_slice(&group.octets());
            }
            Request::Bind(bind) => {
                frame[4..8].copy_from_slice(&bind.ifaddr.octets());
                BigEndian::write_u32(&mut frame[8..12], bind.if_index);
            }
        }
        frame
    }

    /// Decodes a wire frame
    pub fn decode(frame: &[u8; REQUEST_LEN]) -> Result<Self, ProtocolError> {
        let opcode = BigEndian::read_u32(&frame[0..4]);
        let addr = [frame[4], frame[5], frame[6], frame[7]];

        match opcode {
            OP_JOIN => Ok(Request::Join(GroupAddress::from_octets(addr))),
            OP_LEAVE => Ok(Request::Leave(GroupAddress::from_octets(addr))),
            OP_BIND => Ok(Request::Bind(BindRequest {
                ifaddr: Ipv4Addr::from(addr),
                if_index: BigEndian::read_u32(&frame[8..12]),
            })),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Maps an operation outcome onto the status written back to the client
///
/// Success is not reported as 0: join and leave return the session's
/// refcount for the group and bind returns the bound interface index.
/// Clients must treat any non-negative status as success.
pub fn status_for(result: &Result<u32, MembershipError>) -> i32 {
    match result {
        // Refcounts and ifindexes above i32::MAX cannot be told apart from errors.
        Ok(value) => i32::try_from(*value).unwrap_or(i32::MAX),
        Err(e) => e.status_code(),
    }
}

pub fn encode_status(status: i32) -> [u8; RESPONSE_LEN] {
    let mut frame = [0u8; RESPONSE_LEN];
    BigEndian::write_i32(&mut frame, status);
    frame
}

pub fn decode_status(frame: &[u8; RESPONSE_LEN]) -> i32 {
    BigEndian::read_i32(frame)
}
