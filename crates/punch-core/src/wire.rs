//! Punch wire format — every message exchanged between peers and the negotiator.
//!
//! These types ARE the protocol. Field order, tag values and integer widths are
//! part of the wire format; changing any of them breaks older peers.
//!
//! Addresses are carried as a fixed 6-byte `WireAddr` (zerocopy, no unsafe).
//! Names are length-prefixed with a single byte, so a name is 1..=255 bytes
//! of UTF-8. All multi-byte integers are big-endian.
//!
//! Layouts:
//!
//! ```text
//! Request      = tag:u8 body
//!   0x01 Registration  name WireAddr(local)
//!   0x02 Connection    name(target) name(requester)
//! PeerRecord   = name WireAddr(local) WireAddr(remote)
//! Reply        = tag:u8 body
//!   0x00 Peer          PeerRecord
//!   0x01 Status        (empty) target not found
//!   0x02 Status        (empty) requester not registered
//! name         = len:u8 utf8[len]
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Address ───────────────────────────────────────────────────────────────────

/// On-wire IPv4 endpoint: 4 address octets followed by a big-endian port.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct WireAddr {
    /// Address octets in network order.
    pub ip: [u8; 4],
    /// Port, big-endian.
    pub port: [u8; 2],
}

assert_eq_size!(WireAddr, [u8; 6]);

/// Encoded size of a `WireAddr`.
pub const WIRE_ADDR_LEN: usize = std::mem::size_of::<WireAddr>();

impl From<SocketAddrV4> for WireAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            ip: addr.ip().octets(),
            port: addr.port().to_be_bytes(),
        }
    }
}

impl From<WireAddr> for SocketAddrV4 {
    fn from(addr: WireAddr) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(addr.ip), u16::from_be_bytes(addr.port))
    }
}

// ── Discriminants ─────────────────────────────────────────────────────────────

/// Request envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// First message on a fresh connection: announce name and private address.
    Registration = 0x01,
    /// Ask the negotiator to introduce the requester to a registered target.
    Connection = 0x02,
}

impl TryFrom<u8> for RequestType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(RequestType::Registration),
            0x02 => Ok(RequestType::Connection),
            other => Err(WireError::UnknownRequestType(other)),
        }
    }
}

impl From<RequestType> for u8 {
    fn from(t: RequestType) -> u8 {
        t as u8
    }
}

/// Reply tag preceding a PeerRecord.
pub const REPLY_PEER: u8 = 0x00;

/// Negative outcome of a connection request.
///
/// A status reply is exactly one byte on the wire: the status value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The requested target has no registration.
    TargetNotFound = 0x01,
    /// The requester itself has no registration.
    RequesterNotRegistered = 0x02,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Status::TargetNotFound),
            0x02 => Ok(Status::RequesterNotRegistered),
            other => Err(WireError::UnknownReplyType(other)),
        }
    }
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        s as u8
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::TargetNotFound => write!(f, "target not found"),
            Status::RequesterNotRegistered => write!(f, "requester not registered"),
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Longest peer name, in bytes. Bounded by the single-byte length prefix.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Default negotiator port.
pub const DEFAULT_NEGOTIATOR_PORT: u16 = 8080;

// ── Messages ──────────────────────────────────────────────────────────────────

/// What the negotiator knows about a registered peer.
///
/// `remote_addr` is always the source address the negotiator observed on the
/// registration connection, never a value supplied by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    name: String,
    local_addr: SocketAddrV4,
    remote_addr: SocketAddrV4,
}

impl PeerRecord {
    pub fn new(
        name: impl Into<String>,
        local_addr: SocketAddrV4,
        remote_addr: SocketAddrV4,
    ) -> Result<Self, WireError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            local_addr,
            remote_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the peer bound before registering (its private side).
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// NAT-mapped address the negotiator observed.
    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote_addr
    }

    fn put(&self, buf: &mut BytesMut) {
        // Name was validated at construction.
        buf.put_u8(self.name.len() as u8);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(WireAddr::from(self.local_addr).as_bytes());
        buf.put_slice(WireAddr::from(self.remote_addr).as_bytes());
    }

    fn take(buf: &mut &[u8]) -> Result<Self, WireError> {
        let name = take_name(buf)?;
        let local_addr = take_addr(buf)?;
        let remote_addr = take_addr(buf)?;
        Ok(Self {
            name,
            local_addr,
            remote_addr,
        })
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (local={}, remote={})",
            self.name, self.local_addr, self.remote_addr
        )
    }
}

/// Peer → negotiator request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Registration {
        name: String,
        local_addr: SocketAddrV4,
    },
    Connection {
        target: String,
        requester: String,
    },
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Registration { .. } => RequestType::Registration,
            Request::Connection { .. } => RequestType::Connection,
        }
    }
}

/// Negotiator → peer reply: a PeerRecord (registration ack, connection
/// result, or unsolicited offer) or a status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Peer(PeerRecord),
    Status(Status),
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// A message with a byte encoding. Framing lives in `crate::frame`.
pub trait WireMessage: Sized {
    fn encode(&self) -> Result<Bytes, WireError>;
    fn decode(bytes: &[u8]) -> Result<Self, WireError>;
}

impl WireMessage for PeerRecord {
    fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(1 + self.name.len() + 2 * WIRE_ADDR_LEN);
        self.put(&mut buf);
        Ok(buf.freeze())
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = bytes;
        let record = PeerRecord::take(&mut buf)?;
        finish(buf)?;
        Ok(record)
    }
}

impl WireMessage for Request {
    fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.request_type().into());
        match self {
            Request::Registration { name, local_addr } => {
                put_name(&mut buf, name)?;
                buf.put_slice(WireAddr::from(*local_addr).as_bytes());
            }
            Request::Connection { target, requester } => {
                put_name(&mut buf, target)?;
                put_name(&mut buf, requester)?;
            }
        }
        Ok(buf.freeze())
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = bytes;
        let request = match RequestType::try_from(take_u8(&mut buf)?)? {
            RequestType::Registration => Request::Registration {
                name: take_name(&mut buf)?,
                local_addr: take_addr(&mut buf)?,
            },
            RequestType::Connection => Request::Connection {
                target: take_name(&mut buf)?,
                requester: take_name(&mut buf)?,
            },
        };
        finish(buf)?;
        Ok(request)
    }
}

impl WireMessage for Reply {
    fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Reply::Peer(record) => {
                buf.put_u8(REPLY_PEER);
                record.put(&mut buf);
            }
            Reply::Status(status) => buf.put_u8((*status).into()),
        }
        Ok(buf.freeze())
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = bytes;
        let reply = match take_u8(&mut buf)? {
            REPLY_PEER => Reply::Peer(PeerRecord::take(&mut buf)?),
            other => Reply::Status(Status::try_from(other)?),
        };
        finish(buf)?;
        Ok(reply)
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

/// Check a peer name against the wire limits.
pub fn validate_name(name: &str) -> Result<(), WireError> {
    if name.is_empty() {
        return Err(WireError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.len()));
    }
    Ok(())
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), WireError> {
    validate_name(name)?;
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Malformed("unexpected end of message"));
    }
    Ok(buf.get_u8())
}

fn take_name(buf: &mut &[u8]) -> Result<String, WireError> {
    let len = take_u8(buf)? as usize;
    if len == 0 {
        return Err(WireError::Malformed("empty name"));
    }
    if buf.remaining() < len {
        return Err(WireError::Malformed("truncated name"));
    }
    let name = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::Malformed("name is not valid UTF-8"))?
        .to_owned();
    buf.advance(len);
    Ok(name)
}

fn take_addr(buf: &mut &[u8]) -> Result<SocketAddrV4, WireError> {
    if buf.remaining() < WIRE_ADDR_LEN {
        return Err(WireError::Malformed("truncated address"));
    }
    let addr = WireAddr::read_from(&buf[..WIRE_ADDR_LEN])
        .ok_or(WireError::Malformed("truncated address"))?;
    buf.advance(WIRE_ADDR_LEN);
    Ok(addr.into())
}

fn finish(buf: &[u8]) -> Result<(), WireError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(WireError::Malformed("trailing bytes after message"))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when building or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unknown request type: 0x{0:02x}")]
    UnknownRequestType(u8),

    #[error("unknown reply type: 0x{0:02x}")]
    UnknownReplyType(u8),

    #[error("peer name must not be empty")]
    EmptyName,

    #[error("peer name is {0} bytes, maximum is {}", MAX_NAME_LEN)]
    NameTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
