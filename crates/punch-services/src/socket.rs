//! Port-reusable TCP sockets.
//!
//! A hole punch binds the passive listener and every outbound attempt to the
//! same local port the peer used to reach the negotiator. The kernel only
//! allows that when every socket sharing the port carries SO_REUSEADDR (and
//! SO_REUSEPORT where the platform has it), so every socket on the fixed port
//! is created here.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Socket options applied to every socket bound to the shared local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReusePolicy {
    pub reuse_address: bool,
    pub reuse_port: bool,
    pub nodelay: bool,
}

impl ReusePolicy {
    /// Everything the hole punch needs.
    pub const PUNCH: ReusePolicy = ReusePolicy {
        reuse_address: true,
        reuse_port: true,
        nodelay: true,
    };
}

impl Default for ReusePolicy {
    fn default() -> Self {
        Self::PUNCH
    }
}

/// Create a nonblocking IPv4 stream socket bound to `0.0.0.0:port`.
/// Port 0 lets the OS pick.
pub fn bind_reusable(port: u16, policy: ReusePolicy) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    if policy.reuse_address {
        socket.set_reuse_address(true)?;
    }
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    {
        if policy.reuse_port {
            socket.set_reuse_port(true)?;
        }
    }
    if policy.nodelay {
        socket.set_nodelay(true)?;
    }
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;
    Ok(socket)
}

/// Listen on the shared port. Must be called inside a tokio runtime.
pub fn listen_reusable(port: u16, backlog: i32, policy: ReusePolicy) -> io::Result<TcpListener> {
    let socket = bind_reusable(port, policy)?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}

/// Dial `target` from the shared port on a fresh socket.
///
/// A socket whose connect failed cannot be reused, so every call builds a
/// new one.
pub async fn connect_reusable(
    port: u16,
    target: SocketAddrV4,
    policy: ReusePolicy,
) -> io::Result<TcpStream> {
    let socket = bind_reusable(port, policy)?;
    let socket = TcpSocket::from_std_stream(socket.into());
    socket.connect(target.into()).await
}
