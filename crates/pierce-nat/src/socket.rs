//! Socket helpers for port-sharing binds
//!
//! Classification and hole punching must run from the same local port so that
//! the punched NAT mapping matches the classified one. Every socket bound to
//! the punch port therefore sets `SO_REUSEADDR` and, on Unix, `SO_REUSEPORT`.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpSocket, UdpSocket};

fn set_reuse(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    Ok(())
}

/// Bind a non-blocking UDP socket with address/port reuse enabled
///
/// # Errors
///
/// Returns an error if the socket cannot be created or bound.
pub fn bind_udp_reuse(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    set_reuse(&socket)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    UdpSocket::from_std(socket.into())
}

/// Create an unbound TCP socket with address/port reuse enabled
///
/// # Errors
///
/// Returns an error if the socket cannot be created.
pub fn tcp_socket_reuse(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuseport(true)?;
    Ok(socket)
}

/// Wildcard address of the same family as `peer`, on `port`
#[must_use]
pub fn unspecified_for(peer: SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// Local interface address the kernel would route `target` through
///
/// No packet is sent: connecting a UDP socket only selects a route.
///
/// # Errors
///
/// Returns an error if no route to `target` exists.
pub async fn outbound_ip(target: SocketAddr) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind(unspecified_for(target, 0)).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}
