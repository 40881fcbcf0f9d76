//! TCP listener setup.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::error::Result;

/// Pending-connection backlog for grid listeners.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Bind a TCP listener with address reuse enabled.
///
/// Coordinator and nodes restart on fixed ports, so `SO_REUSEADDR` is set
/// before binding to avoid `TIME_WAIT` collisions.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    tracing::debug!(addr = %listener.local_addr()?, "TCP listener bound");

    Ok(listener)
}
