use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::debug;

/// Loopback address the supervised servers listen on.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn tcp_socket(ip: IpAddr) -> io::Result<Socket> {
    match ip {
        IpAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)),
        IpAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)),
    }
}

/// Asks the OS for a free ephemeral TCP port on `ip`.
///
/// The port is bound to port 0, read back and released again, so another
/// process may in principle grab it before the server binds. The supervisor's
/// readiness probe catches that case.
pub fn allocate_port(ip: IpAddr) -> io::Result<u16> {
    let socket = tcp_socket(ip)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(ip, 0).into())?;

    let port = socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bound socket has no inet address"))?;

    debug!("Allocated free port {} on {}", port, ip);
    Ok(port)
}

/// Returns true if no socket is listening on `ip:port`.
///
/// Connections lingering in TIME_WAIT from a previous server do not count.
pub fn is_port_free(ip: IpAddr, port: u16) -> bool {
    let Ok(socket) = tcp_socket(ip) else {
        return false;
    };
    if socket.set_reuse_address(true).is_err() {
        return false;
    }
    socket.bind(&SocketAddr::new(ip, port).into()).is_ok()
}
