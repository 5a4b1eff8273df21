//! Socket construction.

use crate::error::{TransportError, TransportResult};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Default kernel buffer size for each direction.
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Bind a non-blocking UDP socket on `addr` and register it with Tokio.
///
/// IPv6 sockets are set `IPV6_V6ONLY` so the two families never share a port
/// implicitly. Buffer size failures are ignored since some platforms cap them.
///
/// # Errors
///
/// Returns [`TransportError::BindFailed`] if the socket cannot be created or bound.
pub fn bind_udp(addr: SocketAddr, buffer_size: usize) -> TransportResult<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };

    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    if addr.is_ipv6() {
        socket
            .set_only_v6(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    }

    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        tracing::debug!("set_recv_buffer_size({buffer_size}) failed: {e}");
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        tracing::debug!("set_send_buffer_size({buffer_size}) failed: {e}");
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| TransportError::BindFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap(), DEFAULT_BUFFER_SIZE).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_taken_port_fails() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap(), DEFAULT_BUFFER_SIZE).unwrap();
        let taken = first.local_addr().unwrap();
        let result = bind_udp(taken, DEFAULT_BUFFER_SIZE);
        assert!(matches!(result, Err(TransportError::BindFailed(_))));
    }
}
