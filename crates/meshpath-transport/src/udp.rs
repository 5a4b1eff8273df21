//! Dual-stack UDP transport.
//!
//! One IPv4 and one optional IPv6 socket, each in its own [`RebindingSocket`]
//! slot. IPv4 is mandatory: [`UdpTransport::rebind`] only succeeds if an IPv4
//! socket could be bound. IPv6 failures are logged and the slot is left as a
//! placeholder.
//!
//! Port preference on rebind: the previously bound port, then the configured
//! port, then an OS-assigned one.

use crate::batch::send_batch;
use crate::error::{TransportError, TransportResult, is_family_unsupported};
use crate::rebinding::RebindingSocket;
use crate::socket::{DEFAULT_BUFFER_SIZE, bind_udp};
use crate::stats::{TransportStats, TransportStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// How long a rebind waits for readers to let go of the old socket.
const RELEASE_WAIT: Duration = Duration::from_millis(250);

/// UDP socket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Preferred local port (0 = OS-assigned)
    pub port: u16,
    /// IPv4 address to bind
    pub bind_v4: Ipv4Addr,
    /// IPv6 address to bind
    pub bind_v6: Ipv6Addr,
    /// Never open an IPv6 socket
    pub disable_v6: bool,
    /// Kernel send/receive buffer size
    pub socket_buffer_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind_v4: Ipv4Addr::UNSPECIFIED,
            bind_v6: Ipv6Addr::UNSPECIFIED,
            disable_v6: false,
            socket_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl UdpConfig {
    /// Loopback-only configuration for tests.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            bind_v4: Ipv4Addr::LOCALHOST,
            bind_v6: Ipv6Addr::LOCALHOST,
            disable_v6: true,
            ..Self::default()
        }
    }
}

/// Address family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl Family {
    /// Family of `addr`.
    #[must_use]
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { Self::V4 } else { Self::V6 }
    }

    fn label(self) -> &'static str {
        match self {
            Self::V4 => "IPv4",
            Self::V6 => "IPv6",
        }
    }
}

/// Dual-stack UDP transport.
#[derive(Debug)]
pub struct UdpTransport {
    config: UdpConfig,
    v4: RebindingSocket,
    v6: RebindingSocket,
    rebind_lock: Mutex<()>,
    no_v6: AtomicBool,
    batching: AtomicBool,
    stats: Arc<TransportStats>,
}

impl UdpTransport {
    /// Create a transport with both slots empty. Call [`rebind`](Self::rebind)
    /// to open sockets.
    #[must_use]
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            v4: RebindingSocket::new(),
            v6: RebindingSocket::new(),
            rebind_lock: Mutex::new(()),
            no_v6: AtomicBool::new(false),
            batching: AtomicBool::new(true),
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Create and bind in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if no IPv4 socket can be bound.
    pub async fn bind(config: UdpConfig) -> TransportResult<Self> {
        let transport = Self::new(config);
        transport.rebind().await?;
        Ok(transport)
    }

    /// Close and reopen both sockets.
    ///
    /// Returns the new IPv4 local address. On IPv4 failure the slot holds the
    /// blocking placeholder so readers stay parked instead of failing. The
    /// sticky "no IPv6" flag is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if no IPv4 port could be bound,
    /// or [`TransportError::Closed`] after [`close`](Self::close).
    pub async fn rebind(&self) -> TransportResult<SocketAddr> {
        let _guard = self.rebind_lock.lock().await;
        if self.v4.is_closed() {
            return Err(TransportError::Closed);
        }

        let prev_v4 = self.v4.local_addr().map(|a| a.port());
        let prev_v6 = self.v6.local_addr().map(|a| a.port());

        // Release the old sockets first so the previous port can be reused.
        release(self.v4.replace(None)).await;
        release(self.v6.replace(None)).await;
        self.no_v6.store(false, Ordering::Relaxed);

        let v4_ports = self.port_candidates(prev_v4);
        let Some(v4) = self.bind_family(IpAddr::V4(self.config.bind_v4), &v4_ports) else {
            tracing::warn!("rebind: no IPv4 port could be bound (tried {v4_ports:?})");
            return Err(TransportError::BindFailed(format!(
                "no IPv4 port available (tried {v4_ports:?})"
            )));
        };
        let v4_addr = v4.local_addr()?;
        self.v4.replace(Some(v4));

        if !self.config.disable_v6 {
            let mut v6_ports = vec![v4_addr.port()];
            v6_ports.extend(self.port_candidates(prev_v6));
            v6_ports.dedup();
            match self.bind_family(IpAddr::V6(self.config.bind_v6), &v6_ports) {
                Some(v6) => {
                    self.v6.replace(Some(v6));
                }
                None => tracing::info!("rebind: IPv6 unavailable, continuing with IPv4 only"),
            }
        }

        tracing::debug!(
            "rebind: bound {} (v6: {:?})",
            v4_addr,
            self.v6.local_addr()
        );
        Ok(v4_addr)
    }

    fn port_candidates(&self, previous: Option<u16>) -> Vec<u16> {
        let mut ports = Vec::with_capacity(3);
        for port in [previous.unwrap_or(0), self.config.port] {
            if port != 0 && !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports.push(0);
        ports
    }

    fn bind_family(&self, ip: IpAddr, ports: &[u16]) -> Option<tokio::net::UdpSocket> {
        for &port in ports {
            match bind_udp(SocketAddr::new(ip, port), self.config.socket_buffer_size) {
                Ok(socket) => return Some(socket),
                Err(e) => tracing::debug!("bind {ip} port {port} failed: {e}"),
            }
        }
        None
    }

    /// Send `bufs` to `addr`.
    ///
    /// IPv6 sends are dropped silently once the host has shown it cannot
    /// reach IPv6 destinations.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NoSocket`] if the family has no socket, or
    /// the I/O error for real send failures.
    pub async fn send(&self, addr: SocketAddr, bufs: &[Vec<u8>]) -> TransportResult<()> {
        let family = Family::of(&addr);
        if family == Family::V6 && self.no_v6.load(Ordering::Relaxed) {
            self.stats.record_unsupported_drop(bufs.len());
            return Ok(());
        }
        let Some(socket) = self.slot(family).current() else {
            return Err(TransportError::NoSocket(family.label()));
        };

        match send_batch(&socket, addr, bufs, &self.batching).await {
            Ok(n) => {
                let bytes = bufs.iter().take(n).map(Vec::len).sum();
                self.stats.record_send(n, bytes);
                Ok(())
            }
            Err(e) if is_family_unsupported(&e) => {
                if family == Family::V6 && !self.no_v6.swap(true, Ordering::Relaxed) {
                    tracing::info!("disabling IPv6 sends: {e}");
                }
                self.stats.record_unsupported_drop(bufs.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    /// Receive one datagram on `family`'s socket, following rebinds.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after close, or the socket error.
    pub async fn recv_from(
        &self,
        family: Family,
        buf: &mut [u8],
    ) -> TransportResult<(usize, SocketAddr)> {
        match self.slot(family).recv_from(buf).await {
            Ok((n, from)) => {
                self.stats.record_recv(n);
                Ok((n, from))
            }
            Err(TransportError::Closed) => Err(TransportError::Closed),
            Err(e) => {
                self.stats.record_recv_error();
                Err(e)
            }
        }
    }

    fn slot(&self, family: Family) -> &RebindingSocket {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    /// Local address of `family`'s socket.
    #[must_use]
    pub fn local_addr(&self, family: Family) -> Option<SocketAddr> {
        self.slot(family).local_addr()
    }

    /// Current IPv4 port, 0 if unbound.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.v4.local_addr().map_or(0, |a| a.port())
    }

    /// Whether an IPv6 socket is bound and not disabled.
    #[must_use]
    pub fn has_v6(&self) -> bool {
        self.v6.current().is_some() && !self.no_v6.load(Ordering::Relaxed)
    }

    /// Whether an IPv4 socket is bound.
    #[must_use]
    pub fn has_v4(&self) -> bool {
        self.v4.current().is_some()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close both sockets and wake all readers. Idempotent.
    pub async fn close(&self) {
        let _guard = self.rebind_lock.lock().await;
        self.v4.close();
        self.v6.close();
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.v4.is_closed()
    }
}

/// Wait (bounded) until readers woken by a slot replacement drop their
/// handle on the old socket, so its port is free again.
async fn release(previous: Option<Arc<tokio::net::UdpSocket>>) {
    let Some(socket) = previous else {
        return;
    };
    let deadline = tokio::time::Instant::now() + RELEASE_WAIT;
    while Arc::strong_count(&socket) > 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bind_loopback() {
        let transport = UdpTransport::bind(UdpConfig::loopback()).await.unwrap();
        let addr = transport.local_addr(Family::V4).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(transport.local_port(), addr.port());
        assert!(!transport.has_v6());
    }

    #[tokio::test]
    async fn test_send_recv() {
        let a = UdpTransport::bind(UdpConfig::loopback()).await.unwrap();
        let b = UdpTransport::bind(UdpConfig::loopback()).await.unwrap();
        let dst = b.local_addr(Family::V4).unwrap();

        a.send(dst, &[b"hello".to_vec(), b"world".to_vec()])
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(1), b.recv_from(Family::V4, &mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr(Family::V4).unwrap());
        assert_eq!(a.stats().packets_sent, 2);
    }

    #[tokio::test]
    async fn test_rebind_keeps_previous_port() {
        let transport = UdpTransport::bind(UdpConfig::loopback()).await.unwrap();
        let before = transport.local_port();
        let after = transport.rebind().await.unwrap();
        assert_eq!(after.port(), before);
    }

    #[tokio::test]
    async fn test_rebind_falls_back_when_configured_port_taken() {
        let squatter = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = squatter.local_addr().unwrap().port();

        let config = UdpConfig {
            port: taken,
            ..UdpConfig::loopback()
        };
        let transport = UdpTransport::bind(config).await.unwrap();
        assert_ne!(transport.local_port(), taken);
        assert_ne!(transport.local_port(), 0);
    }

    #[tokio::test]
    async fn test_send_without_v6_socket() {
        let transport = UdpTransport::bind(UdpConfig::loopback()).await.unwrap();
        let res = transport.send("[::1]:5000".parse().unwrap(), &[vec![1]]).await;
        assert!(matches!(res, Err(TransportError::NoSocket("IPv6"))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = UdpTransport::bind(UdpConfig::loopback()).await.unwrap();
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());
        assert!(matches!(transport.rebind().await, Err(TransportError::Closed)));

        let mut buf = [0u8; 8];
        let res = transport.recv_from(Family::V4, &mut buf).await;
        assert!(matches!(res, Err(TransportError::Closed)));
    }

    #[test]
    fn test_port_candidates_order() {
        let transport = UdpTransport::new(UdpConfig {
            port: 41641,
            ..UdpConfig::loopback()
        });
        assert_eq!(transport.port_candidates(Some(5000)), vec![5000, 41641, 0]);
        assert_eq!(transport.port_candidates(None), vec![41641, 0]);
        assert_eq!(transport.port_candidates(Some(41641)), vec![41641, 0]);

        let unconfigured = UdpTransport::new(UdpConfig::loopback());
        assert_eq!(unconfigured.port_candidates(None), vec![0]);
    }
}
