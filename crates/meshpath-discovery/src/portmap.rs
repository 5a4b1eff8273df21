//! NAT-PMP port mapping (RFC 6886).
//!
//! Asks the gateway for its external address and for a UDP mapping to the
//! engine's local port. Each probe re-requests the mapping, which renews its
//! lifetime.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

/// NAT-PMP server port on the gateway.
pub const NATPMP_PORT: u16 = 5351;

const VERSION: u8 = 0;
const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const RESPONSE_BIT: u8 = 0x80;

/// Port mapping errors
#[derive(Debug, thiserror::Error)]
pub enum PortMapError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Gateway did not answer
    #[error("port mapping gateway timeout")]
    Timeout,
    /// Gateway answered with a non-zero result code
    #[error("gateway refused request: result code {0}")]
    Refused(u16),
    /// Response malformed or for another request
    #[error("malformed port mapping response")]
    Malformed,
}

/// A mapping the gateway granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// External address and port
    pub external: SocketAddrV4,
    /// Local port mapped
    pub internal_port: u16,
    /// Lifetime granted
    pub lifetime: Duration,
}

/// Something that can obtain an external port mapping.
#[async_trait]
pub trait PortMapper: Send + Sync + std::fmt::Debug {
    /// Create or renew a UDP mapping for `local_port`.
    ///
    /// `Ok(None)` means the gateway is known to not support mapping.
    async fn map(&self, local_port: u16) -> Result<Option<PortMapping>, PortMapError>;

    /// Release any mapping. Best effort.
    async fn release(&self);
}

/// NAT-PMP client for one gateway.
#[derive(Debug)]
pub struct NatPmpMapper {
    gateway: SocketAddr,
    timeout: Duration,
    lifetime: Duration,
    current: Mutex<Option<PortMapping>>,
}

impl NatPmpMapper {
    /// Client for `gateway` (usually the default router, port 5351).
    #[must_use]
    pub fn new(gateway: SocketAddr, timeout: Duration, lifetime: Duration) -> Self {
        Self {
            gateway,
            timeout,
            lifetime,
            current: Mutex::new(None),
        }
    }

    /// Last mapping granted.
    #[must_use]
    pub fn current(&self) -> Option<PortMapping> {
        *self.current.lock()
    }

    async fn request(&self, req: &[u8], opcode: u8, min_len: usize) -> Result<Vec<u8>, PortMapError> {
        let bind: SocketAddr = if self.gateway.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.gateway).await?;
        socket.send(req).await?;

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| PortMapError::Timeout)??;
        let resp = &buf[..n];
        if resp.len() < min_len || resp[0] != VERSION || resp[1] != (opcode | RESPONSE_BIT) {
            return Err(PortMapError::Malformed);
        }
        let code = u16::from_be_bytes([resp[2], resp[3]]);
        if code != 0 {
            return Err(PortMapError::Refused(code));
        }
        Ok(resp.to_vec())
    }

    async fn external_address(&self) -> Result<Ipv4Addr, PortMapError> {
        let resp = self.request(&[VERSION, OP_EXTERNAL_ADDRESS], OP_EXTERNAL_ADDRESS, 12).await?;
        Ok(Ipv4Addr::new(resp[8], resp[9], resp[10], resp[11]))
    }

    async fn map_udp(&self, local_port: u16, lifetime: Duration) -> Result<(u16, Duration), PortMapError> {
        let secs = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX);
        let suggested = self
            .current()
            .filter(|m| m.internal_port == local_port)
            .map_or(local_port, |m| m.external.port());
        let mut req = vec![VERSION, OP_MAP_UDP, 0, 0];
        req.extend_from_slice(&local_port.to_be_bytes());
        req.extend_from_slice(&suggested.to_be_bytes());
        req.extend_from_slice(&secs.to_be_bytes());

        let resp = self.request(&req, OP_MAP_UDP, 16).await?;
        let internal = u16::from_be_bytes([resp[8], resp[9]]);
        if internal != local_port {
            return Err(PortMapError::Malformed);
        }
        let external = u16::from_be_bytes([resp[10], resp[11]]);
        let granted = u32::from_be_bytes([resp[12], resp[13], resp[14], resp[15]]);
        Ok((external, Duration::from_secs(u64::from(granted))))
    }
}

#[async_trait]
impl PortMapper for NatPmpMapper {
    async fn map(&self, local_port: u16) -> Result<Option<PortMapping>, PortMapError> {
        let ip = self.external_address().await?;
        let (port, lifetime) = self.map_udp(local_port, self.lifetime).await?;
        if port == 0 || ip.is_unspecified() {
            *self.current.lock() = None;
            return Ok(None);
        }
        let mapping = PortMapping {
            external: SocketAddrV4::new(ip, port),
            internal_port: local_port,
            lifetime,
        };
        tracing::debug!(
            "port mapping {local_port} -> {} for {}s",
            mapping.external,
            lifetime.as_secs()
        );
        *self.current.lock() = Some(mapping);
        Ok(Some(mapping))
    }

    async fn release(&self) {
        let Some(mapping) = self.current.lock().take() else {
            return;
        };
        // A zero lifetime deletes the mapping.
        if let Err(e) = self.map_udp(mapping.internal_port, Duration::ZERO).await {
            tracing::debug!("port mapping release failed: {e}");
        }
    }
}
