//! # meshpath transport
//!
//! UDP plumbing for the meshpath path engine.
//!
//! This crate provides:
//! - Dual-stack UDP sockets with atomic rebinding ([`udp::UdpTransport`])
//! - Batched send via `sendmmsg` on Linux with a per-buffer fallback
//! - Classification of inbound datagrams into STUN, discovery and tunnel data
//! - Lock-free transport statistics
//!
//! ## Example
//!
//! ```no_run
//! use meshpath_transport::udp::{Family, UdpConfig, UdpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UdpTransport::bind(UdpConfig::default()).await?;
//! transport.send("192.0.2.1:41641".parse()?, &[b"hello".to_vec()]).await?;
//!
//! let mut buf = vec![0u8; 1500];
//! let (n, from) = transport.recv_from(Family::V4, &mut buf).await?;
//! println!("{n} bytes from {from}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod batch;
pub mod classify;
pub mod error;
pub mod rebinding;
pub mod serde_ms;
pub mod socket;
pub mod stats;
pub mod udp;

pub use classify::{DISCO_MAGIC, PacketKind, classify};
pub use error::{TransportError, TransportResult};
pub use rebinding::RebindingSocket;
pub use stats::{TransportStats, TransportStatsSnapshot};
pub use udp::{Family, UdpConfig, UdpTransport};

/// Largest datagram the readers accept.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;
