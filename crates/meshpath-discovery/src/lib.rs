//! # meshpath discovery
//!
//! Everything the path engine needs to learn about the network around it.
//!
//! This crate provides:
//! - STUN Binding codec and a transaction tracker for replies arriving on
//!   the engine's own sockets
//! - Netcheck: per-region STUN latency, public mappings, symmetric NAT detection
//! - Relay client: framed protocol, sealed handshake, multi-region transport
//!   with bounded per-region queues
//! - NAT-PMP port mapping
//! - Local interface enumeration and a polling link monitor
//! - [`PathProber`](prober::PathProber), which combines the above into the
//!   node's advertised endpoint list
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshpath_discovery::prober::{PathProber, ProberConfig};
//! use meshpath_discovery::relay::RelayMap;
//! use meshpath_discovery::stun::StunTracker;
//! use meshpath_transport::{UdpConfig, UdpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let udp = Arc::new(UdpTransport::bind(UdpConfig::default()).await?);
//! let prober = PathProber::new(ProberConfig::default(), udp, Arc::new(StunTracker::new()));
//! let outcome = prober.determine_endpoints(&RelayMap::default()).await;
//! for ep in &outcome.endpoints {
//!     println!("{ep}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoints;
pub mod interfaces;
pub mod netcheck;
pub mod portmap;
pub mod prober;
pub mod relay;
pub mod stun;

pub use endpoints::{Endpoint, EndpointCache, EndpointKind};
pub use netcheck::NetcheckReport;
pub use portmap::{PortMapError, PortMapper};
pub use prober::{PathProber, ProbeOutcome, ProberConfig};
pub use stun::{StunError, StunTracker};
