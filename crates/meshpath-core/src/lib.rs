//! # meshpath core
//!
//! The peer path engine: keeps tunnel traffic flowing between peers over
//! the best available path.
//!
//! This crate provides:
//! - The disco protocol: sealed Ping, Pong and CallMeMaybe messages
//! - Per-peer sessions with candidate books, ping bookkeeping and
//!   best-address selection with hysteresis
//! - The [`Engine`], which owns sockets and relay connections, routes
//!   inbound datagrams, and picks direct or relayed paths for every send
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Engine                                  │
//! │   (send/recv, network map, timers, endpoint discovery)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       PeerSession                                │
//! │   (candidates, pings, trust windows, best address)              │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │        UDP transport         │         Relay transport          │
//! │   (rebinding v4/v6 sockets)  │   (framed TCP, per-region)       │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshpath_core::{Engine, EngineConfig, PeerDescriptor};
//! use meshpath_crypto::NodePrivateKey;
//! use meshpath_discovery::relay::RelayMap;
//!
//! # async fn example(peers: Vec<PeerDescriptor>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.start().await?;
//! engine.set_private_key(Some(NodePrivateKey::generate(&mut rand::rngs::OsRng)));
//! engine.on_network_map_update(&peers, RelayMap::default());
//!
//! engine.send(&peers[0].node_key, vec![b"hello".to_vec()]).await?;
//! let (packets, from) = engine.recv().await?;
//! println!("{} packets from {}", packets.len(), from.fmt_short());
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addrbook;
pub mod config;
pub mod disco;
pub mod engine;
pub mod error;
pub mod netmap;
pub mod session;

pub use config::{DiscoConfig, EngineConfig};
pub use disco::{DiscoCodec, DiscoMessage};
pub use engine::status::{EngineStatus, EngineStatsSnapshot, HealthStatus, PeerPath, PeerStatus};
pub use engine::{Engine, EndpointsCallback, MAX_RECV_BATCH};
pub use error::{EngineError, EngineResult};
pub use netmap::PeerDescriptor;
pub use session::PeerSession;
pub use session::events::{PeerEvent, PeerEventKind};
