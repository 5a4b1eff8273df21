//! Relay client side: wire protocol, single-server dialing and the
//! multi-region transport the engine sends through.

pub mod client;
pub mod map;
pub mod protocol;
pub mod transport;

pub use map::{RegionId, RelayMap, RelayNode, RelayRegion, parse_home_region};
pub use protocol::{Frame, RelayError, RelayResult};
pub use transport::{RelayConfig, RelayConnStatus, RelayInbound, RelayStatsSnapshot, RelayTransport};
