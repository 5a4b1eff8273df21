//! Peer descriptors from the control plane.

use meshpath_crypto::{DiscoPublicKey, NodePublicKey};
use meshpath_discovery::relay::{RegionId, parse_home_region};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One peer of a network map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Peer identity
    pub node_key: NodePublicKey,
    /// Current disco key; without one the peer is relay-only
    pub disco_key: Option<DiscoPublicKey>,
    /// Advertised endpoints, `"ip:port"`
    pub endpoints: Vec<String>,
    /// Home relay region, `"7"` or `"127.3.3.40:7"`; empty if none
    pub home_relay: String,
    /// The peer is only ever reachable at its single advertised endpoint, so
    /// a confirmed path to it is trusted for the long window
    #[serde(default)]
    pub fixed_endpoint: bool,
}

impl PeerDescriptor {
    /// Descriptor with parsed values.
    #[must_use]
    pub fn new(
        node_key: NodePublicKey,
        disco_key: Option<DiscoPublicKey>,
        endpoints: &[SocketAddr],
        home_region: Option<RegionId>,
    ) -> Self {
        Self {
            node_key,
            disco_key,
            endpoints: endpoints.iter().map(ToString::to_string).collect(),
            home_relay: home_region.map(|r| r.to_string()).unwrap_or_default(),
            fixed_endpoint: false,
        }
    }

    /// Endpoints that parse, in advertised order, without duplicates.
    #[must_use]
    pub fn parsed_endpoints(&self) -> Vec<SocketAddr> {
        let mut out: Vec<SocketAddr> = Vec::with_capacity(self.endpoints.len());
        for s in &self.endpoints {
            match s.parse::<SocketAddr>() {
                Ok(a) if !out.contains(&a) => out.push(a),
                Ok(_) => {}
                Err(_) => tracing::debug!(
                    "peer {}: ignoring endpoint {s:?}",
                    self.node_key.fmt_short()
                ),
            }
        }
        out
    }

    /// Parsed home region.
    #[must_use]
    pub fn home_region(&self) -> Option<RegionId> {
        parse_home_region(&self.home_relay)
    }
}
