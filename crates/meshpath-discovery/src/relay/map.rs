//! Relay map: regions and the servers inside them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

/// Relay region identifier.
pub type RegionId = u16;

/// Magic IP carried in the legacy `"127.3.3.40:<region>"` home-relay form.
pub const MAGIC_RELAY_IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(127, 3, 3, 40));

/// One relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    /// Server name, unique within its region
    pub name: String,
    /// Hostname or IP literal
    pub host: String,
    /// TCP port of the relay protocol
    pub relay_port: u16,
    /// UDP port of the STUN service (0 = none)
    pub stun_port: u16,
    /// Only answers STUN, never relays
    #[serde(default)]
    pub stun_only: bool,
}

impl RelayNode {
    /// `host:relay_port`
    #[must_use]
    pub fn relay_target(&self) -> String {
        join_host_port(&self.host, self.relay_port)
    }

    /// `host:stun_port`, if this node runs STUN.
    #[must_use]
    pub fn stun_target(&self) -> Option<String> {
        (self.stun_port != 0).then(|| join_host_port(&self.host, self.stun_port))
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

/// A group of relay servers in one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegion {
    /// Region id
    pub id: RegionId,
    /// Short code, e.g. "fra"
    pub code: String,
    /// Servers, tried in order
    pub nodes: Vec<RelayNode>,
}

impl RelayRegion {
    /// First server that relays traffic.
    #[must_use]
    pub fn relay_node(&self) -> Option<&RelayNode> {
        self.nodes.iter().find(|n| !n.stun_only)
    }
}

/// All known relay regions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMap {
    /// Regions by id
    pub regions: BTreeMap<RegionId, RelayRegion>,
}

impl RelayMap {
    /// Build a map from a list of regions.
    #[must_use]
    pub fn from_regions(regions: impl IntoIterator<Item = RelayRegion>) -> Self {
        Self {
            regions: regions.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    /// Look up a region.
    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&RelayRegion> {
        self.regions.get(&id)
    }

    /// Whether there are no regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region ids in ascending order.
    pub fn region_ids(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.regions.keys().copied()
    }
}

/// Parse a peer's home relay string.
///
/// Accepts a bare region id (`"7"`) or the magic-address form
/// (`"127.3.3.40:7"`). Returns `None` for empty or unrecognised strings.
#[must_use]
pub fn parse_home_region(s: &str) -> Option<RegionId> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(id) = s.parse::<RegionId>() {
        return (id != 0).then_some(id);
    }
    let addr: SocketAddr = s.parse().ok()?;
    (addr.ip() == MAGIC_RELAY_IP && addr.port() != 0).then_some(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_home_region() {
        assert_eq!(parse_home_region("7"), Some(7));
        assert_eq!(parse_home_region("127.3.3.40:7"), Some(7));
        assert_eq!(parse_home_region(" 12 "), Some(12));
        assert_eq!(parse_home_region(""), None);
        assert_eq!(parse_home_region("0"), None);
        assert_eq!(parse_home_region("10.0.0.1:7"), None);
        assert_eq!(parse_home_region("fra"), None);
    }

    #[test]
    fn test_targets() {
        let node = RelayNode {
            name: "1a".into(),
            host: "::1".into(),
            relay_port: 443,
            stun_port: 3478,
            stun_only: false,
        };
        assert_eq!(node.relay_target(), "[::1]:443");
        assert_eq!(node.stun_target().as_deref(), Some("[::1]:3478"));

        let named = RelayNode {
            host: "relay.example.net".into(),
            stun_port: 0,
            ..node
        };
        assert_eq!(named.relay_target(), "relay.example.net:443");
        assert_eq!(named.stun_target(), None);
    }

    #[test]
    fn test_relay_node_skips_stun_only() {
        let region = RelayRegion {
            id: 1,
            code: "tst".into(),
            nodes: vec![
                RelayNode {
                    name: "stun".into(),
                    host: "127.0.0.1".into(),
                    relay_port: 0,
                    stun_port: 3478,
                    stun_only: true,
                },
                RelayNode {
                    name: "relay".into(),
                    host: "127.0.0.1".into(),
                    relay_port: 8443,
                    stun_port: 0,
                    stun_only: false,
                },
            ],
        };
        assert_eq!(region.relay_node().map(|n| n.name.as_str()), Some("relay"));
        let map = RelayMap::from_regions([region]);
        assert_eq!(map.region_ids().collect::<Vec<_>>(), vec![1]);
    }
}
