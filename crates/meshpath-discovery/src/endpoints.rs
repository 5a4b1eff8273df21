//! Self endpoints: the addresses peers may use to reach this node.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// How an endpoint was discovered.
///
/// Variants are declared in advertisement priority order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// External port mapping obtained from the gateway
    PortMapped,
    /// Public address reported by STUN
    Stun,
    /// STUN public IP combined with the local port (for 1:1 NATs)
    Stun4LocalPort,
    /// Local interface address
    Local,
    /// Configured explicitly
    Static,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PortMapped => "portmap",
            Self::Stun => "stun",
            Self::Stun4LocalPort => "stun4localport",
            Self::Local => "local",
            Self::Static => "static",
        })
    }
}

/// One of this node's own reachable addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Address
    pub addr: SocketAddr,
    /// Discovery method
    pub kind: EndpointKind,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub const fn new(addr: SocketAddr, kind: EndpointKind) -> Self {
        Self { addr, kind }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.kind)
    }
}

/// Sort by priority and drop repeated addresses, keeping the best kind for
/// each. Order among equal kinds is preserved.
pub fn prioritize(endpoints: &mut Vec<Endpoint>) {
    endpoints.sort_by_key(|e| e.kind);
    let mut seen = std::collections::HashSet::new();
    endpoints.retain(|e| seen.insert(e.addr));
}

/// Keeps recently discovered endpoints alive for a grace period so one
/// failed probe doesn't make an address disappear and reappear.
#[derive(Debug)]
pub struct EndpointCache {
    ttl: Duration,
    entries: HashMap<SocketAddr, (EndpointKind, Instant)>,
}

impl EndpointCache {
    /// Create a cache holding entries for `ttl` after they were last seen.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record freshly discovered endpoints, then append every unexpired
    /// cached endpoint missing from `current`.
    pub fn update(&mut self, current: &mut Vec<Endpoint>, now: Instant) {
        for ep in current.iter() {
            self.entries.insert(ep.addr, (ep.kind, now));
        }
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < ttl);

        let mut extra: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|(addr, _)| !current.iter().any(|e| e.addr == **addr))
            .map(|(addr, (kind, _))| Endpoint::new(*addr, *kind))
            .collect();
        extra.sort_by_key(|e| (e.kind, e.addr));
        current.extend(extra);
    }

    /// Number of cached endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str, kind: EndpointKind) -> Endpoint {
        Endpoint::new(s.parse().unwrap(), kind)
    }

    #[test]
    fn test_prioritize_orders_and_dedups() {
        let mut eps = vec![
            ep("10.0.0.2:41641", EndpointKind::Local),
            ep("203.0.113.5:41641", EndpointKind::Stun4LocalPort),
            ep("203.0.113.5:59000", EndpointKind::Stun),
            ep("203.0.113.5:1234", EndpointKind::PortMapped),
            ep("203.0.113.5:59000", EndpointKind::Local),
        ];
        prioritize(&mut eps);
        let kinds: Vec<_> = eps.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EndpointKind::PortMapped,
                EndpointKind::Stun,
                EndpointKind::Stun4LocalPort,
                EndpointKind::Local,
            ]
        );
    }

    #[test]
    fn test_cache_keeps_endpoint_during_grace_period() {
        let start = Instant::now();
        let mut cache = EndpointCache::new(Duration::from_secs(300));

        let mut first = vec![ep("203.0.113.5:59000", EndpointKind::Stun)];
        cache.update(&mut first, start);
        assert_eq!(first.len(), 1);

        let mut second = vec![ep("10.0.0.2:41641", EndpointKind::Local)];
        cache.update(&mut second, start + Duration::from_secs(60));
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].kind, EndpointKind::Stun);

        let mut third = Vec::new();
        cache.update(&mut third, start + Duration::from_secs(301));
        assert_eq!(third, vec![ep("10.0.0.2:41641", EndpointKind::Local)]);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ep("1.2.3.4:5", EndpointKind::Static).to_string(),
            "1.2.3.4:5 (static)"
        );
    }
}
