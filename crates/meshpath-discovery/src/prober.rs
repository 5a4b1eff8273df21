//! PathProber: works out how other nodes can reach this one.
//!
//! Combines a netcheck (STUN through the engine sockets), an optional
//! port mapping, local interface addresses and configured static endpoints,
//! then pads the result with recently seen endpoints from the cache.

use crate::endpoints::{Endpoint, EndpointCache, EndpointKind, prioritize};
use crate::interfaces;
use crate::netcheck::{Netcheck, NetcheckReport};
use crate::portmap::{NatPmpMapper, PortMapper};
use crate::relay::map::RelayMap;
use crate::stun::StunTracker;
use meshpath_transport::{Family, UdpTransport};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Prober configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    /// Per-request STUN timeout
    #[serde(with = "meshpath_transport::serde_ms")]
    pub stun_timeout: Duration,
    /// Lower bound of the periodic re-STUN interval
    #[serde(with = "meshpath_transport::serde_ms")]
    pub restun_min: Duration,
    /// Upper bound of the periodic re-STUN interval
    #[serde(with = "meshpath_transport::serde_ms")]
    pub restun_max: Duration,
    /// Grace period for endpoints no longer rediscovered
    #[serde(with = "meshpath_transport::serde_ms")]
    pub endpoint_cache_ttl: Duration,
    /// Interface poll interval of the link monitor
    #[serde(with = "meshpath_transport::serde_ms")]
    pub link_poll_interval: Duration,
    /// Endpoints always advertised
    pub static_endpoints: Vec<SocketAddr>,
    /// NAT-PMP gateway; port mapping is off when unset
    pub portmap_gateway: Option<SocketAddr>,
    /// Requested port mapping lifetime
    #[serde(with = "meshpath_transport::serde_ms")]
    pub portmap_lifetime: Duration,
    /// Advertise local interface addresses
    pub advertise_local: bool,
    /// Treat loopback addresses as local interface addresses
    pub include_loopback: bool,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            stun_timeout: Duration::from_secs(3),
            restun_min: Duration::from_secs(20),
            restun_max: Duration::from_secs(26),
            endpoint_cache_ttl: Duration::from_secs(5 * 60),
            link_poll_interval: Duration::from_secs(10),
            static_endpoints: Vec::new(),
            portmap_gateway: None,
            portmap_lifetime: Duration::from_secs(2 * 60 * 60),
            advertise_local: true,
            include_loopback: false,
        }
    }
}

/// Outcome of one endpoint determination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Endpoints in advertisement order
    pub endpoints: Vec<Endpoint>,
    /// The netcheck behind them
    pub report: NetcheckReport,
}

/// Self-address discovery.
#[derive(Debug)]
pub struct PathProber {
    config: ProberConfig,
    udp: Arc<UdpTransport>,
    netcheck: Netcheck,
    port_mapper: Option<Arc<dyn PortMapper>>,
    cache: Mutex<EndpointCache>,
    last_report: Mutex<Option<NetcheckReport>>,
}

impl PathProber {
    /// Create a prober sending STUN through `udp`. STUN replies must be fed
    /// into `tracker`.
    #[must_use]
    pub fn new(config: ProberConfig, udp: Arc<UdpTransport>, tracker: Arc<StunTracker>) -> Self {
        let port_mapper = config.portmap_gateway.map(|gw| {
            Arc::new(NatPmpMapper::new(gw, config.stun_timeout, config.portmap_lifetime))
                as Arc<dyn PortMapper>
        });
        Self {
            netcheck: Netcheck::new(Arc::clone(&udp), tracker, config.stun_timeout),
            cache: Mutex::new(EndpointCache::new(config.endpoint_cache_ttl)),
            last_report: Mutex::new(None),
            config,
            udp,
            port_mapper,
        }
    }

    /// Replace the port mapper.
    #[must_use]
    pub fn with_port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = Some(mapper);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Most recent netcheck report.
    #[must_use]
    pub fn last_report(&self) -> Option<NetcheckReport> {
        self.last_report.lock().clone()
    }

    /// Run every discovery method and return endpoints in priority order:
    /// port-mapped, STUN, STUN IP with local port, local, static.
    pub async fn determine_endpoints(&self, relay_map: &RelayMap) -> ProbeOutcome {
        let report = if relay_map.is_empty() {
            NetcheckReport::default()
        } else {
            self.netcheck.run(relay_map).await
        };
        let local_port = self.udp.local_port();

        let mut endpoints = Vec::new();
        if let Some(mapper) = &self.port_mapper {
            if local_port != 0 {
                match mapper.map(local_port).await {
                    Ok(Some(m)) => endpoints.push(Endpoint::new(
                        SocketAddr::V4(m.external),
                        EndpointKind::PortMapped,
                    )),
                    Ok(None) => {}
                    Err(e) => tracing::debug!("port mapping failed: {e}"),
                }
            }
        }
        endpoints.extend(self.stun_endpoints(&report, local_port));
        if self.config.advertise_local {
            endpoints.extend(self.local_endpoints());
        }
        endpoints.extend(
            self.config
                .static_endpoints
                .iter()
                .map(|a| Endpoint::new(*a, EndpointKind::Static)),
        );

        prioritize(&mut endpoints);
        self.cache.lock().update(&mut endpoints, Instant::now());
        prioritize(&mut endpoints);

        *self.last_report.lock() = Some(report.clone());
        ProbeOutcome { endpoints, report }
    }

    fn stun_endpoints(&self, report: &NetcheckReport, local_port: u16) -> Vec<Endpoint> {
        let mut out = Vec::new();
        if let Some(v4) = report.global_v4 {
            out.push(Endpoint::new(v4, EndpointKind::Stun));
            if local_port != 0 && v4.port() != local_port {
                out.push(Endpoint::new(
                    SocketAddr::new(v4.ip(), local_port),
                    EndpointKind::Stun4LocalPort,
                ));
            }
        }
        if let Some(v6) = report.global_v6 {
            out.push(Endpoint::new(v6, EndpointKind::Stun));
        }
        out
    }

    fn local_endpoints(&self) -> Vec<Endpoint> {
        let v4_port = self.udp.local_addr(Family::V4).map(|a| a.port());
        let v6_port = self
            .udp
            .local_addr(Family::V6)
            .filter(|_| self.udp.has_v6())
            .map(|a| a.port());
        let bound_v4 = self.udp.local_addr(Family::V4).map(|a| a.ip());

        let mut ips = interfaces::local_addresses(self.config.include_loopback);
        // A socket bound to one specific address is only reachable there.
        if let Some(ip) = bound_v4.filter(|ip| !ip.is_unspecified()) {
            ips.retain(|i| i.is_ipv6() || *i == ip);
            if !ips.contains(&ip) && (self.config.include_loopback || !ip.is_loopback()) {
                ips.push(ip);
            }
        }

        ips.into_iter()
            .filter_map(|ip| {
                let port = match ip {
                    IpAddr::V4(_) => v4_port,
                    IpAddr::V6(_) => v6_port,
                }?;
                Some(Endpoint::new(SocketAddr::new(ip, port), EndpointKind::Local))
            })
            .collect()
    }

    /// Delay until the next periodic re-STUN, uniform in
    /// `restun_min..=restun_max`.
    pub fn restun_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.config.restun_min;
        let max = self.config.restun_max.max(min);
        let span = u64::try_from((max - min).as_millis()).unwrap_or(u64::MAX);
        min + Duration::from_millis(rng.gen_range(0..=span))
    }

    /// Drop cached endpoints, e.g. after a link change.
    pub fn forget_cached(&self) {
        self.cache.lock().clear();
    }

    /// Release the port mapping. Best effort.
    pub async fn close(&self) {
        if let Some(mapper) = &self.port_mapper {
            mapper.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portmap::{PortMapError, PortMapping};
    use async_trait::async_trait;
    use meshpath_transport::UdpConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::SocketAddrV4;

    #[derive(Debug)]
    struct FixedMapper(SocketAddrV4);

    #[async_trait]
    impl PortMapper for FixedMapper {
        async fn map(&self, local_port: u16) -> Result<Option<PortMapping>, PortMapError> {
            Ok(Some(PortMapping {
                external: self.0,
                internal_port: local_port,
                lifetime: Duration::from_secs(60),
            }))
        }

        async fn release(&self) {}
    }

    async fn prober(config: ProberConfig) -> PathProber {
        let udp = Arc::new(UdpTransport::bind(UdpConfig::loopback()).await.unwrap());
        PathProber::new(config, udp, Arc::new(StunTracker::new()))
    }

    #[tokio::test]
    async fn test_static_and_loopback_endpoints_without_relays() {
        let config = ProberConfig {
            static_endpoints: vec!["192.0.2.10:41641".parse().unwrap()],
            include_loopback: true,
            ..ProberConfig::default()
        };
        let prober = prober(config).await;
        let out = prober.determine_endpoints(&RelayMap::default()).await;

        assert!(!out.report.udp);
        let local = SocketAddr::new("127.0.0.1".parse().unwrap(), prober.udp.local_port());
        assert_eq!(
            out.endpoints,
            vec![
                Endpoint::new(local, EndpointKind::Local),
                Endpoint::new("192.0.2.10:41641".parse().unwrap(), EndpointKind::Static),
            ]
        );
    }

    #[tokio::test]
    async fn test_port_mapping_comes_first() {
        let config = ProberConfig {
            static_endpoints: vec!["192.0.2.10:41641".parse().unwrap()],
            advertise_local: false,
            ..ProberConfig::default()
        };
        let external = SocketAddrV4::new("198.51.100.7".parse().unwrap(), 40000);
        let prober = prober(config).await.with_port_mapper(Arc::new(FixedMapper(external)));
        let out = prober.determine_endpoints(&RelayMap::default()).await;
        assert_eq!(out.endpoints[0], Endpoint::new(external.into(), EndpointKind::PortMapped));
        assert_eq!(out.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_stun_endpoints_add_local_port_variant() {
        let prober = prober(ProberConfig::default()).await;
        let report = NetcheckReport {
            global_v4: Some("203.0.113.5:1000".parse().unwrap()),
            ..NetcheckReport::default()
        };
        let eps = prober.stun_endpoints(&report, 41641);
        assert_eq!(
            eps,
            vec![
                Endpoint::new("203.0.113.5:1000".parse().unwrap(), EndpointKind::Stun),
                Endpoint::new("203.0.113.5:41641".parse().unwrap(), EndpointKind::Stun4LocalPort),
            ]
        );
        assert_eq!(prober.stun_endpoints(&report, 1000).len(), 1);
    }

    #[tokio::test]
    async fn test_restun_delay_in_range() {
        let prober = prober(ProberConfig::default()).await;
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let d = prober.restun_delay(&mut rng);
            assert!(d >= Duration::from_secs(20) && d <= Duration::from_secs(26));
        }
    }
}
