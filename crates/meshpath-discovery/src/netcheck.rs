//! Network check: STUN every relay region from the engine's own sockets.
//!
//! The report gives the public IPv4/IPv6 mapping, the per-region STUN
//! latency used to pick a home relay, and whether the NAT maps each
//! destination to a different port.

use crate::relay::map::{RegionId, RelayMap};
use crate::stun::{StunError, StunMessage, StunTracker};
use meshpath_transport::UdpTransport;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Result of one network check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetcheckReport {
    /// At least one STUN reply came back
    pub udp: bool,
    /// Public IPv4 mapping
    pub global_v4: Option<SocketAddr>,
    /// Public IPv6 mapping
    pub global_v6: Option<SocketAddr>,
    /// `Some(true)` if different servers saw different IPv4 mappings
    pub mapping_varies_by_dest: Option<bool>,
    /// Best STUN latency per region
    pub region_latency: BTreeMap<RegionId, Duration>,
    /// Region with the lowest latency
    pub preferred_region: Option<RegionId>,
}

/// One STUN answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunResult {
    /// Region probed
    pub region: RegionId,
    /// Server probed
    pub server: SocketAddr,
    /// Our address as the server saw it
    pub mapped: SocketAddr,
    /// Round trip
    pub latency: Duration,
}

impl NetcheckReport {
    /// Fold probe results into a report.
    #[must_use]
    pub fn from_results(results: &[StunResult]) -> Self {
        let mut report = Self {
            udp: !results.is_empty(),
            ..Self::default()
        };
        let mut v4_mappings = Vec::new();
        for r in results {
            report
                .region_latency
                .entry(r.region)
                .and_modify(|l| *l = (*l).min(r.latency))
                .or_insert(r.latency);
            if r.mapped.is_ipv4() {
                report.global_v4.get_or_insert(r.mapped);
                v4_mappings.push(r.mapped);
            } else {
                report.global_v6.get_or_insert(r.mapped);
            }
        }
        if v4_mappings.len() >= 2 {
            report.mapping_varies_by_dest = Some(v4_mappings.iter().any(|m| *m != v4_mappings[0]));
        }
        report.preferred_region = report
            .region_latency
            .iter()
            .min_by_key(|(id, l)| (**l, **id))
            .map(|(id, _)| *id);
        report
    }
}

/// Runs STUN probes through the engine's UDP transport.
#[derive(Debug, Clone)]
pub struct Netcheck {
    udp: Arc<UdpTransport>,
    tracker: Arc<StunTracker>,
    timeout: Duration,
}

impl Netcheck {
    /// Create a checker. Replies must be routed into `tracker` by the socket
    /// readers.
    #[must_use]
    pub fn new(udp: Arc<UdpTransport>, tracker: Arc<StunTracker>, timeout: Duration) -> Self {
        Self {
            udp,
            tracker,
            timeout,
        }
    }

    /// Send one Binding request to `server` and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`StunError::Timeout`] if nothing matching arrives in time, or
    /// the send error.
    pub async fn probe(&self, server: SocketAddr) -> Result<(SocketAddr, Duration), StunError> {
        let req = StunMessage::binding_request()?;
        let tx_id = req.transaction_id;
        let rx = self.tracker.register(tx_id);
        let start = Instant::now();
        if let Err(e) = self.udp.send(server, &[req.encode()]).await {
            self.tracker.cancel(&tx_id);
            return Err(e.into());
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok((reply.mapped, reply.received_at.saturating_duration_since(start))),
            _ => {
                self.tracker.cancel(&tx_id);
                Err(StunError::Timeout)
            }
        }
    }

    /// Probe the STUN server of every node in `map` concurrently.
    pub async fn run(&self, map: &RelayMap) -> NetcheckReport {
        let mut set = JoinSet::new();
        for region in map.regions.values() {
            for node in &region.nodes {
                let Some(target) = node.stun_target() else {
                    continue;
                };
                let this = self.clone();
                let region = region.id;
                set.spawn(async move { this.probe_target(region, &target).await });
            }
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(found) = joined {
                results.extend(found);
            }
        }
        let report = NetcheckReport::from_results(&results);
        tracing::debug!(
            "netcheck: udp={} v4={:?} v6={:?} varies={:?} preferred={:?}",
            report.udp,
            report.global_v4,
            report.global_v6,
            report.mapping_varies_by_dest,
            report.preferred_region
        );
        report
    }

    async fn probe_target(&self, region: RegionId, target: &str) -> Vec<StunResult> {
        let addrs = match tokio::net::lookup_host(target).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                tracing::debug!("netcheck: resolving {target}: {e}");
                return Vec::new();
            }
        };
        let v4 = addrs.iter().find(|a| a.is_ipv4()).copied();
        let v6 = addrs
            .iter()
            .find(|a| a.is_ipv6())
            .copied()
            .filter(|_| self.udp.has_v6());

        let mut out = Vec::new();
        for server in [v4, v6].into_iter().flatten() {
            match self.probe(server).await {
                Ok((mapped, latency)) => out.push(StunResult {
                    region,
                    server,
                    mapped,
                    latency,
                }),
                Err(e) => tracing::trace!("netcheck: region {region} {server}: {e}"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(region: RegionId, mapped: &str, ms: u64) -> StunResult {
        StunResult {
            region,
            server: "192.0.2.1:3478".parse().unwrap(),
            mapped: mapped.parse().unwrap(),
            latency: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_report_from_results() {
        let report = NetcheckReport::from_results(&[
            result(1, "203.0.113.5:41641", 40),
            result(2, "203.0.113.5:41641", 12),
            result(2, "[2001:db8::5]:41641", 15),
            result(1, "203.0.113.5:41641", 30),
        ]);
        assert!(report.udp);
        assert_eq!(report.global_v4, Some("203.0.113.5:41641".parse().unwrap()));
        assert_eq!(report.global_v6, Some("[2001:db8::5]:41641".parse().unwrap()));
        assert_eq!(report.mapping_varies_by_dest, Some(false));
        assert_eq!(report.region_latency[&1], Duration::from_millis(30));
        assert_eq!(report.preferred_region, Some(2));
    }

    #[test]
    fn test_symmetric_nat_detected() {
        let report = NetcheckReport::from_results(&[
            result(1, "203.0.113.5:1000", 10),
            result(2, "203.0.113.5:2000", 10),
        ]);
        assert_eq!(report.mapping_varies_by_dest, Some(true));
        assert_eq!(report.preferred_region, Some(1));
    }

    #[test]
    fn test_empty_report() {
        let report = NetcheckReport::from_results(&[]);
        assert!(!report.udp);
        assert_eq!(report.mapping_varies_by_dest, None);
        assert_eq!(report.preferred_region, None);
    }

    #[tokio::test]
    async fn test_probe_against_loopback_responder() {
        use meshpath_transport::UdpConfig;

        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let req = StunMessage::decode(&buf[..n]).unwrap();
            let resp = StunMessage::binding_response(req.transaction_id, from);
            server.send_to(&resp.encode(), from).await.unwrap();
        });

        let udp = Arc::new(UdpTransport::bind(UdpConfig::loopback()).await.unwrap());
        let tracker = Arc::new(StunTracker::new());
        let reader = {
            let udp = Arc::clone(&udp);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                let (n, _) = udp
                    .recv_from(meshpath_transport::Family::V4, &mut buf)
                    .await
                    .unwrap();
                tracker.handle_packet(&buf[..n], Instant::now());
            })
        };

        let check = Netcheck::new(Arc::clone(&udp), tracker, Duration::from_secs(2));
        let (mapped, _) = check.probe(server_addr).await.unwrap();
        assert_eq!(mapped.port(), udp.local_port());
        reader.await.unwrap();
    }
}
