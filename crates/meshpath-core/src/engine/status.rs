//! Status snapshots, health and engine counters.

use crate::addrbook::CandidateSource;
use meshpath_crypto::{DiscoPublicKey, NodePublicKey};
use meshpath_discovery::NetcheckReport;
use meshpath_discovery::endpoints::Endpoint;
use meshpath_discovery::relay::{RegionId, RelayConnStatus, RelayStatsSnapshot};
use meshpath_transport::TransportStatsSnapshot;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// How traffic to a peer currently flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPath {
    /// Direct UDP
    Direct(SocketAddr),
    /// Through a relay region
    Relay(RegionId),
    /// Unreachable
    None,
}

impl fmt::Display for PeerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(a) => write!(f, "direct {a}"),
            Self::Relay(r) => write!(f, "relay {r}"),
            Self::None => write!(f, "none"),
        }
    }
}

/// One candidate address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateStatus {
    /// Address
    pub addr: SocketAddr,
    /// How it was learned
    pub source: CandidateSource,
    /// Listed in the network map
    pub advertised: bool,
    /// Granted by a CallMeMaybe
    pub call_me_maybe: bool,
    /// Latest round trip
    pub latency: Option<Duration>,
    /// Our address as the peer last reported it
    pub reported_src: Option<SocketAddr>,
}

/// Snapshot of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    /// Identity
    pub node_key: NodePublicKey,
    /// Current disco key
    pub disco_key: Option<DiscoPublicKey>,
    /// Where traffic goes
    pub path: PeerPath,
    /// Best direct address, trusted or not
    pub best_addr: Option<SocketAddr>,
    /// Its latency
    pub latency: Option<Duration>,
    /// Whether the best address is inside its trust window
    pub trusted: bool,
    /// Relay region used for this peer
    pub relay_region: Option<RegionId>,
    /// Peer's home region from the network map
    pub home_region: Option<RegionId>,
    /// Last data send
    pub last_write: Option<Instant>,
    /// Whether data was sent recently
    pub active: bool,
    /// Pings awaiting a pong
    pub pending_pings: usize,
    /// Candidate addresses
    pub candidates: Vec<CandidateStatus>,
}

/// Summary of lasting connectivity loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Everything works
    Ok,
    /// No working UDP
    NoUdp,
    /// No relay connection
    NoRelay,
    /// Neither
    NoUdpNoRelay,
    /// No private key
    LoggedOut,
}

impl HealthStatus {
    /// Combine the individual conditions.
    #[must_use]
    pub fn from_flags(logged_in: bool, udp_ok: bool, relay_ok: bool) -> Self {
        match (logged_in, udp_ok, relay_ok) {
            (false, _, _) => Self::LoggedOut,
            (true, true, true) => Self::Ok,
            (true, false, true) => Self::NoUdp,
            (true, true, false) => Self::NoRelay,
            (true, false, false) => Self::NoUdpNoRelay,
        }
    }

    /// Whether this is [`HealthStatus::Ok`].
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::NoUdp => "no UDP",
            Self::NoRelay => "no relay",
            Self::NoUdpNoRelay => "no UDP, no relay",
            Self::LoggedOut => "logged out",
        })
    }
}

/// Engine-level counters. Socket and relay counters live with their
/// transports.
#[derive(Debug, Default)]
pub struct EngineStats {
    disco_sent: AtomicU64,
    disco_received: AtomicU64,
    disco_dropped: AtomicU64,
    data_sent_udp: AtomicU64,
    data_sent_relay: AtomicU64,
    data_received_udp: AtomicU64,
    data_received_relay: AtomicU64,
    data_dropped_unknown: AtomicU64,
    no_transport: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Disco messages sent
    pub disco_sent: u64,
    /// Disco messages accepted
    pub disco_received: u64,
    /// Disco packets dropped: unknown sender, bad box, bad payload
    pub disco_dropped: u64,
    /// Data packets sent directly
    pub data_sent_udp: u64,
    /// Data packets sent through relays
    pub data_sent_relay: u64,
    /// Data packets received directly
    pub data_received_udp: u64,
    /// Data packets received through relays
    pub data_received_relay: u64,
    /// Data packets from unknown sources
    pub data_dropped_unknown: u64,
    /// Sends rejected with no transport
    pub no_transport: u64,
}

impl EngineStats {
    pub(crate) fn disco_sent(&self) {
        self.disco_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn disco_received(&self) {
        self.disco_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn disco_dropped(&self) {
        self.disco_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn data_sent_udp(&self, packets: usize) {
        self.data_sent_udp.fetch_add(packets as u64, Ordering::Relaxed);
    }

    pub(crate) fn data_sent_relay(&self, packets: usize) {
        self.data_sent_relay.fetch_add(packets as u64, Ordering::Relaxed);
    }

    pub(crate) fn data_received_udp(&self) {
        self.data_received_udp.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn data_received_relay(&self) {
        self.data_received_relay.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn data_dropped_unknown(&self) {
        self.data_dropped_unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn no_transport(&self) {
        self.no_transport.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            disco_sent: self.disco_sent.load(Ordering::Relaxed),
            disco_received: self.disco_received.load(Ordering::Relaxed),
            disco_dropped: self.disco_dropped.load(Ordering::Relaxed),
            data_sent_udp: self.data_sent_udp.load(Ordering::Relaxed),
            data_sent_relay: self.data_sent_relay.load(Ordering::Relaxed),
            data_received_udp: self.data_received_udp.load(Ordering::Relaxed),
            data_received_relay: self.data_received_relay.load(Ordering::Relaxed),
            data_dropped_unknown: self.data_dropped_unknown.load(Ordering::Relaxed),
            no_transport: self.no_transport.load(Ordering::Relaxed),
        }
    }
}

/// Everything the engine knows, at one instant.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Overall health
    pub health: HealthStatus,
    /// Our advertised endpoints
    pub endpoints: Vec<Endpoint>,
    /// Our home relay region
    pub home_region: Option<RegionId>,
    /// Relay connections
    pub relays: Vec<RelayConnStatus>,
    /// Latest netcheck
    pub netcheck: Option<NetcheckReport>,
    /// Peers, in node key order
    pub peers: Vec<PeerStatus>,
    /// Engine counters
    pub stats: EngineStatsSnapshot,
    /// UDP socket counters
    pub udp: TransportStatsSnapshot,
    /// Relay counters
    pub relay: RelayStatsSnapshot,
}
