//! Bounded per-peer history of path events.

use meshpath_crypto::DiscoPublicKey;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    /// The best direct address changed
    BestAddrChanged {
        /// Previous best
        from: Option<SocketAddr>,
        /// New best
        to: Option<SocketAddr>,
        /// Latency of the new best
        latency: Option<Duration>,
    },
    /// A ping went unanswered
    PingTimeout {
        /// Where it was sent
        addr: SocketAddr,
    },
    /// The peer asked us to ping it
    CallMeMaybeReceived {
        /// Number of endpoints it advertised
        endpoints: usize,
    },
    /// The network map carried a new disco key
    DiscoKeyRotated {
        /// Previous key
        from: Option<DiscoPublicKey>,
        /// New key
        to: Option<DiscoPublicKey>,
    },
    /// Local connectivity changed; trust expired
    ConnectivityChange,
    /// Transport state was cleared
    Reset,
}

impl fmt::Display for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestAddrChanged { from, to, latency } => {
                let show = |a: &Option<SocketAddr>| a.map_or_else(|| "none".to_string(), |a| a.to_string());
                write!(f, "best {} -> {}", show(from), show(to))?;
                if let Some(l) = latency {
                    write!(f, " ({l:?})")?;
                }
                Ok(())
            }
            Self::PingTimeout { addr } => write!(f, "ping timeout {addr}"),
            Self::CallMeMaybeReceived { endpoints } => {
                write!(f, "call-me-maybe with {endpoints} endpoints")
            }
            Self::DiscoKeyRotated { to, .. } => match to {
                Some(k) => write!(f, "disco key now {}", k.fmt_short()),
                None => write!(f, "disco key removed"),
            },
            Self::ConnectivityChange => write!(f, "connectivity change"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// A timestamped event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// When it happened
    pub at: Instant,
    /// What happened
    pub kind: PeerEventKind,
}

/// Ring buffer keeping the newest `capacity` events.
#[derive(Debug, Clone)]
pub struct EventRing {
    events: VecDeque<PeerEvent>,
    capacity: usize,
}

impl EventRing {
    /// Empty ring.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest event when full.
    pub fn push(&mut self, at: Instant, kind: PeerEventKind) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(PeerEvent { at, kind });
    }

    /// Events, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<PeerEvent> {
        self.events.iter().cloned().collect()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let now = Instant::now();
        let mut ring = EventRing::new(2);
        ring.push(now, PeerEventKind::Reset);
        ring.push(now, PeerEventKind::ConnectivityChange);
        ring.push(
            now,
            PeerEventKind::PingTimeout {
                addr: "1.2.3.4:5".parse().unwrap(),
            },
        );
        let events = ring.to_vec();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, PeerEventKind::ConnectivityChange);
    }

    #[test]
    fn test_display() {
        let kind = PeerEventKind::BestAddrChanged {
            from: None,
            to: Some("1.2.3.4:5".parse().unwrap()),
            latency: None,
        };
        assert_eq!(kind.to_string(), "best none -> 1.2.3.4:5");
    }
}
