//! Per-peer candidate addresses and the best-address choice.
//!
//! Pure state with no I/O. Every operation is O(candidates of this peer).

use crate::disco::TxId;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Runtime-discovered candidates beyond this count trigger an early prune.
pub const MAX_CANDIDATES: usize = 100;

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    /// Advertised in the network map
    NetworkMap,
    /// Learned from a verified inbound ping
    InboundPing,
    /// Advertised by the peer in a CallMeMaybe
    CallMeMaybe,
}

/// One round-trip measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongSample {
    /// When the pong arrived
    pub at: Instant,
    /// Round-trip time
    pub latency: Duration,
    /// Our address as the peer saw it
    pub reported_src: SocketAddr,
}

/// A UDP address a peer might be reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAddress {
    /// The address
    pub addr: SocketAddr,
    /// How it was first learned
    pub source: CandidateSource,
    /// Position in the advertised endpoint list; `None` when not advertised
    pub index: Option<usize>,
    /// Last discovery ping we sent
    pub last_ping: Option<Instant>,
    /// Last ping received from this address
    pub last_got_ping: Option<Instant>,
    /// Transaction id of that ping, for duplicate detection
    pub last_got_ping_tx: Option<TxId>,
    /// Last CallMeMaybe naming this address; such candidates are never pruned
    pub call_me_maybe_time: Option<Instant>,
    /// Most recent round trips, oldest first
    pub pongs: VecDeque<PongSample>,
}

impl CandidateAddress {
    fn new(addr: SocketAddr, source: CandidateSource) -> Self {
        Self {
            addr,
            source,
            index: None,
            last_ping: None,
            last_got_ping: None,
            last_got_ping_tx: None,
            call_me_maybe_time: None,
            pongs: VecDeque::new(),
        }
    }

    /// Latest pong sample.
    #[must_use]
    pub fn last_pong(&self) -> Option<&PongSample> {
        self.pongs.back()
    }

    /// Whether this candidate may be deleted: not advertised, not granted by
    /// a CallMeMaybe, and no inbound ping within `active_timeout`.
    #[must_use]
    pub fn should_delete(&self, now: Instant, active_timeout: Duration) -> bool {
        if self.call_me_maybe_time.is_some() || self.index.is_some() {
            return false;
        }
        match self.last_got_ping {
            None => true,
            Some(t) => now.saturating_duration_since(t) > active_timeout,
        }
    }
}

/// The preferred direct address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestAddr {
    /// Address
    pub addr: SocketAddr,
    /// Latest measured round trip
    pub latency: Duration,
    /// When it was last confirmed by a pong
    pub confirmed_at: Instant,
    /// Used exclusively until then; `None` means expired
    pub trust_until: Option<Instant>,
}

impl BestAddr {
    /// Whether traffic may go to this address alone.
    #[must_use]
    pub fn is_trusted(&self, now: Instant) -> bool {
        self.trust_until.is_some_and(|t| now < t)
    }
}

/// Path-selection weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preference {
    /// Replace the best only when below `best * hysteresis`
    pub hysteresis: f64,
    /// IPv6 latencies are scaled by this before comparison
    pub ipv6_discount: f64,
}

impl Default for Preference {
    fn default() -> Self {
        Self {
            hysteresis: 0.99,
            ipv6_discount: 0.9,
        }
    }
}

impl Preference {
    fn score(&self, addr: &SocketAddr, latency: Duration) -> f64 {
        let secs = latency.as_secs_f64();
        if addr.is_ipv6() {
            secs * self.ipv6_discount
        } else {
            secs
        }
    }

    /// Whether `(addr, latency)` should replace `best`.
    #[must_use]
    pub fn is_better(&self, addr: &SocketAddr, latency: Duration, best: Option<&BestAddr>) -> bool {
        let Some(best) = best else {
            return true;
        };
        if *addr == best.addr {
            return false;
        }
        self.score(addr, latency) < self.score(&best.addr, best.latency) * self.hysteresis
    }
}

/// Candidate addresses of one peer plus the current best address.
#[derive(Debug, Clone)]
pub struct AddressBook {
    candidates: BTreeMap<SocketAddr, CandidateAddress>,
    best: Option<BestAddr>,
    pong_history: usize,
    active_timeout: Duration,
}

impl AddressBook {
    /// Empty book keeping `pong_history` samples per candidate.
    #[must_use]
    pub fn new(pong_history: usize, active_timeout: Duration) -> Self {
        Self {
            candidates: BTreeMap::new(),
            best: None,
            pong_history: pong_history.max(1),
            active_timeout,
        }
    }

    /// Replace the advertised endpoint list.
    ///
    /// Previously advertised addresses that are no longer listed lose their
    /// index and are deleted unless recently pinged or CallMeMaybe-granted.
    /// Returns the deleted addresses.
    pub fn update_from_network_map(&mut self, endpoints: &[SocketAddr], now: Instant) -> Vec<SocketAddr> {
        for c in self.candidates.values_mut() {
            c.index = None;
        }
        for (i, addr) in endpoints.iter().enumerate() {
            self.candidates
                .entry(*addr)
                .or_insert_with(|| CandidateAddress::new(*addr, CandidateSource::NetworkMap))
                .index
                .get_or_insert(i);
        }
        self.prune(now)
    }

    /// Insert or refresh a candidate seen in a verified inbound ping.
    ///
    /// Returns `true` if `tx_id` repeats the last ping from this address:
    /// a re-delivery that must not be answered again.
    pub fn add_candidate(&mut self, addr: SocketAddr, tx_id: TxId, now: Instant) -> bool {
        if let Some(c) = self.candidates.get_mut(&addr) {
            let duplicate = c.last_got_ping_tx == Some(tx_id);
            c.last_got_ping_tx = Some(tx_id);
            c.last_got_ping = Some(now);
            return duplicate;
        }

        let mut c = CandidateAddress::new(addr, CandidateSource::InboundPing);
        c.last_got_ping = Some(now);
        c.last_got_ping_tx = Some(tx_id);
        self.candidates.insert(addr, c);
        if self.candidates.len() > MAX_CANDIDATES {
            self.prune(now);
        }
        false
    }

    /// Merge the addresses of a CallMeMaybe.
    ///
    /// Earlier CallMeMaybe grants not repeated here are withdrawn. Ping
    /// history of every candidate is cleared so the next round pings all of
    /// them. Returns addresses that weren't known before.
    pub fn handle_call_me_maybe(&mut self, endpoints: &[SocketAddr], now: Instant) -> Vec<SocketAddr> {
        for c in self.candidates.values_mut() {
            c.call_me_maybe_time = None;
        }
        let mut new = Vec::new();
        for addr in endpoints {
            if is_v6_link_local(addr) {
                continue;
            }
            let c = self.candidates.entry(*addr).or_insert_with(|| {
                new.push(*addr);
                CandidateAddress::new(*addr, CandidateSource::CallMeMaybe)
            });
            c.call_me_maybe_time = Some(now);
        }
        self.prune(now);
        for c in self.candidates.values_mut() {
            c.last_ping = None;
        }
        new
    }

    /// Delete every candidate meeting the deletion rule. A deleted best
    /// address is cleared. Returns the deleted addresses.
    pub fn prune(&mut self, now: Instant) -> Vec<SocketAddr> {
        let timeout = self.active_timeout;
        let doomed: Vec<SocketAddr> = self
            .candidates
            .values()
            .filter(|c| c.should_delete(now, timeout))
            .map(|c| c.addr)
            .collect();
        for addr in &doomed {
            self.remove(addr);
        }
        doomed
    }

    /// Remove one candidate.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<CandidateAddress> {
        if self.best.is_some_and(|b| b.addr == *addr) {
            self.best = None;
        }
        self.candidates.remove(addr)
    }

    /// Note a discovery ping sent to `addr`.
    pub fn note_ping_sent(&mut self, addr: &SocketAddr, now: Instant) {
        if let Some(c) = self.candidates.get_mut(addr) {
            c.last_ping = Some(now);
        }
    }

    /// Record a pong from `addr`. Returns `false` if `addr` is no longer a
    /// candidate.
    pub fn record_pong(&mut self, addr: &SocketAddr, sample: PongSample) -> bool {
        let cap = self.pong_history;
        let Some(c) = self.candidates.get_mut(addr) else {
            return false;
        };
        if c.pongs.len() == cap {
            c.pongs.pop_front();
        }
        c.pongs.push_back(sample);
        true
    }

    /// Forget all transport state: best address, ping times, pong history.
    ///
    /// Inbound-ping dedup ids survive only on CallMeMaybe-granted entries.
    pub fn reset(&mut self) {
        self.best = None;
        for c in self.candidates.values_mut() {
            c.last_ping = None;
            c.pongs.clear();
            if c.call_me_maybe_time.is_none() {
                c.last_got_ping_tx = None;
            }
        }
    }

    /// Current best address.
    #[must_use]
    pub fn best(&self) -> Option<&BestAddr> {
        self.best.as_ref()
    }

    /// Replace the best address.
    pub fn set_best(&mut self, best: Option<BestAddr>) {
        self.best = best;
    }

    /// Expire trust in the best address without discarding it.
    pub fn expire_trust(&mut self) {
        if let Some(b) = &mut self.best {
            b.trust_until = None;
        }
    }

    /// Look up a candidate.
    #[must_use]
    pub fn get(&self, addr: &SocketAddr) -> Option<&CandidateAddress> {
        self.candidates.get(addr)
    }

    /// Whether `addr` is a candidate.
    #[must_use]
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.candidates.contains_key(addr)
    }

    /// All candidates in address order.
    pub fn iter(&self) -> impl Iterator<Item = &CandidateAddress> {
        self.candidates.values()
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether there are no candidates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

fn is_v6_link_local(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V6(v6) => (v6.ip().segments()[0] & 0xffc0) == 0xfe80,
        SocketAddr::V4(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE: Duration = Duration::from_secs(45);

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn book() -> AddressBook {
        AddressBook::new(64, ACTIVE)
    }

    fn best(a: &str, ms: u64, now: Instant) -> BestAddr {
        BestAddr {
            addr: addr(a),
            latency: Duration::from_millis(ms),
            confirmed_at: now,
            trust_until: Some(now + Duration::from_millis(6500)),
        }
    }

    #[test]
    fn test_network_map_update_replaces_advertised_set() {
        let now = Instant::now();
        let mut b = book();
        b.update_from_network_map(&[addr("1.2.3.4:1"), addr("1.2.3.4:2")], now);
        assert_eq!(b.len(), 2);
        assert_eq!(b.get(&addr("1.2.3.4:2")).unwrap().index, Some(1));

        let removed = b.update_from_network_map(&[addr("1.2.3.4:2")], now);
        assert_eq!(removed, vec![addr("1.2.3.4:1")]);
        assert_eq!(b.get(&addr("1.2.3.4:2")).unwrap().index, Some(0));
    }

    #[test]
    fn test_recently_pinged_survives_network_map_removal() {
        let now = Instant::now();
        let mut b = book();
        b.update_from_network_map(&[addr("1.2.3.4:1")], now);
        b.add_candidate(addr("1.2.3.4:1"), [1; 12], now);
        assert!(b.update_from_network_map(&[], now).is_empty());
        assert!(b.get(&addr("1.2.3.4:1")).unwrap().index.is_none());
    }

    #[test]
    fn test_duplicate_ping_detected() {
        let now = Instant::now();
        let mut b = book();
        assert!(!b.add_candidate(addr("5.6.7.8:9"), [1; 12], now));
        assert!(b.add_candidate(addr("5.6.7.8:9"), [1; 12], now));
        assert_eq!(b.len(), 1);
        assert!(!b.add_candidate(addr("5.6.7.8:9"), [2; 12], now));
        assert_eq!(b.get(&addr("5.6.7.8:9")).unwrap().source, CandidateSource::InboundPing);
    }

    #[test]
    fn test_prune_after_session_timeout() {
        let start = Instant::now();
        let mut b = book();
        b.add_candidate(addr("5.6.7.8:9"), [1; 12], start);
        assert!(b.prune(start + Duration::from_secs(44)).is_empty());
        assert_eq!(b.prune(start + Duration::from_secs(46)), vec![addr("5.6.7.8:9")]);
    }

    #[test]
    fn test_call_me_maybe_entries_never_pruned() {
        let start = Instant::now();
        let mut b = book();
        let new = b.handle_call_me_maybe(&[addr("9.9.9.9:1"), addr("[fe80::1]:1")], start);
        assert_eq!(new, vec![addr("9.9.9.9:1")]);
        assert!(b.prune(start + Duration::from_secs(3600)).is_empty());
        assert_eq!(b.len(), 1);

        // A later CallMeMaybe without it withdraws the grant.
        b.handle_call_me_maybe(&[], start + Duration::from_secs(3600));
        assert!(b.is_empty());
    }

    #[test]
    fn test_call_me_maybe_clears_ping_times() {
        let now = Instant::now();
        let mut b = book();
        b.update_from_network_map(&[addr("1.2.3.4:1")], now);
        b.note_ping_sent(&addr("1.2.3.4:1"), now);
        b.handle_call_me_maybe(&[addr("1.2.3.4:1")], now);
        assert!(b.get(&addr("1.2.3.4:1")).unwrap().last_ping.is_none());
    }

    #[test]
    fn test_reset_keeps_dedup_for_call_me_maybe_entries() {
        let now = Instant::now();
        let mut b = book();
        b.add_candidate(addr("1.1.1.1:1"), [1; 12], now);
        b.handle_call_me_maybe(&[addr("2.2.2.2:2")], now);
        b.add_candidate(addr("2.2.2.2:2"), [2; 12], now);
        b.set_best(Some(best("1.1.1.1:1", 10, now)));
        b.record_pong(
            &addr("1.1.1.1:1"),
            PongSample {
                at: now,
                latency: Duration::from_millis(10),
                reported_src: addr("7.7.7.7:7"),
            },
        );

        b.reset();
        assert!(b.best().is_none());
        assert!(b.get(&addr("1.1.1.1:1")).unwrap().pongs.is_empty());
        assert!(b.get(&addr("1.1.1.1:1")).unwrap().last_got_ping_tx.is_none());
        assert_eq!(b.get(&addr("2.2.2.2:2")).unwrap().last_got_ping_tx, Some([2; 12]));
    }

    #[test]
    fn test_pong_history_bounded() {
        let now = Instant::now();
        let mut b = AddressBook::new(3, ACTIVE);
        b.update_from_network_map(&[addr("1.2.3.4:1")], now);
        for ms in 0..5 {
            b.record_pong(
                &addr("1.2.3.4:1"),
                PongSample {
                    at: now,
                    latency: Duration::from_millis(ms),
                    reported_src: addr("7.7.7.7:7"),
                },
            );
        }
        let c = b.get(&addr("1.2.3.4:1")).unwrap();
        assert_eq!(c.pongs.len(), 3);
        assert_eq!(c.last_pong().unwrap().latency, Duration::from_millis(4));
        assert!(!b.record_pong(
            &addr("4.4.4.4:4"),
            PongSample {
                at: now,
                latency: Duration::ZERO,
                reported_src: addr("7.7.7.7:7"),
            }
        ));
    }

    #[test]
    fn test_removing_best_clears_it() {
        let now = Instant::now();
        let mut b = book();
        b.update_from_network_map(&[addr("1.2.3.4:1")], now);
        b.set_best(Some(best("1.2.3.4:1", 10, now)));
        b.update_from_network_map(&[], now);
        assert!(b.best().is_none());
    }

    #[test]
    fn test_preference_hysteresis() {
        let now = Instant::now();
        let pref = Preference::default();
        let current = best("1.1.1.1:1", 50, now);
        assert!(!pref.is_better(&addr("2.2.2.2:2"), Duration::from_micros(49_800), Some(&current)));
        assert!(pref.is_better(&addr("2.2.2.2:2"), Duration::from_micros(49_000), Some(&current)));
        assert!(!pref.is_better(&addr("1.1.1.1:1"), Duration::from_millis(1), Some(&current)));
        assert!(pref.is_better(&addr("2.2.2.2:2"), Duration::from_secs(9), None));
    }

    #[test]
    fn test_preference_ipv6_discount() {
        let now = Instant::now();
        let pref = Preference::default();
        let v4 = best("1.1.1.1:1", 50, now);
        // 54ms * 0.9 = 48.6ms < 49.5ms
        assert!(pref.is_better(&addr("[2001:db8::1]:1"), Duration::from_millis(54), Some(&v4)));
        let v6 = best("[2001:db8::1]:1", 50, now);
        // 45ms > 45ms * 0.99
        assert!(!pref.is_better(&addr("1.1.1.1:1"), Duration::from_millis(45), Some(&v6)));
    }

    #[test]
    fn test_trust() {
        let now = Instant::now();
        let mut b = book();
        b.update_from_network_map(&[addr("1.2.3.4:1")], now);
        b.set_best(Some(best("1.2.3.4:1", 10, now)));
        assert!(b.best().unwrap().is_trusted(now));
        assert!(!b.best().unwrap().is_trusted(now + Duration::from_secs(7)));
        b.expire_trust();
        assert!(!b.best().unwrap().is_trusted(now));
        assert!(b.best().is_some());
    }
}
