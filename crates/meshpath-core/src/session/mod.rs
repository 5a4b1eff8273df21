//! PeerSession: path selection for one remote peer.
//!
//! Sessions never touch sockets or clocks. Every method takes `now` and
//! returns what should go on the wire; the engine performs the I/O after
//! releasing its lock. A session is in any combination of these states:
//!
//! - no address yet: no best address, traffic goes through the relay
//! - trusted direct: a best address confirmed within the trust window
//! - stale direct: a best address whose trust expired; traffic is mirrored
//!   to the relay until a pong reconfirms it
//! - relay-only: no candidates at all

pub mod events;
pub mod policy;

use crate::addrbook::{AddressBook, BestAddr, PongSample, Preference};
use crate::config::DiscoConfig;
use crate::disco::TxId;
use crate::engine::status::{CandidateStatus, PeerPath, PeerStatus};
use events::{EventRing, PeerEvent, PeerEventKind};
use meshpath_crypto::{DiscoPublicKey, NodePublicKey};
use meshpath_discovery::relay::RegionId;
use policy::{DiscoPolicy, PathView, SendProbe};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Last relay region the peer was heard through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRoute {
    /// Region
    pub region: RegionId,
    /// When a packet last arrived through it
    pub seen_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct SentPing {
    to: SocketAddr,
    at: Instant,
}

/// A ping the engine should send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRequest {
    /// Transaction id
    pub tx_id: TxId,
    /// Destination
    pub to: SocketAddr,
}

/// Discovery traffic produced by a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionActions {
    /// Pings to send directly
    pub pings: Vec<PingRequest>,
    /// Send our endpoints via this relay region
    pub call_me_maybe: Option<RegionId>,
}

impl SessionActions {
    /// Whether there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pings.is_empty() && self.call_me_maybe.is_none()
    }
}

/// Where a data send should go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendPlan {
    /// Direct copy
    pub udp: Option<SocketAddr>,
    /// Relay copy
    pub relay: Option<RegionId>,
    /// Discovery traffic to send first
    pub actions: SessionActions,
    /// Candidates pruned while planning
    pub removed: Vec<SocketAddr>,
}

impl SendPlan {
    /// Whether the plan reaches the peer at all.
    #[must_use]
    pub fn has_path(&self) -> bool {
        self.udp.is_some() || self.relay.is_some()
    }
}

/// Result of a matched pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongOutcome {
    /// Address the ping went to
    pub addr: SocketAddr,
    /// Measured round trip
    pub latency: Duration,
    /// Whether `addr` became the best address
    pub promoted: bool,
}

/// A ping that went unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingTimeout {
    /// Destination
    pub addr: SocketAddr,
    /// Whether it probed the trusted best address
    pub on_trusted_path: bool,
}

/// Result of [`PeerSession::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Discovery traffic
    pub actions: SessionActions,
    /// Pings abandoned in this tick
    pub timeouts: Vec<PingTimeout>,
    /// Candidates pruned
    pub removed: Vec<SocketAddr>,
}

/// Result of a network map update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkMapChange {
    /// Candidates removed
    pub removed: Vec<SocketAddr>,
    /// Previous disco key, if it changed
    pub rotated_from: Option<Option<DiscoPublicKey>>,
}

/// State of one remote peer.
#[derive(Debug)]
pub struct PeerSession {
    node_key: NodePublicKey,
    disco_key: Option<DiscoPublicKey>,
    home_region: Option<RegionId>,
    relay_route: Option<RelayRoute>,
    fixed_endpoint: bool,
    book: AddressBook,
    pending: HashMap<TxId, SentPing>,
    last_send: Option<Instant>,
    last_full_ping: Option<Instant>,
    last_call_me_maybe: Option<Instant>,
    heartbeat_at: Option<Instant>,
    events: EventRing,
    config: Arc<DiscoConfig>,
    policy: Arc<dyn DiscoPolicy>,
    preference: Preference,
}

impl PeerSession {
    /// New session with no addresses.
    #[must_use]
    pub fn new(
        node_key: NodePublicKey,
        config: Arc<DiscoConfig>,
        policy: Arc<dyn DiscoPolicy>,
        event_capacity: usize,
    ) -> Self {
        Self {
            node_key,
            disco_key: None,
            home_region: None,
            relay_route: None,
            fixed_endpoint: false,
            book: AddressBook::new(config.pong_history, config.session_active_timeout),
            pending: HashMap::new(),
            last_send: None,
            last_full_ping: None,
            last_call_me_maybe: None,
            heartbeat_at: None,
            events: EventRing::new(event_capacity),
            preference: Preference {
                hysteresis: config.hysteresis,
                ipv6_discount: config.ipv6_discount,
            },
            config,
            policy,
        }
    }

    /// Peer identity.
    #[must_use]
    pub fn node_key(&self) -> NodePublicKey {
        self.node_key
    }

    /// Current disco key.
    #[must_use]
    pub fn disco_key(&self) -> Option<DiscoPublicKey> {
        self.disco_key
    }

    /// Peer's home relay region.
    #[must_use]
    pub fn home_region(&self) -> Option<RegionId> {
        self.home_region
    }

    /// Last relay region the peer was heard through.
    #[must_use]
    pub fn relay_route(&self) -> Option<RelayRoute> {
        self.relay_route
    }

    /// Candidate addresses.
    #[must_use]
    pub fn book(&self) -> &AddressBook {
        &self.book
    }

    /// Recent events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<PeerEvent> {
        self.events.to_vec()
    }

    /// Outstanding pings.
    #[must_use]
    pub fn pending_pings(&self) -> usize {
        self.pending.len()
    }

    /// Last data send.
    #[must_use]
    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    /// Whether data was sent within the session activity timeout.
    #[must_use]
    pub fn is_active(&self, now: Instant) -> bool {
        self.last_send
            .is_some_and(|t| now.saturating_duration_since(t) <= self.config.session_active_timeout)
    }

    /// Relay regions to try for this peer, best first: the route the peer
    /// was last heard through, then its home region.
    #[must_use]
    pub fn relay_regions(&self) -> [Option<RegionId>; 2] {
        let route = self.relay_route.map(|r| r.region);
        let home = self.home_region.filter(|h| Some(*h) != route);
        [route, home]
    }

    /// Mark the peer as reachable only at its one advertised endpoint. Its
    /// confirmed path is then trusted for the long window.
    pub fn set_fixed_endpoint(&mut self, fixed: bool) {
        self.fixed_endpoint = fixed;
    }

    /// Apply this peer's network map entry.
    ///
    /// A changed disco key resets all transport state.
    pub fn update_from_network_map(
        &mut self,
        disco_key: Option<DiscoPublicKey>,
        endpoints: &[SocketAddr],
        home_region: Option<RegionId>,
        now: Instant,
    ) -> NetworkMapChange {
        let mut change = NetworkMapChange::default();
        if disco_key != self.disco_key {
            let old = self.disco_key;
            if old.is_some() {
                tracing::debug!(
                    "peer {} rotated disco key, resetting paths",
                    self.node_key.fmt_short()
                );
                self.reset_transport();
            }
            self.disco_key = disco_key;
            self.events.push(now, PeerEventKind::DiscoKeyRotated { from: old, to: disco_key });
            change.rotated_from = Some(old);
        }
        self.home_region = home_region;
        change.removed = self.book.update_from_network_map(endpoints, now);
        change
    }

    /// Plan a data send.
    ///
    /// `relay` is the reachable relay region for this peer, if any. Trusted
    /// direct paths carry the data alone; otherwise the relay gets a copy and
    /// a ping round starts.
    pub fn send_plan<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        relay: Option<RegionId>,
        rng: &mut R,
    ) -> SendPlan {
        let mut plan = SendPlan {
            removed: self.book.prune(now),
            ..SendPlan::default()
        };

        let view = PathView {
            best: self.book.best(),
            last_full_ping: self.last_full_ping,
        };
        let probe = self.policy.on_send(&view, now, &self.config);
        let best = self.book.best().copied();

        plan.udp = best.map(|b| b.addr);
        if !best.is_some_and(|b| b.is_trusted(now)) {
            plan.relay = relay;
        }
        match (probe, best) {
            (SendProbe::FullRound, _) => {
                plan.removed.extend(self.ping_all(now, relay, rng, true, &mut plan.actions));
            }
            (SendProbe::PingBest, Some(b)) => {
                if self.ping_due(&b.addr, now) {
                    self.start_ping(b.addr, now, rng, &mut plan.actions);
                }
            }
            _ => {}
        }
        self.note_active(now);
        plan
    }

    /// Record a verified inbound ping from `src`. Returns `true` for a
    /// re-delivered ping that must be dropped.
    pub fn handle_ping(&mut self, src: SocketAddr, tx_id: TxId, now: Instant) -> bool {
        self.book.add_candidate(src, tx_id, now)
    }

    /// Match a pong against an outstanding ping.
    ///
    /// `from` is the address the pong arrived from, `None` when it came over
    /// a relay. Returns `None` for unknown transactions or a pong from an
    /// address other than the one pinged.
    pub fn handle_pong(
        &mut self,
        tx_id: &TxId,
        from: Option<SocketAddr>,
        reported_src: SocketAddr,
        now: Instant,
    ) -> Option<PongOutcome> {
        let sent = *self.pending.get(tx_id)?;
        if from != Some(sent.to) {
            return None;
        }
        self.pending.remove(tx_id);

        let latency = now.saturating_duration_since(sent.at);
        let mut outcome = PongOutcome {
            addr: sent.to,
            latency,
            promoted: false,
        };
        let sample = PongSample {
            at: now,
            latency,
            reported_src,
        };
        if !self.book.record_pong(&sent.to, sample) {
            return Some(outcome);
        }

        let old = self.book.best().copied();
        let trust = if self.fixed_endpoint && self.book.len() == 1 {
            self.config.trust_single_candidate_duration
        } else {
            self.config.trust_udp_addr_duration
        };
        if self.preference.is_better(&sent.to, latency, old.as_ref()) {
            outcome.promoted = true;
        }
        if outcome.promoted || old.is_some_and(|b| b.addr == sent.to) {
            self.book.set_best(Some(BestAddr {
                addr: sent.to,
                latency,
                confirmed_at: now,
                trust_until: Some(now + trust),
            }));
        }
        if outcome.promoted {
            tracing::debug!(
                "peer {} best address {} ({latency:?})",
                self.node_key.fmt_short(),
                sent.to
            );
            self.events.push(
                now,
                PeerEventKind::BestAddrChanged {
                    from: old.map(|b| b.addr),
                    to: Some(sent.to),
                    latency: Some(latency),
                },
            );
        }
        Some(outcome)
    }

    /// Merge a CallMeMaybe received over a relay and ping every candidate.
    pub fn handle_call_me_maybe<R: Rng + ?Sized>(
        &mut self,
        endpoints: &[SocketAddr],
        now: Instant,
        relay: Option<RegionId>,
        rng: &mut R,
    ) -> (SessionActions, Vec<SocketAddr>) {
        let new = self.book.handle_call_me_maybe(endpoints, now);
        tracing::debug!(
            "peer {} call-me-maybe: {} endpoints, {} new",
            self.node_key.fmt_short(),
            endpoints.len(),
            new.len()
        );
        self.events.push(
            now,
            PeerEventKind::CallMeMaybeReceived {
                endpoints: endpoints.len(),
            },
        );
        let mut actions = SessionActions::default();
        let removed = self.ping_all(now, relay, rng, false, &mut actions);
        (actions, removed)
    }

    /// Remember that the peer was heard through `region`.
    pub fn note_relay_route(&mut self, region: RegionId, now: Instant) {
        self.relay_route = Some(RelayRoute { region, seen_at: now });
    }

    /// Forget the relay route through `region`.
    pub fn clear_relay_route(&mut self, region: RegionId) {
        if self.relay_route.is_some_and(|r| r.region == region) {
            self.relay_route = None;
        }
    }

    /// Local network changed: stop trusting the best address. The next send
    /// mirrors to the relay and re-probes.
    pub fn note_connectivity_change(&mut self, now: Instant) {
        self.book.expire_trust();
        self.events.push(now, PeerEventKind::ConnectivityChange);
    }

    /// Cancel pings and clear all transport state.
    pub fn stop_and_reset(&mut self, now: Instant) {
        self.reset_transport();
        self.heartbeat_at = None;
        self.events.push(now, PeerEventKind::Reset);
    }

    fn reset_transport(&mut self) {
        self.book.reset();
        self.pending.clear();
        self.last_send = None;
        self.last_full_ping = None;
        self.last_call_me_maybe = None;
    }

    /// Run due timers: ping timeouts, heartbeat, pruning.
    pub fn tick<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        relay: Option<RegionId>,
        rng: &mut R,
    ) -> TickOutcome {
        let mut out = TickOutcome::default();

        let timeout = self.config.ping_timeout;
        let expired: Vec<TxId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.at) >= timeout)
            .map(|(tx, _)| *tx)
            .collect();
        for tx in expired {
            let Some(sent) = self.pending.remove(&tx) else {
                continue;
            };
            let on_trusted_path = self
                .book
                .best()
                .is_some_and(|b| b.addr == sent.to && b.is_trusted(now));
            if on_trusted_path {
                // The trusted path stopped answering: mirror to the relay
                // again until a pong reconfirms it.
                self.book.expire_trust();
            }
            self.events.push(now, PeerEventKind::PingTimeout { addr: sent.to });
            out.timeouts.push(PingTimeout {
                addr: sent.to,
                on_trusted_path,
            });
        }

        if self.heartbeat_at.is_some_and(|t| t <= now) {
            self.heartbeat_at = None;
            out.removed.extend(self.heartbeat(now, relay, rng, &mut out.actions));
        }
        out.removed.extend(self.book.prune(now));
        out
    }

    fn heartbeat<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        relay: Option<RegionId>,
        rng: &mut R,
        actions: &mut SessionActions,
    ) -> Vec<SocketAddr> {
        let Some(interval) = self.policy.heartbeat_interval(&self.config) else {
            return Vec::new();
        };
        if !self.is_active(now) {
            return Vec::new();
        }
        if let Some(best) = self.book.best().copied().filter(|_| self.disco_key.is_some()) {
            self.start_ping(best.addr, now, rng, actions);
        }
        let view = PathView {
            best: self.book.best(),
            last_full_ping: self.last_full_ping,
        };
        let removed = if self.policy.want_full_ping(&view, now, &self.config) {
            self.ping_all(now, relay, rng, true, actions)
        } else {
            Vec::new()
        };
        self.heartbeat_at = Some(now + interval);
        removed
    }

    /// Prune candidates. Returns the removed addresses.
    pub fn prune(&mut self, now: Instant) -> Vec<SocketAddr> {
        self.book.prune(now)
    }

    /// Earliest instant at which [`tick`](Self::tick) has work.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        let pings = self
            .pending
            .values()
            .map(|p| p.at + self.config.ping_timeout)
            .min();
        match (pings, self.heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn note_active(&mut self, now: Instant) {
        self.last_send = Some(now);
        if self.heartbeat_at.is_none() {
            if let Some(interval) = self.policy.heartbeat_interval(&self.config) {
                self.heartbeat_at = Some(now + interval);
            }
        }
    }

    fn ping_due(&self, addr: &SocketAddr, now: Instant) -> bool {
        self.book
            .get(addr)
            .and_then(|c| c.last_ping)
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.discover_ping_interval)
    }

    fn ping_all<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        relay: Option<RegionId>,
        rng: &mut R,
        call_me_maybe: bool,
        actions: &mut SessionActions,
    ) -> Vec<SocketAddr> {
        self.last_full_ping = Some(now);
        let removed = self.book.prune(now);
        if self.disco_key.is_none() {
            return removed;
        }

        let due: Vec<SocketAddr> = self
            .book
            .iter()
            .map(|c| c.addr)
            .filter(|a| self.ping_due(a, now))
            .collect();
        for addr in &due {
            self.start_ping(*addr, now, rng, actions);
        }

        let cmm_due = self
            .last_call_me_maybe
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.call_me_maybe_interval);
        // A peer we know no address for can still learn ours.
        if call_me_maybe && cmm_due && (!due.is_empty() || self.book.is_empty()) {
            if let Some(region) = relay {
                self.last_call_me_maybe = Some(now);
                actions.call_me_maybe = Some(region);
            }
        }
        removed
    }

    fn start_ping<R: Rng + ?Sized>(
        &mut self,
        to: SocketAddr,
        now: Instant,
        rng: &mut R,
        actions: &mut SessionActions,
    ) {
        let tx_id: TxId = rng.r#gen();
        self.pending.insert(tx_id, SentPing { to, at: now });
        self.book.note_ping_sent(&to, now);
        actions.pings.push(PingRequest { tx_id, to });
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn status(&self, now: Instant) -> PeerStatus {
        let best = self.book.best();
        let relay_region = self.relay_regions().into_iter().flatten().next();
        let path = match (best, relay_region) {
            (Some(b), _) if b.is_trusted(now) => PeerPath::Direct(b.addr),
            (_, Some(r)) => PeerPath::Relay(r),
            (Some(b), None) => PeerPath::Direct(b.addr),
            (None, None) => PeerPath::None,
        };
        PeerStatus {
            node_key: self.node_key,
            disco_key: self.disco_key,
            path,
            best_addr: best.map(|b| b.addr),
            latency: best.map(|b| b.latency),
            trusted: best.is_some_and(|b| b.is_trusted(now)),
            relay_region,
            home_region: self.home_region,
            last_write: self.last_send,
            active: self.is_active(now),
            pending_pings: self.pending.len(),
            candidates: self
                .book
                .iter()
                .map(|c| CandidateStatus {
                    addr: c.addr,
                    source: c.source,
                    advertised: c.index.is_some(),
                    call_me_maybe: c.call_me_maybe_time.is_some(),
                    latency: c.last_pong().map(|p| p.latency),
                    reported_src: c.last_pong().map(|p| p.reported_src),
                })
                .collect(),
        }
    }
}
