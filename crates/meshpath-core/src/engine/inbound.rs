//! Receive paths: UDP readers, the relay dispatcher and disco handling.

use super::{DiscoOut, Engine, Via};
use crate::disco::{CallMeMaybe, DiscoMessage, Ping, Pong, looks_like_disco, sender_key};
use meshpath_crypto::{DiscoPublicKey, NodePublicKey};
use meshpath_discovery::relay::map::MAGIC_RELAY_IP;
use meshpath_discovery::relay::{RegionId, RelayInbound};
use meshpath_transport::{Family, MAX_DATAGRAM_SIZE, PacketKind, TransportError, classify};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Pause after a failed read before retrying.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Where a disco packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscoSource {
    Udp(SocketAddr),
    Relay { region: RegionId, node: NodePublicKey },
}

impl fmt::Display for DiscoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(a) => write!(f, "{a}"),
            Self::Relay { region, node } => write!(f, "relay {region} ({})", node.fmt_short()),
        }
    }
}

impl Engine {
    /// Read one socket family until the engine closes.
    pub(crate) async fn run_udp_reader(self, family: Family) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let result = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                r = self.inner.udp.recv_from(family, &mut buf) => r,
            };
            match result {
                Ok((n, from)) => self.handle_udp_packet(&buf[..n], from).await,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::debug!("{family:?} read error: {e}");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
        tracing::debug!("{family:?} reader stopped");
    }

    async fn handle_udp_packet(&self, packet: &[u8], from: SocketAddr) {
        match classify(packet) {
            PacketKind::Stun => {
                if !self.inner.stun.handle_packet(packet, Instant::now()) {
                    tracing::trace!("unsolicited STUN from {from}");
                }
            }
            PacketKind::Disco => self.handle_disco(packet, DiscoSource::Udp(from)).await,
            PacketKind::Data => {
                let peer = {
                    let st = self.inner.state.lock();
                    st.peers
                        .slot_for_addr(&from)
                        .and_then(|slot| st.peers.get(slot))
                        .map(|s| s.node_key())
                };
                match peer {
                    Some(peer) => {
                        self.inner.stats.data_received_udp();
                        self.deliver(peer, packet.to_vec()).await;
                    }
                    None => {
                        self.inner.stats.data_dropped_unknown();
                        tracing::trace!("dropping {} bytes from unknown {from}", packet.len());
                    }
                }
            }
        }
    }

    /// Dispatch relay traffic until the engine closes.
    pub(crate) async fn run_relay_inbound(self, mut rx: mpsc::Receiver<RelayInbound>) {
        loop {
            let msg = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            match msg {
                RelayInbound::Packet { region, src, data } => {
                    if looks_like_disco(&data) {
                        self.handle_disco(&data, DiscoSource::Relay { region, node: src })
                            .await;
                        continue;
                    }
                    let known = {
                        let mut st = self.inner.state.lock();
                        match st.peers.slot_of(&src) {
                            Some(slot) => {
                                if let Some(s) = st.peers.get_mut(slot) {
                                    s.note_relay_route(region, Instant::now());
                                }
                                true
                            }
                            None => false,
                        }
                    };
                    if known {
                        self.inner.stats.data_received_relay();
                        self.deliver(src, data).await;
                    } else {
                        self.inner.stats.data_dropped_unknown();
                        tracing::trace!("relay {region}: dropping packet from unknown {}", src.fmt_short());
                    }
                }
                RelayInbound::PeerGone { region, peer } => {
                    tracing::debug!("relay {region}: peer {} gone", peer.fmt_short());
                    let mut st = self.inner.state.lock();
                    if let Some(slot) = st.peers.slot_of(&peer) {
                        if let Some(s) = st.peers.get_mut(slot) {
                            s.clear_relay_route(region);
                        }
                    }
                }
            }
        }
        tracing::debug!("relay dispatcher stopped");
    }

    /// Open and route one disco packet. Anything that fails to verify is
    /// dropped silently.
    pub(crate) async fn handle_disco(&self, packet: &[u8], source: DiscoSource) {
        let sender = match sender_key(packet) {
            Ok(k) => k,
            Err(e) => {
                self.inner.stats.disco_dropped();
                tracing::trace!("disco from {source}: {e}");
                return;
            }
        };
        if !self.inner.state.lock().peers.has_disco(&sender) {
            self.inner.stats.disco_dropped();
            tracing::trace!("disco from {source}: unknown key {}", sender.fmt_short());
            return;
        }
        let msg = match self.inner.codec.decode(packet) {
            Ok((_, msg)) => msg,
            Err(e) => {
                self.inner.stats.disco_dropped();
                tracing::trace!("disco from {source}: {e}");
                return;
            }
        };
        self.inner.stats.disco_received();
        if self.inner.config.verbose_disco {
            tracing::debug!("got {} from {} via {source}", msg.kind(), sender.fmt_short());
        }
        match msg {
            DiscoMessage::Ping(ping) => self.handle_ping(sender, ping, source).await,
            DiscoMessage::Pong(pong) => self.handle_pong(sender, &pong, source),
            DiscoMessage::CallMeMaybe(cmm) => self.handle_call_me_maybe(sender, &cmm, source).await,
        }
    }

    async fn handle_ping(&self, sender: DiscoPublicKey, ping: Ping, source: DiscoSource) {
        let now = Instant::now();
        let out = {
            let mut st = self.inner.state.lock();
            let state = &mut *st;
            let uses_sender =
                |slot: &usize| state.peers.get(*slot).is_some_and(|s| s.disco_key() == Some(sender));

            match source {
                DiscoSource::Udp(from) => {
                    let slots = match state
                        .peers
                        .slot_for_addr(&from)
                        .filter(uses_sender)
                        .or_else(|| state.peers.slot_of(&ping.node_key).filter(uses_sender))
                    {
                        Some(slot) => vec![slot],
                        None => state.peers.slots_with_disco(&sender),
                    };
                    let Some(&first) = slots.first() else {
                        return;
                    };
                    let mut duplicate = false;
                    for &slot in &slots {
                        if let Some(s) = state.peers.get_mut(slot) {
                            duplicate |= s.handle_ping(from, ping.tx_id, now);
                        }
                    }
                    if duplicate {
                        tracing::trace!("duplicate ping {} from {from}", hex::encode(ping.tx_id));
                        return;
                    }
                    if slots.len() == 1 {
                        state.peers.set_addr_owner(from, first);
                    }
                    let Some(peer) = state.peers.get(first).map(|s| s.node_key()) else {
                        return;
                    };
                    DiscoOut {
                        via: Via::Udp(from),
                        peer,
                        dst: sender,
                        msg: DiscoMessage::Pong(Pong {
                            tx_id: ping.tx_id,
                            src: from,
                        }),
                    }
                }
                DiscoSource::Relay { region, node } => {
                    let Some(slot) = state.peers.slot_of(&node).filter(uses_sender) else {
                        tracing::trace!("relay ping from {} with mismatched disco key", node.fmt_short());
                        return;
                    };
                    if let Some(s) = state.peers.get_mut(slot) {
                        s.note_relay_route(region, now);
                    }
                    DiscoOut {
                        via: Via::Relay(region),
                        peer: node,
                        dst: sender,
                        msg: DiscoMessage::Pong(Pong {
                            tx_id: ping.tx_id,
                            src: SocketAddr::new(MAGIC_RELAY_IP, region),
                        }),
                    }
                }
            }
        };
        self.transmit_disco(vec![out]).await;
    }

    fn handle_pong(&self, sender: DiscoPublicKey, pong: &Pong, source: DiscoSource) {
        let now = Instant::now();
        let mut st = self.inner.state.lock();
        let state = &mut *st;

        let from = match source {
            DiscoSource::Udp(from) => from,
            DiscoSource::Relay { region, node } => {
                if let Some(slot) = state.peers.slot_of(&node) {
                    if let Some(s) = state.peers.get_mut(slot).filter(|s| s.disco_key() == Some(sender)) {
                        s.note_relay_route(region, now);
                    }
                }
                return;
            }
        };

        for slot in state.peers.slots_with_disco(&sender) {
            let Some(session) = state.peers.get_mut(slot) else {
                continue;
            };
            let Some(outcome) = session.handle_pong(&pong.tx_id, Some(from), pong.src, now) else {
                continue;
            };
            let wake = session.next_wakeup();
            let peer = session.node_key();
            state.peers.set_addr_owner(from, slot);
            if state.timers.schedule(slot, wake) {
                self.inner.timer_wake.notify_one();
            }
            if outcome.promoted {
                tracing::info!(
                    "peer {} now direct via {} ({:?})",
                    peer.fmt_short(),
                    outcome.addr,
                    outcome.latency
                );
            } else {
                tracing::trace!("pong from {from} in {:?}", outcome.latency);
            }
            return;
        }
        tracing::trace!("pong {} from {from} matched no ping", hex::encode(pong.tx_id));
    }

    async fn handle_call_me_maybe(&self, sender: DiscoPublicKey, cmm: &CallMeMaybe, source: DiscoSource) {
        let DiscoSource::Relay { region, node } = source else {
            tracing::trace!("ignoring call-me-maybe over UDP from {source}");
            return;
        };
        let now = Instant::now();
        let mut out = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let state = &mut *st;
            let Some(slot) = state
                .peers
                .slot_of(&node)
                .filter(|s| state.peers.get(*s).is_some_and(|p| p.disco_key() == Some(sender)))
            else {
                return;
            };
            if let Some(s) = state.peers.get_mut(slot) {
                s.note_relay_route(region, now);
            }
            let relay = self.inner.reachable_relay(&state.peers, slot);
            let Some(session) = state.peers.get_mut(slot) else {
                return;
            };
            let (actions, removed) = session.handle_call_me_maybe(&cmm.endpoints, now, relay, &mut state.rng);
            let wake = session.next_wakeup();
            state.peers.forget_addrs(slot, &removed);
            if state.timers.schedule(slot, wake) {
                self.inner.timer_wake.notify_one();
            }
            self.inner.collect_disco(state, slot, &actions, &mut out);
        }
        self.transmit_disco(out).await;
    }
}
