//! The engine: one instance per node.
//!
//! Owns the UDP sockets, the relay transport, the prober and every peer
//! session. All session state sits behind one coarse mutex; socket and relay
//! I/O happens after it is released. Background tasks:
//!
//! - one UDP reader per address family
//! - the relay inbound dispatcher
//! - the timer scheduler driving [`PeerSession::tick`]
//! - the endpoint updater (startup, triggers, periodic re-STUN)
//! - link monitoring and periodic pruning
//!
//! Every task stops on the root cancellation token; [`Engine::close`] waits
//! for all of them.

mod inbound;
mod maintenance;
pub mod peer_map;
pub mod status;
pub mod timers;

use crate::config::{DiscoConfig, EngineConfig};
use crate::disco::{CallMeMaybe, DiscoCodec, DiscoMessage, Ping};
use crate::error::{EngineError, EngineResult};
use crate::netmap::PeerDescriptor;
use crate::session::events::PeerEvent;
use crate::session::policy::{DiscoPolicy, policy_for};
use crate::session::{PeerSession, SessionActions};
use meshpath_crypto::{DiscoPrivateKey, DiscoPublicKey, NodePrivateKey, NodePublicKey, SharedKeyCache};
use meshpath_discovery::endpoints::Endpoint;
use meshpath_discovery::relay::{RegionId, RelayError, RelayInbound, RelayMap, RelayTransport};
use meshpath_discovery::{PathProber, StunTracker};
use meshpath_transport::{Family, TransportError, UdpTransport};
use parking_lot::Mutex;
use peer_map::PeerMap;
use rand::SeedableRng;
use rand::rngs::{OsRng, StdRng};
use status::{EngineStats, EngineStatus, HealthStatus, PeerStatus};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use timers::TimerQueue;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Tunnel packets buffered between the readers and [`Engine::recv`].
const TUNNEL_QUEUE: usize = 1024;

/// Relay packets buffered between relay readers and the dispatcher.
const RELAY_INBOUND_QUEUE: usize = 1024;

/// Most packets returned by one [`Engine::recv`].
pub const MAX_RECV_BATCH: usize = 64;

/// Called with the new endpoint list whenever it changes.
pub type EndpointsCallback = Arc<dyn Fn(&[Endpoint]) + Send + Sync>;

/// Path a disco message leaves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Via {
    Udp(SocketAddr),
    Relay(RegionId),
}

/// A disco message to seal and send after the state lock is released.
#[derive(Debug, Clone)]
pub(crate) struct DiscoOut {
    via: Via,
    peer: NodePublicKey,
    dst: DiscoPublicKey,
    msg: DiscoMessage,
}

struct TunnelQueue {
    rx: mpsc::Receiver<(NodePublicKey, Vec<u8>)>,
    peeked: Option<(NodePublicKey, Vec<u8>)>,
}

/// Everything guarded by the coarse lock.
pub(crate) struct EngineState {
    pub(crate) private_key: Option<NodePrivateKey>,
    pub(crate) node_key: Option<NodePublicKey>,
    pub(crate) peers: PeerMap,
    pub(crate) timers: TimerQueue,
    pub(crate) relay_map: RelayMap,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) notified_endpoints: Option<Vec<Endpoint>>,
    pub(crate) pending_call_me_maybe: HashSet<NodePublicKey>,
    pub(crate) last_activity: Option<Instant>,
    pub(crate) udp_blocked: bool,
    pub(crate) rng: StdRng,
}

/// Engine inner state
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) disco_config: Arc<DiscoConfig>,
    pub(crate) policy: Arc<dyn DiscoPolicy>,
    pub(crate) udp: Arc<UdpTransport>,
    pub(crate) relay: RelayTransport,
    relay_rx: Mutex<Option<mpsc::Receiver<RelayInbound>>>,
    pub(crate) stun: Arc<StunTracker>,
    pub(crate) prober: PathProber,
    pub(crate) codec: DiscoCodec,
    pub(crate) state: Mutex<EngineState>,
    tunnel_tx: mpsc::Sender<(NodePublicKey, Vec<u8>)>,
    tunnel: tokio::sync::Mutex<TunnelQueue>,
    pub(crate) timer_wake: Notify,
    pub(crate) probe_wake: Notify,
    pub(crate) has_private_key: AtomicBool,
    pub(crate) network_up: AtomicBool,
    pub(crate) local_port: AtomicU16,
    running: AtomicBool,
    closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) stats: EngineStats,
    pub(crate) on_endpoints: Mutex<Option<EndpointsCallback>>,
}

/// Peer path engine.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("disco_key", &self.inner.codec.local_key())
            .field("local_port", &self.local_port())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Engine {
    /// Create an engine. Nothing is bound until [`start`](Self::start).
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_INBOUND_QUEUE);
        let relay = RelayTransport::new(config.relay.clone(), relay_tx, &cancel);
        let udp = Arc::new(UdpTransport::new(config.udp.clone()));
        let stun = Arc::new(StunTracker::new());
        let prober = PathProber::new(config.prober.clone(), Arc::clone(&udp), Arc::clone(&stun));
        let codec = DiscoCodec::new(SharedKeyCache::new(DiscoPrivateKey::generate(&mut OsRng)));
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (tunnel_tx, tunnel_rx) = mpsc::channel(TUNNEL_QUEUE);
        let disco_config = Arc::new(config.disco.clone());
        let policy = policy_for(&disco_config);

        tracing::info!(
            "engine created: disco key {}, {} policy",
            codec.local_key().fmt_short(),
            policy.name()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                disco_config,
                policy,
                udp,
                relay,
                relay_rx: Mutex::new(Some(relay_rx)),
                stun,
                prober,
                codec,
                state: Mutex::new(EngineState {
                    private_key: None,
                    node_key: None,
                    peers: PeerMap::new(),
                    timers: TimerQueue::new(),
                    relay_map: RelayMap::default(),
                    endpoints: Vec::new(),
                    notified_endpoints: None,
                    pending_call_me_maybe: HashSet::new(),
                    last_activity: None,
                    udp_blocked: false,
                    rng,
                }),
                tunnel_tx,
                tunnel: tokio::sync::Mutex::new(TunnelQueue {
                    rx: tunnel_rx,
                    peeked: None,
                }),
                timer_wake: Notify::new(),
                probe_wake: Notify::new(),
                has_private_key: AtomicBool::new(false),
                network_up: AtomicBool::new(true),
                local_port: AtomicU16::new(0),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel,
                tasks: Mutex::new(Vec::new()),
                stats: EngineStats::default(),
                on_endpoints: Mutex::new(None),
                config,
            }),
        })
    }

    /// Bind the sockets and start the background tasks. Starting a running
    /// engine does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] after [`close`](Self::close), or the
    /// bind error if no IPv4 socket could be opened.
    pub async fn start(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("engine already running");
            return Ok(());
        }

        let addr = match self.inner.udp.rebind().await {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        self.inner.local_port.store(addr.port(), Ordering::Relaxed);
        tracing::info!("engine listening on {addr}");

        let mut tasks = Vec::new();
        for family in [Family::V4, Family::V6] {
            tasks.push(tokio::spawn(self.clone().run_udp_reader(family)));
        }
        if let Some(rx) = self.inner.relay_rx.lock().take() {
            tasks.push(tokio::spawn(self.clone().run_relay_inbound(rx)));
        }
        tasks.push(tokio::spawn(self.clone().run_timers()));
        tasks.push(tokio::spawn(self.clone().run_endpoint_updater()));
        tasks.push(tokio::spawn(self.clone().run_maintenance()));
        self.inner.tasks.lock().extend(tasks);

        self.inner.probe_wake.notify_one();
        Ok(())
    }

    /// Stop every task, close sockets and relay connections, and wait for
    /// all of it. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("engine closing");
        self.inner.cancel.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("engine task ended abnormally: {e}");
            }
        }
        self.inner.relay.close().await;
        self.inner.prober.close().await;
        self.inner.udp.close().await;

        let now = Instant::now();
        let mut st = self.inner.state.lock();
        let state = &mut *st;
        let slots: Vec<usize> = state.peers.slots().collect();
        for slot in slots {
            if let Some(session) = state.peers.get_mut(slot) {
                session.stop_and_reset(now);
            }
            state.timers.cancel(slot);
        }
        self.inner.running.store(false, Ordering::SeqCst);
        tracing::info!("engine closed");
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether [`start`](Self::start) succeeded and the engine isn't closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.is_closed()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Control Plane
// ═══════════════════════════════════════════════════════════════════════════

impl Engine {
    /// Our disco public key, advertised through the control plane.
    #[must_use]
    pub fn disco_key(&self) -> DiscoPublicKey {
        self.inner.codec.local_key()
    }

    /// Our node public key, if logged in.
    #[must_use]
    pub fn node_key(&self) -> Option<NodePublicKey> {
        self.inner.state.lock().node_key
    }

    /// Current UDP port (0 before start).
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.inner.local_port.load(Ordering::Relaxed)
    }

    /// Local address of `family`'s socket.
    #[must_use]
    pub fn local_addr(&self, family: Family) -> Option<SocketAddr> {
        self.inner.udp.local_addr(family)
    }

    /// Install the node key, or log out with `None`.
    ///
    /// Any change resets every session and reconnects relays under the new
    /// identity.
    pub fn set_private_key(&self, key: Option<NodePrivateKey>) {
        let node = key.as_ref().map(NodePrivateKey::public_key);
        {
            let now = Instant::now();
            let mut st = self.inner.state.lock();
            if st.node_key == node {
                return;
            }
            let state = &mut *st;
            state.private_key = key.clone();
            state.node_key = node;
            let slots: Vec<usize> = state.peers.slots().collect();
            for slot in slots {
                if let Some(session) = state.peers.get_mut(slot) {
                    session.stop_and_reset(now);
                }
                state.timers.cancel(slot);
            }
        }
        self.inner.has_private_key.store(node.is_some(), Ordering::SeqCst);
        self.inner.relay.set_private_key(key);
        match node {
            Some(k) => {
                tracing::info!("node key set: {}", k.fmt_short());
                self.inner.probe_wake.notify_one();
            }
            None => tracing::info!("logged out"),
        }
    }

    /// Apply a network map: add, update and remove peers and install the
    /// relay map.
    ///
    /// Entries with an all-zero node key are skipped. When a node key
    /// appears twice the last entry wins.
    pub fn on_network_map_update(&self, peers: &[PeerDescriptor], relay_map: RelayMap) {
        let now = Instant::now();
        let relay_changed = {
            let mut st = self.inner.state.lock();
            let state = &mut *st;
            let relay_changed = state.relay_map != relay_map;
            state.relay_map = relay_map.clone();

            let mut seen = HashSet::with_capacity(peers.len());
            for desc in peers {
                if desc.node_key.is_zero() {
                    tracing::warn!("network map: skipping peer with zero node key");
                    continue;
                }
                seen.insert(desc.node_key);
                let endpoints = desc.parsed_endpoints();
                let slot = match state.peers.slot_of(&desc.node_key) {
                    Some(slot) => slot,
                    None => {
                        tracing::debug!("network map: new peer {}", desc.node_key.fmt_short());
                        state.peers.insert(PeerSession::new(
                            desc.node_key,
                            Arc::clone(&self.inner.disco_config),
                            Arc::clone(&self.inner.policy),
                            self.inner.config.event_ring_size(),
                        ))
                    }
                };
                let Some(session) = state.peers.get_mut(slot) else {
                    continue;
                };
                session.set_fixed_endpoint(desc.fixed_endpoint);
                let change =
                    session.update_from_network_map(desc.disco_key, &endpoints, desc.home_region(), now);
                let wake = session.next_wakeup();
                if let Some(old) = change.rotated_from {
                    state.peers.reindex_disco(slot, old, desc.disco_key);
                    if let Some(old) = old {
                        self.inner.codec.forget(&old);
                    }
                }
                state.peers.forget_addrs(slot, &change.removed);
                state.timers.schedule(slot, wake);
            }

            let gone: Vec<NodePublicKey> = state
                .peers
                .node_keys()
                .into_iter()
                .filter(|k| !seen.contains(k))
                .collect();
            for key in gone {
                let Some(slot) = state.peers.slot_of(&key) else {
                    continue;
                };
                tracing::debug!("network map: peer {} removed", key.fmt_short());
                if let Some(mut session) = state.peers.remove(slot) {
                    session.stop_and_reset(now);
                    if let Some(d) = session.disco_key() {
                        if !state.peers.has_disco(&d) {
                            self.inner.codec.forget(&d);
                        }
                    }
                }
                state.timers.cancel(slot);
                state.pending_call_me_maybe.remove(&key);
            }
            relay_changed
        };

        if relay_changed {
            self.inner.relay.set_relay_map(relay_map);
            self.inner.probe_wake.notify_one();
        }
        self.inner.timer_wake.notify_one();
    }

    /// Register the endpoints-changed callback. It runs on an engine task,
    /// only when the list actually changes.
    pub fn set_endpoints_callback<F>(&self, callback: F)
    where
        F: Fn(&[Endpoint]) + Send + Sync + 'static,
    {
        *self.inner.on_endpoints.lock() = Some(Arc::new(callback));
    }

    /// Our current endpoints.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.state.lock().endpoints.clone()
    }

    /// Tell the engine whether the network is usable. While down no UDP is
    /// sent and no periodic probing runs.
    pub fn set_network_up(&self, up: bool) {
        if self.inner.network_up.swap(up, Ordering::SeqCst) == up {
            return;
        }
        tracing::info!("network {}", if up { "up" } else { "down" });
        self.note_connectivity_change();
    }

    /// Whether the network is marked up.
    #[must_use]
    pub fn is_network_up(&self) -> bool {
        self.inner.network_up.load(Ordering::SeqCst)
    }

    /// Expire trust in every best address and re-probe our endpoints.
    pub fn note_connectivity_change(&self) {
        let now = Instant::now();
        {
            let mut st = self.inner.state.lock();
            let slots: Vec<usize> = st.peers.slots().collect();
            for slot in slots {
                if let Some(session) = st.peers.get_mut(slot) {
                    session.note_connectivity_change(now);
                }
            }
        }
        self.inner.probe_wake.notify_one();
    }

    /// Reopen the UDP sockets, preferring the current port, then note a
    /// connectivity change.
    ///
    /// # Errors
    ///
    /// Returns the bind error if no IPv4 port could be bound; readers stay
    /// parked on a placeholder socket until a later rebind succeeds.
    pub async fn rebind(&self) -> EngineResult<SocketAddr> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let result = self.inner.udp.rebind().await;
        if let Ok(addr) = &result {
            self.inner.local_port.store(addr.port(), Ordering::Relaxed);
            tracing::info!("rebound to {addr}");
        }
        self.note_connectivity_change();
        result.map_err(EngineError::from)
    }

    /// Run endpoint discovery now and return the result.
    pub async fn update_endpoints(&self) -> Vec<Endpoint> {
        self.update_endpoints_now().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tunnel Side
// ═══════════════════════════════════════════════════════════════════════════

impl Engine {
    /// Send tunnel packets to `peer`.
    ///
    /// Goes direct when a trusted address exists; otherwise the relay gets
    /// a copy and path discovery runs. Per-path failures are absorbed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoTransportAvailable`] if the peer is unknown,
    /// we are logged out, or it has neither a direct address nor a usable
    /// relay; [`EngineError::Closed`] after close.
    pub async fn send(&self, peer: &NodePublicKey, packets: Vec<Vec<u8>>) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if packets.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut disco = Vec::new();
        let plan = {
            let mut st = self.inner.state.lock();
            let state = &mut *st;
            state.last_activity = Some(now);
            let slot = match (state.private_key.is_some(), state.peers.slot_of(peer)) {
                (true, Some(slot)) => slot,
                _ => {
                    self.inner.stats.no_transport();
                    return Err(EngineError::NoTransportAvailable);
                }
            };
            let relay = self.inner.reachable_relay(&state.peers, slot);
            let Some(session) = state.peers.get_mut(slot) else {
                return Err(EngineError::NoTransportAvailable);
            };
            let plan = session.send_plan(now, relay, &mut state.rng);
            let wake = session.next_wakeup();
            state.peers.forget_addrs(slot, &plan.removed);
            if state.timers.schedule(slot, wake) {
                self.inner.timer_wake.notify_one();
            }
            self.inner.collect_disco(state, slot, &plan.actions, &mut disco);
            plan
        };

        self.transmit_disco(disco).await;

        if !plan.has_path() {
            self.inner.stats.no_transport();
            return Err(EngineError::NoTransportAvailable);
        }
        if let Some(addr) = plan.udp.filter(|_| self.is_network_up()) {
            match self.inner.udp.send(addr, &packets).await {
                Ok(()) => self.inner.stats.data_sent_udp(packets.len()),
                Err(TransportError::NoSocket(family)) => {
                    tracing::trace!("no {family} socket for {addr}");
                }
                Err(e) => tracing::debug!("send to {addr} failed: {e}"),
            }
        }
        if let Some(region) = plan.relay {
            let mut sent = 0;
            for packet in packets {
                match self.inner.relay.send(region, *peer, packet) {
                    Ok(()) => sent += 1,
                    Err(RelayError::QueueFull(r)) => {
                        if self.inner.config.verbose_disco {
                            tracing::debug!("relay {r} queue full, dropping packet");
                        }
                    }
                    Err(RelayError::Closed) if self.is_closed() => return Err(EngineError::Closed),
                    Err(e) => tracing::debug!("relay send via {region} failed: {e}"),
                }
            }
            self.inner.stats.data_sent_relay(sent);
        }
        Ok(())
    }

    /// Receive the next batch of tunnel packets, all from one peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the engine is closed.
    pub async fn recv(&self) -> EngineResult<(Vec<Vec<u8>>, NodePublicKey)> {
        let mut q = self.inner.tunnel.lock().await;
        let (peer, first) = match q.peeked.take() {
            Some(p) => p,
            None => {
                tokio::select! {
                    () = self.inner.cancel.cancelled() => return Err(EngineError::Closed),
                    msg = q.rx.recv() => msg.ok_or(EngineError::Closed)?,
                }
            }
        };
        let mut bufs = vec![first];
        while bufs.len() < MAX_RECV_BATCH {
            match q.rx.try_recv() {
                Ok((p, b)) if p == peer => bufs.push(b),
                Ok(other) => {
                    q.peeked = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        Ok((bufs, peer))
    }

    pub(crate) async fn deliver(&self, peer: NodePublicKey, data: Vec<u8>) {
        if self.inner.tunnel_tx.send((peer, data)).await.is_err() {
            tracing::trace!("tunnel queue closed, dropping packet");
        }
    }

    /// Seal and send disco messages. Failures are logged and dropped.
    pub(crate) async fn transmit_disco(&self, out: Vec<DiscoOut>) {
        for o in out {
            let packet = match self.inner.codec.encode(&o.dst, &o.msg) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!("sealing {} failed: {e}", o.msg.kind());
                    continue;
                }
            };
            let sent = match o.via {
                Via::Udp(addr) => {
                    if !self.is_network_up() {
                        continue;
                    }
                    match self.inner.udp.send(addr, std::slice::from_ref(&packet)).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::trace!("{} to {addr} failed: {e}", o.msg.kind());
                            false
                        }
                    }
                }
                Via::Relay(region) => match self.inner.relay.send(region, o.peer, packet) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::trace!("{} via relay {region} failed: {e}", o.msg.kind());
                        false
                    }
                },
            };
            if sent {
                self.inner.stats.disco_sent();
                tracing::trace!(
                    "sent {} to {} via {:?}",
                    o.msg.kind(),
                    o.peer.fmt_short(),
                    o.via
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════

impl Engine {
    /// Status of one peer.
    #[must_use]
    pub fn peer_status(&self, peer: &NodePublicKey) -> Option<PeerStatus> {
        let now = Instant::now();
        let st = self.inner.state.lock();
        let slot = st.peers.slot_of(peer)?;
        st.peers.get(slot).map(|s| s.status(now))
    }

    /// Recent events of one peer, oldest first.
    #[must_use]
    pub fn peer_events(&self, peer: &NodePublicKey) -> Vec<PeerEvent> {
        let st = self.inner.state.lock();
        st.peers
            .slot_of(peer)
            .and_then(|slot| st.peers.get(slot))
            .map(PeerSession::events)
            .unwrap_or_default()
    }

    /// Overall health.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        let udp_blocked = self.inner.state.lock().udp_blocked;
        HealthStatus::from_flags(
            self.inner.has_private_key.load(Ordering::SeqCst),
            self.is_network_up() && self.inner.udp.has_v4() && !udp_blocked,
            self.inner.relay.any_connected(),
        )
    }

    /// Full snapshot.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let now = Instant::now();
        let health = self.health();
        let (mut peers, endpoints) = {
            let st = self.inner.state.lock();
            let peers: Vec<PeerStatus> = st.peers.iter().map(|(_, s)| s.status(now)).collect();
            (peers, st.endpoints.clone())
        };
        peers.sort_by_key(|p| p.node_key);
        EngineStatus {
            health,
            endpoints,
            home_region: self.inner.relay.home(),
            relays: self.inner.relay.connections(),
            netcheck: self.inner.prober.last_report(),
            peers,
            stats: self.inner.stats.snapshot(),
            udp: self.inner.udp.stats(),
            relay: self.inner.relay.stats(),
        }
    }
}

impl EngineInner {
    /// First relay region of the peer in `slot` that can carry traffic.
    pub(crate) fn reachable_relay(&self, peers: &PeerMap, slot: usize) -> Option<RegionId> {
        let session = peers.get(slot)?;
        session
            .relay_regions()
            .into_iter()
            .flatten()
            .find(|r| self.relay.can_reach(*r))
    }

    /// Turn session actions into disco messages. A CallMeMaybe before we
    /// know any endpoint is parked until the endpoint updater has some.
    pub(crate) fn collect_disco(
        &self,
        state: &mut EngineState,
        slot: usize,
        actions: &SessionActions,
        out: &mut Vec<DiscoOut>,
    ) {
        if actions.is_empty() {
            return;
        }
        let Some(session) = state.peers.get(slot) else {
            return;
        };
        let (Some(dst), Some(me)) = (session.disco_key(), state.node_key) else {
            return;
        };
        let peer = session.node_key();
        for p in &actions.pings {
            out.push(DiscoOut {
                via: Via::Udp(p.to),
                peer,
                dst,
                msg: DiscoMessage::Ping(Ping {
                    tx_id: p.tx_id,
                    node_key: me,
                }),
            });
        }
        if let Some(region) = actions.call_me_maybe {
            if state.endpoints.is_empty() {
                state.pending_call_me_maybe.insert(peer);
                self.probe_wake.notify_one();
            } else {
                out.push(DiscoOut {
                    via: Via::Relay(region),
                    peer,
                    dst,
                    msg: DiscoMessage::CallMeMaybe(CallMeMaybe {
                        endpoints: state.endpoints.iter().map(|e| e.addr).collect(),
                    }),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::PeerEventKind;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            rng_seed: Some(7),
            ..EngineConfig::loopback()
        })
        .unwrap()
    }

    fn descriptor(n: u8, endpoints: &[SocketAddr]) -> PeerDescriptor {
        PeerDescriptor::new(
            NodePublicKey::from_bytes([n; 32]),
            Some(DiscoPublicKey::from_bytes([n.wrapping_add(100); 32])),
            endpoints,
            None,
        )
    }

    #[tokio::test]
    async fn test_send_while_logged_out() {
        let e = engine();
        e.start().await.unwrap();
        let peer = NodePublicKey::from_bytes([7; 32]);
        let err = e.send(&peer, vec![vec![1, 2, 3]]).await.unwrap_err();
        assert!(matches!(err, EngineError::NoTransportAvailable));
        assert_eq!(e.health(), HealthStatus::LoggedOut);
        e.close().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_has_no_transport() {
        let e = engine();
        e.start().await.unwrap();
        e.set_private_key(Some(NodePrivateKey::from_bytes([1; 32])));
        let err = e
            .send(&NodePublicKey::from_bytes([9; 32]), vec![vec![0]])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoTransportAvailable));
        assert_eq!(e.status().stats.no_transport, 1);
        e.close().await;
    }

    #[tokio::test]
    async fn test_peer_without_path_or_relay() {
        let e = engine();
        e.start().await.unwrap();
        e.set_private_key(Some(NodePrivateKey::from_bytes([1; 32])));
        let peer = descriptor(2, &["127.0.0.1:9".parse().unwrap()]);
        e.on_network_map_update(std::slice::from_ref(&peer), RelayMap::default());

        let err = e.send(&peer.node_key, vec![vec![0]]).await.unwrap_err();
        assert!(matches!(err, EngineError::NoTransportAvailable));
        let status = e.peer_status(&peer.node_key).unwrap();
        assert_eq!(status.pending_pings, 1);
        assert_eq!(status.path, status::PeerPath::None);
        e.close().await;
    }

    #[tokio::test]
    async fn test_relay_stats_count_accepted_packets_only() {
        use meshpath_discovery::relay::protocol::MAX_PACKET_SIZE;
        use meshpath_discovery::relay::{RelayNode, RelayRegion};

        let e = engine();
        e.start().await.unwrap();
        e.set_private_key(Some(NodePrivateKey::from_bytes([1; 32])));
        let map = RelayMap::from_regions([RelayRegion {
            id: 1,
            code: "t".into(),
            nodes: vec![RelayNode {
                name: "1a".into(),
                host: "127.0.0.1".into(),
                relay_port: 1,
                stun_port: 0,
                stun_only: false,
            }],
        }]);
        let peer = PeerDescriptor::new(
            NodePublicKey::from_bytes([2; 32]),
            Some(DiscoPublicKey::from_bytes([102; 32])),
            &[],
            Some(1),
        );
        e.on_network_map_update(std::slice::from_ref(&peer), map);

        let oversized = vec![0u8; MAX_PACKET_SIZE + 1];
        e.send(&peer.node_key, vec![oversized.clone()]).await.unwrap();
        assert_eq!(e.status().stats.data_sent_relay, 0);

        e.send(&peer.node_key, vec![oversized, vec![1, 2, 3]]).await.unwrap();
        assert_eq!(e.status().stats.data_sent_relay, 1);
        e.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let e = engine();
        e.start().await.unwrap();
        assert!(e.is_running());
        e.close().await;
        e.close().await;
        assert!(e.is_closed());
        assert!(!e.is_running());
        assert!(matches!(e.start().await, Err(EngineError::Closed)));
        assert!(matches!(e.recv().await, Err(EngineError::Closed)));
        assert!(matches!(
            e.send(&NodePublicKey::from_bytes([3; 32]), vec![vec![0]]).await,
            Err(EngineError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let e = engine();
        e.start().await.unwrap();
        let port = e.local_port();
        assert_ne!(port, 0);
        e.start().await.unwrap();
        assert_eq!(e.local_port(), port);
        e.close().await;
    }

    #[tokio::test]
    async fn test_network_map_adds_and_removes_peers() {
        let e = engine();
        e.set_private_key(Some(NodePrivateKey::from_bytes([1; 32])));
        let zero = PeerDescriptor::new(NodePublicKey::from_bytes([0; 32]), None, &[], None);
        e.on_network_map_update(&[descriptor(2, &[]), descriptor(3, &[]), zero], RelayMap::default());
        assert_eq!(e.status().peers.len(), 2);

        e.on_network_map_update(&[descriptor(3, &[])], RelayMap::default());
        let peers = e.status().peers;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_key, NodePublicKey::from_bytes([3; 32]));
        assert!(e.peer_status(&NodePublicKey::from_bytes([2; 32])).is_none());
        e.close().await;
    }

    #[tokio::test]
    async fn test_key_change_resets_sessions() {
        let e = engine();
        e.set_private_key(Some(NodePrivateKey::from_bytes([1; 32])));
        let peer = descriptor(2, &[]);
        e.on_network_map_update(std::slice::from_ref(&peer), RelayMap::default());

        e.set_private_key(Some(NodePrivateKey::from_bytes([5; 32])));
        let events = e.peer_events(&peer.node_key);
        assert!(matches!(events.last().map(|ev| &ev.kind), Some(PeerEventKind::Reset)));
        assert_eq!(e.node_key(), Some(NodePrivateKey::from_bytes([5; 32]).public_key()));

        e.set_private_key(None);
        assert_eq!(e.node_key(), None);
        assert_eq!(e.health(), HealthStatus::LoggedOut);
        e.close().await;
    }

    #[tokio::test]
    async fn test_health_without_relay() {
        let e = engine();
        e.start().await.unwrap();
        e.set_private_key(Some(NodePrivateKey::from_bytes([1; 32])));
        assert_eq!(e.health(), HealthStatus::NoRelay);
        e.set_network_up(false);
        assert_eq!(e.health(), HealthStatus::NoUdpNoRelay);
        e.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = EngineConfig::loopback();
        config.disco.hysteresis = 0.0;
        assert!(matches!(Engine::new(config), Err(EngineError::InvalidConfig(_))));
    }
}
