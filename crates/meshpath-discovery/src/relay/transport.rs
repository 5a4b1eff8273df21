//! Multi-region relay transport.
//!
//! Keeps zero or more relay connections keyed by region. Connections are
//! dialed lazily on first send. Each connection gets a bounded outbound queue;
//! a full queue drops the packet and reports [`RelayError::QueueFull`] instead
//! of blocking the caller.
//!
//! Every connection runs one writer and one reader. The reader forwards
//! packets from peers to a single inbound channel shared by all regions.
//!
//! The home region is kept connected: it is redialed with backoff whenever
//! it drops. Any other connection is closed once nothing has been written to
//! it for [`RelayConfig::idle_timeout`], and is not redialed on failure.

use super::client::dial;
use super::map::{RegionId, RelayMap};
use super::protocol::{ClientInfo, Frame, MAX_PACKET_SIZE, PeerGoneReason, RelayError, RelayResult};
use meshpath_crypto::{NodePrivateKey, NodePublicKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Queue slots per 64 MiB of available memory.
const QUEUE_MEMORY_UNIT: u64 = 64 * 1024 * 1024;

/// Smallest per-region queue.
pub const MIN_QUEUE_SIZE: usize = 32;

/// Largest per-region queue.
pub const MAX_QUEUE_SIZE: usize = 1024;

/// First reconnect delay for the home region.
const BACKOFF_MIN: Duration = Duration::from_millis(250);

/// Longest reconnect delay for the home region.
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Relay transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Dial plus handshake deadline
    #[serde(with = "meshpath_transport::serde_ms")]
    pub dial_timeout: Duration,
    /// Non-home connections unused for this long are closed
    #[serde(with = "meshpath_transport::serde_ms")]
    pub idle_timeout: Duration,
    /// How often idle connections are looked for
    #[serde(with = "meshpath_transport::serde_ms")]
    pub stale_check_interval: Duration,
    /// KeepAlive frame interval
    #[serde(with = "meshpath_transport::serde_ms")]
    pub keepalive_interval: Duration,
    /// Per-region queue size; derived from available memory when unset
    pub queue_size: Option<usize>,
    /// Home region override; otherwise chosen by latency
    pub home_region: Option<RegionId>,
    /// Never use relays
    pub disabled: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            stale_check_interval: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            queue_size: None,
            home_region: None,
            disabled: false,
        }
    }
}

/// Per-region queue size from available memory: one slot per 64 MiB,
/// clamped to [`MIN_QUEUE_SIZE`]..=[`MAX_QUEUE_SIZE`].
#[must_use]
pub fn default_queue_size() -> usize {
    queue_size_for(available_memory())
}

fn queue_size_for(available: Option<u64>) -> usize {
    match available {
        Some(bytes) => usize::try_from(bytes / QUEUE_MEMORY_UNIT)
            .unwrap_or(MAX_QUEUE_SIZE)
            .clamp(MIN_QUEUE_SIZE, MAX_QUEUE_SIZE),
        None => MIN_QUEUE_SIZE,
    }
}

fn available_memory() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in meminfo.lines() {
            if line.starts_with("MemAvailable:") {
                let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Something that arrived over a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInbound {
    /// A packet from a peer
    Packet {
        /// Region it arrived through
        region: RegionId,
        /// Sending peer
        src: NodePublicKey,
        /// Payload
        data: Vec<u8>,
    },
    /// The server says a peer is no longer connected to it
    PeerGone {
        /// Region of the server
        region: RegionId,
        /// The peer
        peer: NodePublicKey,
    },
}

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    queue_full_drops: AtomicU64,
    dials: AtomicU64,
    dial_failures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    /// Packets queued for sending
    pub packets_sent: u64,
    /// Bytes queued for sending
    pub bytes_sent: u64,
    /// Packets received from peers
    pub packets_received: u64,
    /// Bytes received from peers
    pub bytes_received: u64,
    /// Packets dropped on a full queue
    pub queue_full_drops: u64,
    /// Dial attempts
    pub dials: u64,
    /// Failed dial attempts
    pub dial_failures: u64,
}

impl RelayStats {
    fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            queue_full_drops: self.queue_full_drops.load(Ordering::Relaxed),
            dials: self.dials.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection status for the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConnStatus {
    /// Region
    pub region: RegionId,
    /// Handshake completed and connection up
    pub connected: bool,
    /// Whether this is the home region
    pub home: bool,
}

struct ConnHandle {
    id: u64,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    last_write: Instant,
}

struct State {
    private_key: Option<NodePrivateKey>,
    relay_map: RelayMap,
    home: Option<RegionId>,
    conns: HashMap<RegionId, ConnHandle>,
    next_id: u64,
}

struct Inner {
    config: RelayConfig,
    queue_size: usize,
    state: Mutex<State>,
    inbound: mpsc::Sender<RelayInbound>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: RelayStats,
}

/// Relay connections for all regions.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RelayTransport")
            .field("home", &state.home)
            .field("conns", &state.conns.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RelayTransport {
    /// Create a transport delivering inbound traffic to `inbound`.
    ///
    /// `cancel` is the parent token; cancelling it stops every connection.
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: RelayConfig,
        inbound: mpsc::Sender<RelayInbound>,
        cancel: &CancellationToken,
    ) -> Self {
        let queue_size = config.queue_size.unwrap_or_else(default_queue_size).max(1);
        let inner = Arc::new(Inner {
            config,
            queue_size,
            state: Mutex::new(State {
                private_key: None,
                relay_map: RelayMap::default(),
                home: None,
                conns: HashMap::new(),
                next_id: 0,
            }),
            inbound,
            cancel: cancel.child_token(),
            tasks: Mutex::new(Vec::new()),
            stats: RelayStats::default(),
        });

        let janitor = tokio::spawn(run_janitor(Arc::downgrade(&inner), inner.cancel.clone()));
        inner.tasks.lock().push(janitor);
        Self { inner }
    }

    /// Per-region queue capacity in use.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.inner.queue_size
    }

    /// Install or clear the node key. A change closes every connection; the
    /// home region is redialed with the new key.
    pub fn set_private_key(&self, key: Option<NodePrivateKey>) {
        let home = {
            let mut state = self.inner.state.lock();
            let same = match (&state.private_key, &key) {
                (Some(a), Some(b)) => a.public_key() == b.public_key(),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            state.private_key = key;
            for (_, conn) in state.conns.drain() {
                conn.cancel.cancel();
            }
            state.private_key.as_ref().and(state.home)
        };
        if let Some(home) = home {
            self.ensure_connection(home);
        }
    }

    /// Replace the relay map. Connections to regions no longer listed close.
    pub fn set_relay_map(&self, map: RelayMap) {
        let redial_home = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let old = &state.relay_map;
            let mut moved = Vec::new();
            state.conns.retain(|region, conn| {
                let target = relay_target(&map, *region);
                let keep = target.is_some() && target == relay_target(old, *region);
                if !keep {
                    if target.is_some() {
                        tracing::debug!("relay: region {region} server moved, reconnecting");
                        moved.push(*region);
                    }
                    conn.cancel.cancel();
                }
                keep
            });
            if state.home.is_some_and(|h| map.region(h).is_none()) {
                state.home = None;
            }
            state.relay_map = map;
            state.home.filter(|h| moved.contains(h))
        };
        if let Some(home) = redial_home {
            self.ensure_connection(home);
        }
    }

    /// Current relay map.
    #[must_use]
    pub fn relay_map(&self) -> RelayMap {
        self.inner.state.lock().relay_map.clone()
    }

    /// Change the home region and make sure it is connected.
    ///
    /// The previous home becomes an ordinary connection subject to idle
    /// cleanup.
    pub fn set_home(&self, region: Option<RegionId>) {
        let previous = {
            let mut state = self.inner.state.lock();
            if state.home == region {
                return;
            }
            std::mem::replace(&mut state.home, region)
        };
        tracing::info!("relay home region: {previous:?} -> {region:?}");

        let state = self.inner.state.lock();
        if let Some(old) = previous.and_then(|r| state.conns.get(&r)) {
            let _ = old.tx.try_send(Frame::NotePreferred { preferred: false });
        }
        drop(state);
        if let Some(region) = region {
            self.ensure_connection(region);
            if let Some(conn) = self.inner.state.lock().conns.get(&region) {
                let _ = conn.tx.try_send(Frame::NotePreferred { preferred: true });
            }
        }
    }

    /// Home region, if any.
    #[must_use]
    pub fn home(&self) -> Option<RegionId> {
        self.inner.state.lock().home
    }

    /// Make sure a connection to `region` exists or is being dialed.
    ///
    /// Returns `false` if the region isn't in the relay map, the transport
    /// has no key, or relays are disabled.
    pub fn ensure_connection(&self, region: RegionId) -> bool {
        let mut state = self.inner.state.lock();
        self.ensure_locked(&mut state, region)
    }

    fn ensure_locked(&self, state: &mut State, region: RegionId) -> bool {
        if self.inner.config.disabled || self.inner.cancel.is_cancelled() {
            return false;
        }
        if state.conns.contains_key(&region) {
            return true;
        }
        if state.private_key.is_none() || state.relay_map.region(region).is_none() {
            return false;
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        let cancel = self.inner.cancel.child_token();
        let connected = Arc::new(AtomicBool::new(false));
        let id = state.next_id;
        state.next_id += 1;
        state.conns.insert(
            region,
            ConnHandle {
                id,
                tx,
                cancel: cancel.clone(),
                connected: Arc::clone(&connected),
                last_write: Instant::now(),
            },
        );

        tracing::debug!("relay: opening connection to region {region}");
        let task = tokio::spawn(run_connection(
            Arc::clone(&self.inner),
            region,
            id,
            rx,
            cancel,
            connected,
        ));
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        true
    }

    /// Queue `packet` for `peer` via `region`, dialing if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::QueueFull`] if the queue is full (the packet is
    /// dropped), [`RelayError::NoSuchRegion`] / [`RelayError::NoPrivateKey`]
    /// if no connection can be made, or [`RelayError::Closed`] after close.
    pub fn send(&self, region: RegionId, peer: NodePublicKey, packet: Vec<u8>) -> RelayResult<()> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(RelayError::FrameTooLarge(packet.len()));
        }
        let mut state = self.inner.state.lock();
        if !self.ensure_locked(&mut state, region) {
            return Err(if self.inner.cancel.is_cancelled() {
                RelayError::Closed
            } else if state.private_key.is_none() {
                RelayError::NoPrivateKey
            } else {
                RelayError::NoSuchRegion(region)
            });
        }
        let Some(conn) = state.conns.get_mut(&region) else {
            return Err(RelayError::NoSuchRegion(region));
        };
        let len = packet.len();
        match conn.tx.try_send(Frame::SendPacket { dst: peer, packet }) {
            Ok(()) => {
                conn.last_write = Instant::now();
                self.inner.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .bytes_sent
                    .fetch_add(len as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner
                    .stats
                    .queue_full_drops
                    .fetch_add(1, Ordering::Relaxed);
                Err(RelayError::QueueFull(region))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelayError::Closed),
        }
    }

    /// Whether sending via `region` could work right now: relays enabled, a
    /// key set and the region known.
    #[must_use]
    pub fn can_reach(&self, region: RegionId) -> bool {
        let state = self.inner.state.lock();
        !self.inner.config.disabled
            && !self.inner.cancel.is_cancelled()
            && state.private_key.is_some()
            && state.relay_map.region(region).is_some()
    }

    /// Whether any connection has completed its handshake.
    #[must_use]
    pub fn any_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .conns
            .values()
            .any(|c| c.connected.load(Ordering::Relaxed))
    }

    /// Status of every connection, ordered by region.
    #[must_use]
    pub fn connections(&self) -> Vec<RelayConnStatus> {
        let state = self.inner.state.lock();
        let mut out: Vec<_> = state
            .conns
            .iter()
            .map(|(region, c)| RelayConnStatus {
                region: *region,
                connected: c.connected.load(Ordering::Relaxed),
                home: state.home == Some(*region),
            })
            .collect();
        out.sort_by_key(|s| s.region);
        out
    }

    /// Close idle non-home connections now. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        self.inner.close_idle(Instant::now())
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop every connection and wait for all tasks. Idempotent.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.state.lock().conns.clear();
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Inner {
    fn is_home(&self, region: RegionId) -> bool {
        self.state.lock().home == Some(region)
    }

    fn remove_conn(&self, region: RegionId, id: u64) {
        let mut state = self.state.lock();
        if state.conns.get(&region).is_some_and(|c| c.id == id) {
            state.conns.remove(&region);
        }
    }

    fn close_idle(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let home = state.home;
        let idle = self.config.idle_timeout;
        let before = state.conns.len();
        state.conns.retain(|region, conn| {
            let keep = Some(*region) == home || now.duration_since(conn.last_write) < idle;
            if !keep {
                tracing::debug!("relay: closing idle connection to region {region}");
                conn.cancel.cancel();
            }
            keep
        });
        before - state.conns.len()
    }

    fn dial_params(&self, region: RegionId) -> Option<(String, NodePrivateKey)> {
        let state = self.state.lock();
        let key = state.private_key.clone()?;
        let node = state.relay_map.region(region)?.relay_node()?;
        Some((node.relay_target(), key))
    }
}

fn relay_target(map: &RelayMap, region: RegionId) -> Option<String> {
    map.region(region)?.relay_node().map(|n| n.relay_target())
}

async fn run_janitor(inner: std::sync::Weak<Inner>, cancel: CancellationToken) {
    let period = match inner.upgrade() {
        Some(i) => i.config.stale_check_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.close_idle(Instant::now());
    }
}

async fn run_connection(
    inner: Arc<Inner>,
    region: RegionId,
    id: u64,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = BACKOFF_MIN;
    loop {
        let Some((target, key)) = inner.dial_params(region) else {
            inner.remove_conn(region, id);
            return;
        };

        inner.stats.dials.fetch_add(1, Ordering::Relaxed);
        let info = ClientInfo::default();
        let dialed = tokio::select! {
            _ = cancel.cancelled() => return,
            r = dial(&target, &key, &info, inner.config.dial_timeout) => r,
        };

        match dialed {
            Ok((stream, hs)) => {
                tracing::info!(
                    "relay: connected to region {region} ({target}, server {})",
                    hs.server_key.fmt_short()
                );
                backoff = BACKOFF_MIN;
                connected.store(true, Ordering::Relaxed);
                let result = serve(&inner, region, stream, &mut rx, &cancel).await;
                connected.store(false, Ordering::Relaxed);
                match result {
                    Ok(()) => return,
                    Err(e) => tracing::debug!("relay: region {region} connection lost: {e}"),
                }
            }
            Err(e) => {
                inner.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("relay: dial region {region} ({target}) failed: {e}");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        if !inner.is_home(region) {
            inner.remove_conn(region, id);
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Run one established connection until it fails, the queue closes or the
/// connection is cancelled. `Ok` means a deliberate stop.
async fn serve(
    inner: &Inner,
    region: RegionId,
    stream: TcpStream,
    rx: &mut mpsc::Receiver<Frame>,
    cancel: &CancellationToken,
) -> RelayResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<Frame>(8);

    if inner.is_home(region) {
        super::protocol::write_frame(&mut writer, &Frame::NotePreferred { preferred: true })
            .await?;
    }

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = write_loop(&mut writer, rx, &mut ctrl_rx, inner.config.keepalive_interval) => r,
        r = read_loop(inner, region, &mut reader, &ctrl_tx) => r,
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rx: &mut mpsc::Receiver<Frame>,
    ctrl_rx: &mut mpsc::Receiver<Frame>,
    keepalive_interval: Duration,
) -> RelayResult<()> {
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.tick().await;
    loop {
        let frame = tokio::select! {
            f = rx.recv() => match f {
                Some(f) => f,
                None => return Ok(()),
            },
            Some(f) = ctrl_rx.recv() => f,
            _ = keepalive.tick() => Frame::KeepAlive,
        };
        super::protocol::write_frame(writer, &frame).await?;
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    inner: &Inner,
    region: RegionId,
    reader: &mut R,
    ctrl_tx: &mpsc::Sender<Frame>,
) -> RelayResult<()> {
    loop {
        match super::protocol::read_frame(reader).await? {
            Frame::RecvPacket { src, packet } => {
                inner.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                inner
                    .stats
                    .bytes_received
                    .fetch_add(packet.len() as u64, Ordering::Relaxed);
                let msg = RelayInbound::Packet {
                    region,
                    src,
                    data: packet,
                };
                if inner.inbound.send(msg).await.is_err() {
                    return Err(RelayError::Closed);
                }
            }
            Frame::PeerGone { peer, reason } => {
                tracing::trace!(
                    "relay: region {region} says peer {} gone ({reason:?})",
                    peer.fmt_short()
                );
                if reason == PeerGoneReason::Disconnected {
                    let _ = inner.inbound.send(RelayInbound::PeerGone { region, peer }).await;
                }
            }
            Frame::Ping { data } => {
                let _ = ctrl_tx.try_send(Frame::Pong { data });
            }
            Frame::KeepAlive | Frame::Pong { .. } | Frame::NotePreferred { .. } => {}
            Frame::Unknown(t) => tracing::trace!("relay: skipping unknown frame type {t:#04x}"),
            other => {
                tracing::debug!(
                    "relay: unexpected frame type {:#04x} from region {region}",
                    other.type_code()
                );
            }
        }
    }
}
