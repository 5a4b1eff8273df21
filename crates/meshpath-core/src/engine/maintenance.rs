//! Background upkeep: session timers, endpoint discovery, link changes and
//! pruning.

use super::Engine;
use crate::session::SessionActions;
use meshpath_discovery::NetcheckReport;
use meshpath_discovery::endpoints::Endpoint;
use meshpath_discovery::interfaces::LinkMonitor;
use meshpath_discovery::relay::{RegionId, RelayMap};
use meshpath_crypto::NodePublicKey;
use std::sync::atomic::Ordering;
use tokio::time::{Instant, MissedTickBehavior};

/// Home region: the configured one if the map has it, else the lowest
/// latency region, else the lowest region id.
pub(crate) fn choose_home_region(
    configured: Option<RegionId>,
    report: &NetcheckReport,
    map: &RelayMap,
) -> Option<RegionId> {
    let known = |r: &RegionId| map.region(*r).is_some();
    configured
        .filter(known)
        .or_else(|| report.preferred_region.filter(known))
        .or_else(|| map.region_ids().next())
}

impl Engine {
    /// Fire session deadlines as they come due.
    pub(crate) async fn run_timers(self) {
        loop {
            let deadline = self.inner.state.lock().timers.next_deadline();
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                () = self.inner.timer_wake.notified() => continue,
                () = sleep => {}
            }
            self.fire_timers(Instant::now()).await;
        }
        tracing::debug!("timer task stopped");
    }

    async fn fire_timers(&self, now: Instant) {
        let mut out = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let state = &mut *st;
            for slot in state.timers.pop_due(now) {
                let relay = self.inner.reachable_relay(&state.peers, slot);
                let Some(session) = state.peers.get_mut(slot) else {
                    continue;
                };
                let tick = session.tick(now, relay, &mut state.rng);
                let wake = session.next_wakeup();
                let peer = session.node_key();
                for t in &tick.timeouts {
                    if t.on_trusted_path || self.inner.config.verbose_disco {
                        tracing::info!("ping to {} at {} timed out", peer.fmt_short(), t.addr);
                    } else {
                        tracing::trace!("ping to {} at {} timed out", peer.fmt_short(), t.addr);
                    }
                }
                state.peers.forget_addrs(slot, &tick.removed);
                state.timers.schedule(slot, wake);
                self.inner.collect_disco(state, slot, &tick.actions, &mut out);
            }
        }
        self.transmit_disco(out).await;
    }

    /// Rediscover endpoints on demand and every few tens of seconds while
    /// there is traffic.
    pub(crate) async fn run_endpoint_updater(self) {
        loop {
            let delay = {
                let mut st = self.inner.state.lock();
                self.inner.prober.restun_delay(&mut st.rng)
            };
            let periodic = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                () = self.inner.probe_wake.notified() => false,
                () = tokio::time::sleep(delay) => true,
            };
            if periodic && !self.wants_periodic_probe(Instant::now()) {
                tracing::trace!("skipping periodic re-STUN");
                continue;
            }
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                _ = self.update_endpoints_now() => {}
            }
        }
        tracing::debug!("endpoint updater stopped");
    }

    fn wants_periodic_probe(&self, now: Instant) -> bool {
        if !self.inner.has_private_key.load(Ordering::SeqCst) || !self.is_network_up() {
            return false;
        }
        let st = self.inner.state.lock();
        let timeout = self.inner.disco_config.session_active_timeout;
        !st.peers.is_empty()
            && st
                .last_activity
                .is_some_and(|t| now.saturating_duration_since(t) < timeout)
    }

    pub(crate) async fn update_endpoints_now(&self) -> Vec<Endpoint> {
        let relay_map = self.inner.state.lock().relay_map.clone();
        let outcome = self.inner.prober.determine_endpoints(&relay_map).await;
        let home = choose_home_region(self.inner.config.relay.home_region, &outcome.report, &relay_map);
        self.inner.relay.set_home(home);

        let mut out = Vec::new();
        let changed = {
            let mut st = self.inner.state.lock();
            let state = &mut *st;
            state.udp_blocked = !relay_map.is_empty() && !outcome.report.udp;
            state.endpoints.clone_from(&outcome.endpoints);
            let changed = state.notified_endpoints.as_ref() != Some(&outcome.endpoints);
            if changed {
                state.notified_endpoints = Some(outcome.endpoints.clone());
            }

            if !state.endpoints.is_empty() {
                let pending: Vec<NodePublicKey> = state.pending_call_me_maybe.drain().collect();
                for key in pending {
                    let Some(slot) = state.peers.slot_of(&key) else {
                        continue;
                    };
                    let Some(region) = self.inner.reachable_relay(&state.peers, slot) else {
                        continue;
                    };
                    let actions = SessionActions {
                        pings: Vec::new(),
                        call_me_maybe: Some(region),
                    };
                    self.inner.collect_disco(state, slot, &actions, &mut out);
                }
            }
            changed
        };
        self.transmit_disco(out).await;

        if changed {
            tracing::info!(
                "endpoints changed: [{}]",
                outcome
                    .endpoints
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let callback = self.inner.on_endpoints.lock().clone();
            if let Some(cb) = callback {
                cb(&outcome.endpoints);
            }
        }
        outcome.endpoints
    }

    /// Watch interfaces and prune idle candidates.
    pub(crate) async fn run_maintenance(self) {
        let mut monitor = LinkMonitor::new(self.inner.config.prober.include_loopback);
        let mut link = tokio::time::interval(self.inner.config.prober.link_poll_interval);
        let mut prune = tokio::time::interval(self.inner.disco_config.prune_interval);
        link.set_missed_tick_behavior(MissedTickBehavior::Delay);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        link.tick().await;
        prune.tick().await;

        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                _ = link.tick() => {
                    if monitor.poll().is_some() {
                        self.handle_link_change().await;
                    }
                }
                _ = prune.tick() => self.prune_all(Instant::now()),
            }
        }
        tracing::debug!("maintenance task stopped");
    }

    async fn handle_link_change(&self) {
        self.inner.prober.forget_cached();
        if let Err(e) = self.rebind().await {
            tracing::warn!("rebind after link change failed: {e}");
        }
    }

    fn prune_all(&self, now: Instant) {
        let mut st = self.inner.state.lock();
        let state = &mut *st;
        let slots: Vec<usize> = state.peers.slots().collect();
        let mut total = 0;
        for slot in slots {
            let Some(session) = state.peers.get_mut(slot) else {
                continue;
            };
            let removed = session.prune(now);
            total += removed.len();
            state.peers.forget_addrs(slot, &removed);
        }
        if total > 0 {
            tracing::debug!("pruned {total} stale candidates");
        }
    }
}
