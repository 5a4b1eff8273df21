//! Probing policies.
//!
//! A [`DiscoPolicy`] decides when a session spends packets on discovery.
//! [`HeartbeatPolicy`] keeps active paths warm with periodic pings;
//! [`SilentPolicy`] never pings on a timer and probes only when traffic
//! needs a path.

use crate::addrbook::BestAddr;
use crate::config::DiscoConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Path state a policy looks at.
#[derive(Debug, Clone, Copy)]
pub struct PathView<'a> {
    /// Current best address
    pub best: Option<&'a BestAddr>,
    /// Last full ping round
    pub last_full_ping: Option<Instant>,
}

/// Probing to do alongside a data send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProbe {
    /// Nothing
    None,
    /// Ping only the best address
    PingBest,
    /// Ping every candidate and ask the peer to do the same
    FullRound,
}

/// Decides when a session probes.
pub trait DiscoPolicy: Send + Sync + fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Heartbeat period, or `None` if heartbeats are off.
    fn heartbeat_interval(&self, config: &DiscoConfig) -> Option<Duration>;

    /// Whether a heartbeat should run a full ping round.
    fn want_full_ping(&self, view: &PathView<'_>, now: Instant, config: &DiscoConfig) -> bool;

    /// Probing to attach to a data send.
    fn on_send(&self, view: &PathView<'_>, now: Instant, config: &DiscoConfig) -> SendProbe;
}

/// Heartbeats every few seconds while the session is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatPolicy;

impl DiscoPolicy for HeartbeatPolicy {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn heartbeat_interval(&self, config: &DiscoConfig) -> Option<Duration> {
        Some(config.heartbeat_interval)
    }

    fn want_full_ping(&self, view: &PathView<'_>, now: Instant, config: &DiscoConfig) -> bool {
        let (Some(best), Some(last_full)) = (view.best, view.last_full_ping) else {
            return true;
        };
        if !best.is_trusted(now) || best.latency > config.poor_latency {
            return true;
        }
        if best.latency <= config.good_enough_latency {
            return false;
        }
        now.saturating_duration_since(last_full) >= config.upgrade_interval
    }

    fn on_send(&self, view: &PathView<'_>, now: Instant, _config: &DiscoConfig) -> SendProbe {
        match view.best {
            Some(b) if b.is_trusted(now) => SendProbe::None,
            _ => SendProbe::FullRound,
        }
    }
}

/// No timers. A trusted path close to expiry is reconfirmed by the traffic
/// that uses it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentPolicy;

impl DiscoPolicy for SilentPolicy {
    fn name(&self) -> &'static str {
        "silent"
    }

    fn heartbeat_interval(&self, _config: &DiscoConfig) -> Option<Duration> {
        None
    }

    fn want_full_ping(&self, view: &PathView<'_>, now: Instant, _config: &DiscoConfig) -> bool {
        view.best.is_none_or(|b| !b.is_trusted(now))
    }

    fn on_send(&self, view: &PathView<'_>, now: Instant, config: &DiscoConfig) -> SendProbe {
        let Some(best) = view.best else {
            return SendProbe::FullRound;
        };
        match best.trust_until {
            Some(until) if now < until => {
                if until.saturating_duration_since(now) < config.heartbeat_interval {
                    SendProbe::PingBest
                } else {
                    SendProbe::None
                }
            }
            _ => SendProbe::FullRound,
        }
    }
}

/// Policy selected by `config.silent`.
#[must_use]
pub fn policy_for(config: &DiscoConfig) -> Arc<dyn DiscoPolicy> {
    if config.silent {
        Arc::new(SilentPolicy)
    } else {
        Arc::new(HeartbeatPolicy)
    }
}
