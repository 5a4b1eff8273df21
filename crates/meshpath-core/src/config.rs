//! Engine configuration.
//!
//! Every section has a `Default` carrying the canonical timings, so a TOML
//! file only needs the values it changes. Durations are milliseconds.
//!
//! ```toml
//! verbose_disco = true
//!
//! [udp]
//! port = 41641
//!
//! [disco]
//! heartbeat_interval = 3000
//! hysteresis = 0.99
//!
//! [relay]
//! home_region = 2
//!
//! [prober]
//! static_endpoints = ["192.0.2.10:41641"]
//! ```

use crate::error::{EngineError, EngineResult};
use meshpath_discovery::prober::ProberConfig;
use meshpath_discovery::relay::RelayConfig;
use meshpath_transport::UdpConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Discovery protocol timings and path-selection constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoConfig {
    /// Ping the best address this often while the session is active
    #[serde(with = "meshpath_transport::serde_ms")]
    pub heartbeat_interval: Duration,
    /// How long a confirmed best address is used without mirroring to relay
    #[serde(with = "meshpath_transport::serde_ms")]
    pub trust_udp_addr_duration: Duration,
    /// Trust window for peers pinned to one fixed endpoint
    #[serde(with = "meshpath_transport::serde_ms")]
    pub trust_single_candidate_duration: Duration,
    /// A ping with no pong after this long is abandoned
    #[serde(with = "meshpath_transport::serde_ms")]
    pub ping_timeout: Duration,
    /// Minimum spacing between pings to the same candidate
    #[serde(with = "meshpath_transport::serde_ms")]
    pub discover_ping_interval: Duration,
    /// Full probe interval while a best address exists
    #[serde(with = "meshpath_transport::serde_ms")]
    pub upgrade_interval: Duration,
    /// Latency at which no better path is searched for
    #[serde(with = "meshpath_transport::serde_ms")]
    pub good_enough_latency: Duration,
    /// Best-path latency above which every heartbeat runs a full probe
    #[serde(with = "meshpath_transport::serde_ms")]
    pub poor_latency: Duration,
    /// A session is active if it sent data this recently
    #[serde(with = "meshpath_transport::serde_ms")]
    pub session_active_timeout: Duration,
    /// Minimum spacing between CallMeMaybe sends to one peer
    #[serde(with = "meshpath_transport::serde_ms")]
    pub call_me_maybe_interval: Duration,
    /// Periodic prune of candidates of idle sessions
    #[serde(with = "meshpath_transport::serde_ms")]
    pub prune_interval: Duration,
    /// RTT samples kept per candidate
    pub pong_history: usize,
    /// A candidate replaces the best only below `best * hysteresis`
    pub hysteresis: f64,
    /// IPv6 latencies are multiplied by this before comparing
    pub ipv6_discount: f64,
    /// Silent disco: no heartbeats, probing driven by traffic and events only
    pub silent: bool,
}

impl Default for DiscoConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            trust_udp_addr_duration: Duration::from_millis(6500),
            trust_single_candidate_duration: Duration::from_secs(60 * 60),
            ping_timeout: Duration::from_secs(5),
            discover_ping_interval: Duration::from_secs(5),
            upgrade_interval: Duration::from_secs(60),
            good_enough_latency: Duration::from_millis(5),
            poor_latency: Duration::from_millis(200),
            session_active_timeout: Duration::from_secs(45),
            call_me_maybe_interval: Duration::from_secs(5),
            prune_interval: Duration::from_secs(30),
            pong_history: 64,
            hysteresis: 0.99,
            ipv6_discount: 0.9,
            silent: false,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Log every ping timeout, not just those on trusted paths
    pub verbose_disco: bool,
    /// Per-peer event ring capacity
    pub event_ring_size: Option<usize>,
    /// Seed for the engine RNG; random when unset
    pub rng_seed: Option<u64>,
    /// UDP sockets
    pub udp: UdpConfig,
    /// Relay transport
    pub relay: RelayConfig,
    /// Discovery protocol
    pub disco: DiscoConfig,
    /// Self-address discovery
    pub prober: ProberConfig,
}

/// Event ring capacity when not configured.
pub const DEFAULT_EVENT_RING_SIZE: usize = 32;

impl EngineConfig {
    /// Parse TOML.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if the text doesn't parse or
    /// fails validation.
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| EngineError::InvalidConfig(e.to_string().into()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load TOML from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if the file can't be read or
    /// parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("reading {}: {e}", path.display()).into())
        })?;
        Self::from_toml_str(&contents)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::InvalidConfig(e.to_string().into()))
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> EngineResult<()> {
        let d = &self.disco;
        if !(d.hysteresis > 0.0 && d.hysteresis <= 1.0) {
            return Err(EngineError::invalid_config("disco.hysteresis must be in (0, 1]"));
        }
        if !(d.ipv6_discount > 0.0 && d.ipv6_discount <= 1.0) {
            return Err(EngineError::invalid_config("disco.ipv6_discount must be in (0, 1]"));
        }
        if d.poor_latency < d.good_enough_latency {
            return Err(EngineError::invalid_config(
                "disco.poor_latency must not be below disco.good_enough_latency",
            ));
        }
        if d.pong_history == 0 {
            return Err(EngineError::invalid_config("disco.pong_history must be positive"));
        }
        if d.heartbeat_interval.is_zero() || d.ping_timeout.is_zero() {
            return Err(EngineError::invalid_config(
                "disco.heartbeat_interval and disco.ping_timeout must be positive",
            ));
        }
        if self.prober.restun_max < self.prober.restun_min {
            return Err(EngineError::invalid_config(
                "prober.restun_max must not be below prober.restun_min",
            ));
        }
        if self.event_ring_size == Some(0) {
            return Err(EngineError::invalid_config("event_ring_size must be positive"));
        }
        Ok(())
    }

    /// Loopback-only configuration for tests: no IPv6, loopback endpoints
    /// advertised.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            udp: UdpConfig::loopback(),
            prober: ProberConfig {
                include_loopback: true,
                ..ProberConfig::default()
            },
            ..Self::default()
        }
    }

    /// Effective event ring capacity.
    #[must_use]
    pub fn event_ring_size(&self) -> usize {
        self.event_ring_size.unwrap_or(DEFAULT_EVENT_RING_SIZE)
    }
}
