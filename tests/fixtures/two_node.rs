//! Two-engine fixture.
//!
//! # Example
//!
//! ```no_run
//! use meshpath_integration_tests::fixtures::TwoEngineFixture;
//!
//! # async fn example() -> meshpath_core::EngineResult<()> {
//! let fixture = TwoEngineFixture::new().await?;
//! fixture.connect_direct();
//! // ... exchange traffic ...
//! fixture.cleanup().await;
//! # Ok(())
//! # }
//! ```

use meshpath_core::{Engine, EngineConfig, EngineResult, PeerDescriptor, PeerPath};
use meshpath_crypto::{NodePrivateKey, NodePublicKey};
use meshpath_discovery::relay::{RegionId, RelayMap};
use rand_core::OsRng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Loopback configuration with discovery intervals short enough for tests.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::loopback();
    config.disco.discover_ping_interval = Duration::from_millis(100);
    config.disco.call_me_maybe_interval = Duration::from_millis(100);
    config.disco.ping_timeout = Duration::from_secs(2);
    config.relay.dial_timeout = Duration::from_secs(2);
    config
}

/// A started, logged-in engine.
pub struct EnginePeer {
    /// The engine
    pub engine: Engine,
    key: NodePrivateKey,
}

impl EnginePeer {
    /// Create, start and log in an engine.
    ///
    /// # Errors
    ///
    /// Returns the configuration or bind error.
    pub async fn start(config: EngineConfig) -> EngineResult<Self> {
        let engine = Engine::new(config)?;
        engine.start().await?;
        let key = NodePrivateKey::generate(&mut OsRng);
        engine.set_private_key(Some(key.clone()));
        Ok(Self { engine, key })
    }

    /// Node key.
    pub fn node_key(&self) -> NodePublicKey {
        self.key.public_key()
    }

    /// Loopback address of the engine's IPv4 socket.
    pub fn loopback_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.engine.local_port())
    }

    /// How other engines see this one: with its loopback endpoint when
    /// `direct`, otherwise relay-only.
    pub fn descriptor(&self, direct: bool, home: Option<RegionId>) -> PeerDescriptor {
        let endpoints = if direct {
            vec![self.loopback_addr()]
        } else {
            Vec::new()
        };
        PeerDescriptor::new(
            self.node_key(),
            Some(self.engine.disco_key()),
            &endpoints,
            home,
        )
    }

    /// Current path to `peer`.
    pub fn path_to(&self, peer: &NodePublicKey) -> PeerPath {
        self.engine
            .peer_status(peer)
            .map_or(PeerPath::None, |s| s.path)
    }

    /// Whether `peer` has a trusted direct address.
    pub fn is_direct_to(&self, peer: &NodePublicKey) -> bool {
        self.engine
            .peer_status(peer)
            .is_some_and(|s| s.trusted && matches!(s.path, PeerPath::Direct(_)))
    }
}

/// Two engines on loopback.
pub struct TwoEngineFixture {
    /// First engine
    pub a: EnginePeer,
    /// Second engine
    pub b: EnginePeer,
}

impl TwoEngineFixture {
    /// Two engines with [`test_config`].
    ///
    /// # Errors
    ///
    /// Returns the first engine setup error.
    pub async fn new() -> EngineResult<Self> {
        Self::with_config(test_config(), test_config()).await
    }

    /// Two engines with custom configurations.
    ///
    /// # Errors
    ///
    /// Returns the first engine setup error.
    pub async fn with_config(a: EngineConfig, b: EngineConfig) -> EngineResult<Self> {
        Ok(Self {
            a: EnginePeer::start(a).await?,
            b: EnginePeer::start(b).await?,
        })
    }

    /// Give each engine the other's loopback endpoint and no relays.
    pub fn connect_direct(&self) {
        self.a
            .engine
            .on_network_map_update(&[self.b.descriptor(true, None)], RelayMap::default());
        self.b
            .engine
            .on_network_map_update(&[self.a.descriptor(true, None)], RelayMap::default());
    }

    /// Make each engine relay-only to the other, both homed on `region`.
    pub fn connect_via_relay(&self, map: &RelayMap, region: RegionId) {
        self.a
            .engine
            .on_network_map_update(&[self.b.descriptor(false, Some(region))], map.clone());
        self.b
            .engine
            .on_network_map_update(&[self.a.descriptor(false, Some(region))], map.clone());
    }

    /// Close both engines.
    pub async fn cleanup(self) {
        self.a.engine.close().await;
        self.b.engine.close().await;
    }
}
