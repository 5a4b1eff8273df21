//! Loopback test infrastructure: a relay server, a STUN responder and a
//! pair of engines wired to each other.

mod relay_server;
mod stun_server;
mod two_node;

pub use relay_server::RelayServer;
pub use stun_server::StunResponder;
pub use two_node::{EnginePeer, TwoEngineFixture, test_config};
