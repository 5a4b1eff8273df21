//! Engine errors.
//!
//! Almost every per-packet failure is absorbed inside the engine and only
//! shows up in statistics or peer state. What reaches callers:
//!
//! - [`EngineError::NoTransportAvailable`] from `send` when a peer has
//!   neither a direct address nor a usable relay
//! - [`EngineError::Closed`] after shutdown
//! - bind, configuration and other setup failures
//!
//! # Example
//!
//! ```no_run
//! use meshpath_core::EngineError;
//!
//! fn handle(err: EngineError) {
//!     if err.is_transient() {
//!         println!("transient, will recover: {err}");
//!     } else {
//!         println!("needs attention: {err}");
//!     }
//! }
//! ```

use meshpath_discovery::relay::RelayError;
use meshpath_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors returned by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    // ============ Send Path ============
    /// Peer has no direct address and no relay
    #[error("no transport available")]
    NoTransportAvailable,

    /// Engine was closed
    #[error("engine closed")]
    Closed,

    // ============ Transport Errors ============
    /// UDP transport failure
    #[error("UDP transport error: {0}")]
    Transport(#[from] TransportError),

    /// Relay transport failure
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl EngineError {
    /// Returns true if this error may clear up by itself: queue pressure,
    /// timeouts, socket errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(TransportError::Io(_)) | Self::Transport(TransportError::NoSocket(_)) => {
                true
            }
            Self::Relay(e) => matches!(
                e,
                RelayError::QueueFull(_) | RelayError::Timeout | RelayError::Io(_)
            ),
            _ => false,
        }
    }

    /// Returns true if retrying without intervention is pointless.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Closed | Self::InvalidConfig(_))
    }

    /// Invalid configuration with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Self::InvalidConfig(Cow::Borrowed(context))
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
