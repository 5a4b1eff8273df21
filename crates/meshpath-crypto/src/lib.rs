//! # meshpath crypto
//!
//! Key material for the meshpath path engine.
//!
//! This crate provides:
//! - Node keys (long-lived peer identity) and disco keys (discovery only)
//! - NaCl box sealing between disco keys with memoized shared keys
//! - Secure random nonces and transaction ids
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Box | XSalsa20-Poly1305 | 256-bit key |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod keys;
pub mod random;
pub mod sealed;

pub use error::CryptoError;
pub use keys::{DiscoPrivateKey, DiscoPublicKey, NodePrivateKey, NodePublicKey, KEY_SIZE};
pub use sealed::{SharedKey, SharedKeyCache, BOX_OVERHEAD};

/// Box nonce size
pub const NONCE_SIZE: usize = 24;
