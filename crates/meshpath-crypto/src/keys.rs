//! Node and discovery key types.
//!
//! Two independent X25519 key families are used:
//! - **Node keys** identify a peer for its whole lifetime and key every
//!   peer-indexed map.
//! - **Disco keys** are used only for the discovery protocol and may rotate.
//!
//! Both are thin wrappers over `x25519-dalek` so that the families cannot be
//! mixed up at compile time. Private halves zeroize on drop through
//! `StaticSecret`.

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Size of every public and private key in bytes.
pub const KEY_SIZE: usize = 32;

macro_rules! public_key_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; KEY_SIZE]);

        impl $name {
            /// Text prefix used by [`Display`](fmt::Display) and [`FromStr`].
            pub const PREFIX: &'static str = $prefix;

            /// Wrap raw key bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            /// Parse from a slice.
            ///
            /// # Errors
            ///
            /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
            pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
                let bytes: [u8; KEY_SIZE] =
                    slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                        expected: KEY_SIZE,
                        actual: slice.len(),
                    })?;
                Ok(Self(bytes))
            }

            /// Raw key bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }

            /// Export raw key bytes.
            #[must_use]
            pub const fn to_bytes(&self) -> [u8; KEY_SIZE] {
                self.0
            }

            /// Whether this is the all-zero key.
            #[must_use]
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; KEY_SIZE]
            }

            /// Short form for log lines: the first four bytes in hex.
            #[must_use]
            pub fn fmt_short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}([{}])", stringify!($name), self.fmt_short())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = CryptoError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let hex_part = s.strip_prefix(Self::PREFIX).unwrap_or(s);
                let bytes = hex::decode(hex_part)
                    .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }
    };
}

macro_rules! private_key_type {
    ($(#[$meta:meta])* $name:ident, $public:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(x25519_dalek::StaticSecret);

        impl $name {
            /// Generate a new random private key.
            pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
                Self(x25519_dalek::StaticSecret::random_from_rng(rng))
            }

            /// Import from raw bytes.
            #[must_use]
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self(x25519_dalek::StaticSecret::from(bytes))
            }

            /// Derive the public half.
            #[must_use]
            pub fn public_key(&self) -> $public {
                $public(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
            }

            /// Export the raw secret.
            ///
            /// # Security
            ///
            /// The returned buffer is zeroized when dropped.
            #[must_use]
            pub fn to_secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
                Zeroizing::new(self.0.to_bytes())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(public={})", stringify!($name), self.public_key().fmt_short())
            }
        }
    };
}

public_key_type!(
    /// Long-lived peer identity (the peer's node public key).
    NodePublicKey,
    "nodekey:"
);

public_key_type!(
    /// Rotatable key used only by the discovery protocol.
    DiscoPublicKey,
    "discokey:"
);

private_key_type!(
    /// Private half of a [`NodePublicKey`].
    NodePrivateKey,
    NodePublicKey
);

private_key_type!(
    /// Private half of a [`DiscoPublicKey`].
    DiscoPrivateKey,
    DiscoPublicKey
);
