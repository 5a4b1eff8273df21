//! NaCl box sealing between two disco keys.
//!
//! The box construction is X25519 + XSalsa20-Poly1305 (`crypto_box::SalsaBox`),
//! bit-compatible with libsodium's `crypto_box_easy` minus the nonce, which the
//! caller carries out of band.
//!
//! Precomputing the shared key is the expensive part, so [`SharedKeyCache`]
//! memoizes one [`SharedKey`] per remote disco key for a single local private
//! key. A new local key means a new cache.

use crate::keys::{DiscoPrivateKey, DiscoPublicKey, KEY_SIZE, NodePrivateKey, NodePublicKey};
use crate::random::random_nonce;
use crate::{CryptoError, NONCE_SIZE};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::SalsaBox;
use dashmap::DashMap;
use std::sync::Arc;

/// Poly1305 tag overhead added by sealing.
pub const BOX_OVERHEAD: usize = 16;

/// Precomputed box key between a local and a remote disco key.
pub struct SharedKey {
    inner: SalsaBox,
}

impl SharedKey {
    /// Precompute the shared key for `local` and `remote`.
    #[must_use]
    pub fn new(local: &DiscoPrivateKey, remote: &DiscoPublicKey) -> Self {
        Self::from_raw(&local.to_secret_bytes(), remote.as_bytes())
    }

    /// Shared key between two node keys, used by the relay handshake.
    #[must_use]
    pub fn between_nodes(local: &NodePrivateKey, remote: &NodePublicKey) -> Self {
        Self::from_raw(&local.to_secret_bytes(), remote.as_bytes())
    }

    fn from_raw(secret: &[u8; KEY_SIZE], public: &[u8; KEY_SIZE]) -> Self {
        let secret = crypto_box::SecretKey::from(*secret);
        let public = crypto_box::PublicKey::from(*public);
        Self {
            inner: SalsaBox::new(&public, &secret),
        }
    }

    /// Seal `plaintext` under an explicit nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
    pub fn seal_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .encrypt(GenericArray::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Seal `plaintext` under a fresh random nonce, returning both.
    ///
    /// # Errors
    ///
    /// Returns an error if randomness or encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
        let nonce = random_nonce()?;
        let sealed = self.seal_with_nonce(&nonce, plaintext)?;
        Ok((nonce, sealed))
    }

    /// Open a sealed box.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on any authentication failure.
    /// No partial plaintext is ever returned.
    pub fn open(&self, nonce: &[u8; NONCE_SIZE], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Memoized shared keys for one local disco private key.
pub struct SharedKeyCache {
    local: DiscoPrivateKey,
    local_public: DiscoPublicKey,
    keys: DashMap<DiscoPublicKey, Arc<SharedKey>>,
}

impl SharedKeyCache {
    /// Create an empty cache for `local`.
    #[must_use]
    pub fn new(local: DiscoPrivateKey) -> Self {
        let local_public = local.public_key();
        Self {
            local,
            local_public,
            keys: DashMap::new(),
        }
    }

    /// Public half of the local key.
    #[must_use]
    pub fn local_public(&self) -> DiscoPublicKey {
        self.local_public
    }

    /// Get (or compute and remember) the shared key with `remote`.
    #[must_use]
    pub fn get(&self, remote: &DiscoPublicKey) -> Arc<SharedKey> {
        if let Some(existing) = self.keys.get(remote) {
            return Arc::clone(existing.value());
        }
        let key = Arc::new(SharedKey::new(&self.local, remote));
        Arc::clone(self.keys.entry(*remote).or_insert(key).value())
    }

    /// Drop the memoized key for `remote`, if any.
    pub fn forget(&self, remote: &DiscoPublicKey) {
        self.keys.remove(remote);
    }

    /// Number of memoized keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are memoized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for SharedKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyCache")
            .field("local", &self.local_public)
            .field("entries", &self.keys.len())
            .finish()
    }
}
