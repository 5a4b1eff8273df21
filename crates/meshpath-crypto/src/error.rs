//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Box sealing failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Box opening failed (wrong key or forged ciphertext)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key string could not be parsed
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// Public key is a low-order point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
