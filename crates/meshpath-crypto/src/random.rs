//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a random 24-byte box nonce.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_nonce() -> Result<[u8; crate::NONCE_SIZE], CryptoError> {
    let mut buf = [0u8; crate::NONCE_SIZE];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 12-byte discovery transaction id.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_tx_id() -> Result<[u8; 12], CryptoError> {
    let mut buf = [0u8; 12];
    fill_random(&mut buf)?;
    Ok(buf)
}
