//! Transport error types.

use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// No socket is currently bound for the destination's family
    #[error("No socket bound for {0}")]
    NoSocket(&'static str),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Whether an I/O error means the local host cannot send to this address
/// family at all (no IPv6 route, family not supported).
#[must_use]
pub fn is_family_unsupported(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EAFNOSUPPORT) | Some(libc::ENETUNREACH) | Some(libc::EADDRNOTAVAIL)
        )
    }
    #[cfg(not(unix))]
    {
        err.kind() == io::ErrorKind::AddrNotAvailable
    }
}
