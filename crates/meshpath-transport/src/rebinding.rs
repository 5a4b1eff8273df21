//! A UDP socket slot that can be swapped underneath its readers.
//!
//! Readers hold a reference to the [`RebindingSocket`], not to a socket. When
//! the slot is replaced, every pending `recv_from` notices the generation bump
//! and retries against the new socket. An empty slot is the blocking
//! placeholder: readers park until something is bound or the slot is closed.

use crate::error::{TransportError, TransportResult};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Swappable socket slot.
#[derive(Debug)]
pub struct RebindingSocket {
    current: RwLock<Option<Arc<UdpSocket>>>,
    generation: watch::Sender<u64>,
    closed: AtomicBool,
}

impl Default for RebindingSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl RebindingSocket {
    /// Create an empty (placeholder) slot.
    #[must_use]
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: RwLock::new(None),
            generation,
            closed: AtomicBool::new(false),
        }
    }

    /// Install a new socket, or the placeholder when `socket` is `None`.
    ///
    /// Returns the previous socket, if any.
    pub fn replace(&self, socket: Option<UdpSocket>) -> Option<Arc<UdpSocket>> {
        let previous = std::mem::replace(&mut *self.current.write(), socket.map(Arc::new));
        self.generation.send_modify(|g| *g += 1);
        previous
    }

    /// The socket currently installed.
    #[must_use]
    pub fn current(&self) -> Option<Arc<UdpSocket>> {
        self.current.read().clone()
    }

    /// Local address of the installed socket.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current.read().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Number of replacements so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Drop the socket and wake every reader with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.replace(None);
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receive one datagram from whichever socket is installed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the slot is closed, or the
    /// socket's own I/O error.
    pub async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        loop {
            let mut changed = self.generation.subscribe();
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            match self.current() {
                Some(socket) => {
                    tokio::select! {
                        res = socket.recv_from(buf) => return res.map_err(TransportError::Io),
                        _ = changed.changed() => continue,
                    }
                }
                None => {
                    if changed.changed().await.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }
}
