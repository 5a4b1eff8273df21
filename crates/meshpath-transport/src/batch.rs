//! Batched datagram send.
//!
//! On Linux a batch to one destination goes out in a single `sendmmsg(2)` call.
//! Everywhere else, and whenever the kernel rejects `sendmmsg`, each buffer is
//! written with its own `send_to`. The rejection is remembered in a sticky
//! flag owned by the caller so it is only discovered once per process.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Upper bound on messages handed to the kernel per call.
pub const MAX_BATCH: usize = 64;

/// Send every buffer in `bufs` to `addr`.
///
/// `batching` is the sticky "sendmmsg works" flag; it is cleared if the kernel
/// reports the call as unsupported.
///
/// # Errors
///
/// Returns the first I/O error that could not be worked around. Buffers sent
/// before the error are not retried.
pub async fn send_batch(
    socket: &UdpSocket,
    addr: SocketAddr,
    bufs: &[Vec<u8>],
    batching: &AtomicBool,
) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    #[cfg(target_os = "linux")]
    if bufs.len() > 1 && batching.load(Ordering::Relaxed) {
        match linux::send_all(socket, addr, bufs).await {
            Ok(n) => return Ok(n),
            Err(e) if linux::is_unsupported(&e) => {
                tracing::debug!("sendmmsg unsupported ({e}), falling back to send_to");
                batching.store(false, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = batching.load(Ordering::Relaxed);

    send_each(socket, addr, bufs).await
}

async fn send_each(socket: &UdpSocket, addr: SocketAddr, bufs: &[Vec<u8>]) -> io::Result<usize> {
    for buf in bufs {
        socket.send_to(buf, addr).await?;
    }
    Ok(bufs.len())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::MAX_BATCH;
    use std::io;
    use std::net::SocketAddr;
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;
    use tokio::net::UdpSocket;

    pub(super) fn is_unsupported(err: &io::Error) -> bool {
        matches!(err.raw_os_error(), Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP))
    }

    pub(super) async fn send_all(
        socket: &UdpSocket,
        addr: SocketAddr,
        bufs: &[Vec<u8>],
    ) -> io::Result<usize> {
        let mut sent = 0;
        while sent < bufs.len() {
            let end = (sent + MAX_BATCH).min(bufs.len());
            socket.writable().await?;
            match send_chunk(socket, addr, &bufs[sent..end]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    fn send_chunk(socket: &UdpSocket, addr: SocketAddr, bufs: &[Vec<u8>]) -> io::Result<usize> {
        let sockaddr = socket2::SockAddr::from(addr);
        let mut iovecs: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr().cast_mut().cast::<libc::c_void>(),
                iov_len: b.len(),
            })
            .collect();
        let mut msgs: Vec<libc::mmsghdr> = iovecs
            .iter_mut()
            .map(|iov| {
                // SAFETY: msghdr is a plain C struct for which all-zero is valid.
                let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
                hdr.msg_name = sockaddr.as_ptr().cast_mut().cast::<libc::c_void>();
                hdr.msg_namelen = sockaddr.len();
                hdr.msg_iov = std::ptr::from_mut(iov);
                hdr.msg_iovlen = 1;
                libc::mmsghdr {
                    msg_hdr: hdr,
                    msg_len: 0,
                }
            })
            .collect();
        let fd = socket.as_raw_fd();
        let count = msgs.len() as libc::c_uint;

        socket.try_io(Interest::WRITABLE, || {
            // SAFETY: every pointer in msgs refers to iovecs, bufs or sockaddr,
            // which all outlive this call.
            let n = unsafe { libc::sendmmsg(fd, msgs.as_mut_ptr(), count, 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_batch_delivers_all() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = server.local_addr().unwrap();
        let batching = AtomicBool::new(true);

        let bufs: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 100]).collect();
        let sent = send_batch(&client, dst, &bufs, &batching).await.unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 1500];
        for i in 0..5u8 {
            let (n, _) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
                .await
                .expect("Timeout")
                .unwrap();
            assert_eq!(n, 100);
            assert_eq!(buf[0], i);
        }
    }

    #[tokio::test]
    async fn test_send_batch_without_batching() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = server.local_addr().unwrap();
        let batching = AtomicBool::new(false);

        let bufs = vec![b"one".to_vec(), b"two".to_vec()];
        assert_eq!(send_batch(&client, dst, &bufs, &batching).await.unwrap(), 2);

        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..n], b"one");
    }

    #[tokio::test]
    async fn test_send_batch_empty() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let batching = AtomicBool::new(true);
        let n = send_batch(&client, "127.0.0.1:9".parse().unwrap(), &[], &batching)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
