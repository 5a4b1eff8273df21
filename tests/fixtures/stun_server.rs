//! STUN responder answering every Binding request with the observed source.

use meshpath_discovery::stun::StunMessage;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// A STUN server on an ephemeral loopback port. Stops when dropped.
pub struct StunResponder {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StunResponder {
    /// Bind and start answering.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start() -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let Ok(req) = StunMessage::decode(&buf[..n]) else {
                    continue;
                };
                let resp = StunMessage::binding_response(req.transaction_id, from);
                let _ = socket.send_to(&resp.encode(), from).await;
            }
        });
        Ok(Self { addr, task })
    }

    /// UDP port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for StunResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
