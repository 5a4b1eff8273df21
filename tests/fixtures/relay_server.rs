//! Minimal relay server speaking the client protocol.
//!
//! Forwards `SendPacket` frames to the addressed client, answers `Ping`, and
//! reports `PeerGone` for unknown destinations.

use meshpath_crypto::{NodePrivateKey, NodePublicKey, SharedKey};
use meshpath_discovery::relay::protocol::{
    ClientInfo, Frame, PROTOCOL_VERSION, PeerGoneReason, RelayError, RelayResult, ServerInfo,
    open_info, read_frame, seal_info, write_frame,
};
use meshpath_discovery::relay::{RegionId, RelayMap, RelayNode, RelayRegion};
use parking_lot::Mutex;
use rand_core::OsRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

type Clients = Arc<Mutex<HashMap<NodePublicKey, mpsc::Sender<Frame>>>>;

/// A relay server on an ephemeral loopback port. Stops when dropped.
pub struct RelayServer {
    addr: SocketAddr,
    key: NodePublicKey,
    clients: Clients,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind and start accepting.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let private = NodePrivateKey::generate(&mut OsRng);
        let key = private.public_key();
        let clients = Clients::default();
        let task = tokio::spawn(accept_loop(listener, private, Arc::clone(&clients)));
        Ok(Self {
            addr,
            key,
            clients,
            task,
        })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Server node key.
    pub fn key(&self) -> NodePublicKey {
        self.key
    }

    /// Region entry pointing at this server. `stun_port` 0 means no STUN.
    pub fn region(&self, id: RegionId, stun_port: u16) -> RelayRegion {
        RelayRegion {
            id,
            code: format!("test{id}"),
            nodes: vec![RelayNode {
                name: format!("{id}a"),
                host: "127.0.0.1".into(),
                relay_port: self.addr.port(),
                stun_port,
                stun_only: false,
            }],
        }
    }

    /// One-region map.
    pub fn relay_map(&self, id: RegionId, stun_port: u16) -> RelayMap {
        RelayMap::from_regions([self.region(id, stun_port)])
    }

    /// Whether `key` has completed a handshake and is still connected.
    pub fn is_connected(&self, key: &NodePublicKey) -> bool {
        self.clients.lock().contains_key(key)
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, private: NodePrivateKey, clients: Clients) {
    let private = Arc::new(private);
    let mut conns = JoinSet::new();
    while let Ok((stream, peer)) = listener.accept().await {
        let private = Arc::clone(&private);
        let clients = Arc::clone(&clients);
        conns.spawn(async move {
            if let Err(e) = serve_client(stream, &private, clients).await {
                tracing::debug!("test relay: client {peer} ended: {e}");
            }
        });
    }
}

async fn serve_client(
    mut stream: TcpStream,
    server: &NodePrivateKey,
    clients: Clients,
) -> RelayResult<()> {
    stream.set_nodelay(true)?;
    write_frame(
        &mut stream,
        &Frame::ServerKey {
            key: server.public_key(),
        },
    )
    .await?;
    let Frame::ClientInfo { key, nonce, sealed } = read_frame(&mut stream).await? else {
        return Err(RelayError::Handshake("expected ClientInfo".into()));
    };
    let shared = SharedKey::between_nodes(server, &key);
    let _info: ClientInfo = open_info(&shared, &nonce, &sealed)?;
    let (nonce, sealed) = seal_info(
        &shared,
        &ServerInfo {
            version: PROTOCOL_VERSION,
            ..ServerInfo::default()
        },
    )?;
    // Register before the client can observe the handshake finishing.
    let (tx, mut rx) = mpsc::channel::<Frame>(256);
    clients.lock().insert(key, tx.clone());
    write_frame(&mut stream, &Frame::ServerInfo { nonce, sealed }).await?;

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(f) => f,
            Err(e) => break Err(e),
        };
        match frame {
            Frame::SendPacket { dst, packet } => {
                let target = clients.lock().get(&dst).cloned();
                match target {
                    Some(target) => {
                        let _ = target.send(Frame::RecvPacket { src: key, packet }).await;
                    }
                    None => {
                        let _ = tx
                            .send(Frame::PeerGone {
                                peer: dst,
                                reason: PeerGoneReason::NotHere,
                            })
                            .await;
                    }
                }
            }
            Frame::Ping { data } => {
                let _ = tx.send(Frame::Pong { data }).await;
            }
            _ => {}
        }
    };

    {
        let mut map = clients.lock();
        if map.get(&key).is_some_and(|t| t.same_channel(&tx)) {
            map.remove(&key);
        }
    }
    writer_task.abort();
    result
}
