//! Relay wire protocol.
//!
//! Every frame is `type(1) | length(4, big endian) | body`. The connection
//! opens with the server sending [`Frame::ServerKey`]; the client answers with
//! [`Frame::ClientInfo`], whose body is sealed to the server's node key, and
//! the server confirms with a sealed [`Frame::ServerInfo`]. After that either
//! side may send any data frame.

use meshpath_crypto::{CryptoError, NONCE_SIZE, NodePublicKey, SharedKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::map::RegionId;

/// Eight bytes leading every ServerKey frame.
pub const PROTOCOL_MAGIC: [u8; 8] = *b"MPRELAY1";

/// Protocol version carried in ClientInfo and ServerInfo.
pub const PROTOCOL_VERSION: u8 = 2;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest packet that fits in a SendPacket frame.
pub const MAX_PACKET_SIZE: usize = MAX_FRAME_SIZE - 32;

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// Connection or handshake timeout
    #[error("Connection timeout")]
    Timeout,
    /// Frame exceeds [`MAX_FRAME_SIZE`]
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// Frame body malformed
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Server didn't speak the protocol
    #[error("Handshake failed: {0}")]
    Handshake(String),
    /// Sealed box failed to open or seal
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// Per-region send queue is full; the packet was dropped
    #[error("Relay queue full for region {0}")]
    QueueFull(RegionId),
    /// No relay map entry for this region
    #[error("Unknown relay region {0}")]
    NoSuchRegion(RegionId),
    /// Client has no node key yet
    #[error("No private key configured")]
    NoPrivateKey,
    /// Connection closed
    #[error("Relay connection closed")]
    Closed,
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Frame type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Server's node key
    ServerKey = 0x01,
    /// Client's node key and sealed [`ClientInfo`]
    ClientInfo = 0x02,
    /// Sealed [`ServerInfo`]
    ServerInfo = 0x03,
    /// Client to server packet
    SendPacket = 0x04,
    /// Server to client packet
    RecvPacket = 0x05,
    /// No-op to keep middleboxes from timing out the connection
    KeepAlive = 0x06,
    /// Client marks this connection as its home
    NotePreferred = 0x07,
    /// A peer previously sending via this server disconnected
    PeerGone = 0x08,
    /// Liveness probe
    Ping = 0x12,
    /// Liveness probe response
    Pong = 0x13,
}

impl FrameType {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::ServerKey,
            0x02 => Self::ClientInfo,
            0x03 => Self::ServerInfo,
            0x04 => Self::SendPacket,
            0x05 => Self::RecvPacket,
            0x06 => Self::KeepAlive,
            0x07 => Self::NotePreferred,
            0x08 => Self::PeerGone,
            0x12 => Self::Ping,
            0x13 => Self::Pong,
            _ => return None,
        })
    }
}

/// Why a peer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerGoneReason {
    /// Peer disconnected from this server
    Disconnected,
    /// Server has never seen this peer
    NotHere,
}

/// Client capabilities, sealed inside ClientInfo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Protocol version
    pub version: u8,
    /// Client answers Ping frames
    pub can_ack_pings: bool,
    /// Connection only used for probing, never for traffic
    pub is_prober: bool,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            can_ack_pings: true,
            is_prober: false,
        }
    }
}

/// Server parameters, sealed inside ServerInfo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Protocol version
    pub version: u8,
    /// Rate limit, 0 = unlimited
    pub token_bucket_bytes_per_second: u32,
    /// Burst allowance, 0 = unlimited
    pub token_bucket_bytes_burst: u32,
}

/// A relay protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Server's node key
    ServerKey {
        /// Server node key
        key: NodePublicKey,
    },
    /// Client hello
    ClientInfo {
        /// Client node key
        key: NodePublicKey,
        /// Box nonce
        nonce: [u8; NONCE_SIZE],
        /// bincode [`ClientInfo`] sealed to the server
        sealed: Vec<u8>,
    },
    /// Server hello
    ServerInfo {
        /// Box nonce
        nonce: [u8; NONCE_SIZE],
        /// bincode [`ServerInfo`] sealed to the client
        sealed: Vec<u8>,
    },
    /// Packet for `dst`
    SendPacket {
        /// Destination node key
        dst: NodePublicKey,
        /// Opaque payload
        packet: Vec<u8>,
    },
    /// Packet from `src`
    RecvPacket {
        /// Source node key
        src: NodePublicKey,
        /// Opaque payload
        packet: Vec<u8>,
    },
    /// Keepalive
    KeepAlive,
    /// Home-connection marker
    NotePreferred {
        /// Whether this is the client's home connection
        preferred: bool,
    },
    /// Peer gone
    PeerGone {
        /// Peer that left
        peer: NodePublicKey,
        /// Reason
        reason: PeerGoneReason,
    },
    /// Ping
    Ping {
        /// Echo data
        data: [u8; 8],
    },
    /// Pong
    Pong {
        /// Echoed data
        data: [u8; 8],
    },
    /// Frame type this client doesn't know; skipped.
    Unknown(u8),
}

impl Frame {
    /// The frame's type code.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        let t = match self {
            Self::ServerKey { .. } => FrameType::ServerKey,
            Self::ClientInfo { .. } => FrameType::ClientInfo,
            Self::ServerInfo { .. } => FrameType::ServerInfo,
            Self::SendPacket { .. } => FrameType::SendPacket,
            Self::RecvPacket { .. } => FrameType::RecvPacket,
            Self::KeepAlive => FrameType::KeepAlive,
            Self::NotePreferred { .. } => FrameType::NotePreferred,
            Self::PeerGone { .. } => FrameType::PeerGone,
            Self::Ping { .. } => FrameType::Ping,
            Self::Pong { .. } => FrameType::Pong,
            Self::Unknown(t) => return *t,
        };
        t as u8
    }

    /// Encode to `type | len | body`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Self::ServerKey { key } => {
                body.extend_from_slice(&PROTOCOL_MAGIC);
                body.extend_from_slice(key.as_bytes());
            }
            Self::ClientInfo { key, nonce, sealed } => {
                body.extend_from_slice(key.as_bytes());
                body.extend_from_slice(nonce);
                body.extend_from_slice(sealed);
            }
            Self::ServerInfo { nonce, sealed } => {
                body.extend_from_slice(nonce);
                body.extend_from_slice(sealed);
            }
            Self::SendPacket { dst: key, packet } | Self::RecvPacket { src: key, packet } => {
                body.extend_from_slice(key.as_bytes());
                body.extend_from_slice(packet);
            }
            Self::KeepAlive | Self::Unknown(_) => {}
            Self::NotePreferred { preferred } => body.push(u8::from(*preferred)),
            Self::PeerGone { peer, reason } => {
                body.extend_from_slice(peer.as_bytes());
                body.push(match reason {
                    PeerGoneReason::Disconnected => 0,
                    PeerGoneReason::NotHere => 1,
                });
            }
            Self::Ping { data } | Self::Pong { data } => body.extend_from_slice(data),
        }

        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        out.push(self.type_code());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Decode a frame body of type `frame_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidFrame`] if the body is malformed.
    pub fn decode(frame_type: u8, body: &[u8]) -> RelayResult<Self> {
        let Some(t) = FrameType::from_u8(frame_type) else {
            return Ok(Self::Unknown(frame_type));
        };
        let key_at = |offset: usize| -> RelayResult<NodePublicKey> {
            body.get(offset..offset + 32)
                .and_then(|b| NodePublicKey::from_slice(b).ok())
                .ok_or(RelayError::InvalidFrame("short key"))
        };
        let nonce_at = |offset: usize| -> RelayResult<[u8; NONCE_SIZE]> {
            body.get(offset..offset + NONCE_SIZE)
                .and_then(|b| b.try_into().ok())
                .ok_or(RelayError::InvalidFrame("short nonce"))
        };

        Ok(match t {
            FrameType::ServerKey => {
                if body.get(..8) != Some(&PROTOCOL_MAGIC[..]) {
                    return Err(RelayError::InvalidFrame("bad magic"));
                }
                Self::ServerKey { key: key_at(8)? }
            }
            FrameType::ClientInfo => Self::ClientInfo {
                key: key_at(0)?,
                nonce: nonce_at(32)?,
                sealed: body[32 + NONCE_SIZE..].to_vec(),
            },
            FrameType::ServerInfo => Self::ServerInfo {
                nonce: nonce_at(0)?,
                sealed: body[NONCE_SIZE..].to_vec(),
            },
            FrameType::SendPacket => Self::SendPacket {
                dst: key_at(0)?,
                packet: body[32..].to_vec(),
            },
            FrameType::RecvPacket => Self::RecvPacket {
                src: key_at(0)?,
                packet: body[32..].to_vec(),
            },
            FrameType::KeepAlive => Self::KeepAlive,
            FrameType::NotePreferred => Self::NotePreferred {
                preferred: body.first().is_some_and(|b| *b != 0),
            },
            FrameType::PeerGone => Self::PeerGone {
                peer: key_at(0)?,
                reason: match body.get(32) {
                    Some(1) => PeerGoneReason::NotHere,
                    _ => PeerGoneReason::Disconnected,
                },
            },
            FrameType::Ping | FrameType::Pong => {
                let data: [u8; 8] = body
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(RelayError::InvalidFrame("short ping"))?;
                if t == FrameType::Ping {
                    Self::Ping { data }
                } else {
                    Self::Pong { data }
                }
            }
        })
    }
}

/// Read one frame.
///
/// # Errors
///
/// Returns [`RelayError::Closed`] on clean EOF, [`RelayError::FrameTooLarge`]
/// for oversize frames, or the decode/I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> RelayResult<Frame> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(RelayError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(header[0], &body)
}

/// Write one frame and flush.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> RelayResult<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Seal a bincode-encoded info struct.
///
/// # Errors
///
/// Returns an error if serialization or sealing fails.
pub fn seal_info<T: Serialize>(
    key: &SharedKey,
    info: &T,
) -> RelayResult<([u8; NONCE_SIZE], Vec<u8>)> {
    let plain = bincode::serialize(info).map_err(|e| RelayError::Serialization(e.to_string()))?;
    Ok(key.seal(&plain)?)
}

/// Open and decode a sealed info struct.
///
/// # Errors
///
/// Returns an error if the box doesn't open or the payload doesn't parse.
pub fn open_info<T: DeserializeOwned>(
    key: &SharedKey,
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
) -> RelayResult<T> {
    let plain = key.open(nonce, sealed)?;
    bincode::deserialize(&plain).map_err(|e| RelayError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshpath_crypto::NodePrivateKey;
    use rand_core::OsRng;

    fn roundtrip(frame: &Frame) -> Frame {
        let bytes = frame.encode();
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(len, bytes.len() - FRAME_HEADER_SIZE);
        Frame::decode(bytes[0], &bytes[FRAME_HEADER_SIZE..]).unwrap()
    }

    #[test]
    fn test_frame_encoding() {
        let key = NodePublicKey::from_bytes([3; 32]);
        let frames = [
            Frame::ServerKey { key },
            Frame::SendPacket {
                dst: key,
                packet: b"hi".to_vec(),
            },
            Frame::RecvPacket {
                src: key,
                packet: vec![],
            },
            Frame::KeepAlive,
            Frame::NotePreferred { preferred: true },
            Frame::PeerGone {
                peer: key,
                reason: PeerGoneReason::NotHere,
            },
            Frame::Ping { data: [1; 8] },
        ];
        for frame in &frames {
            assert_eq!(&roundtrip(frame), frame);
        }
    }

    #[test]
    fn test_unknown_frame_type_is_skipped() {
        assert_eq!(Frame::decode(0x7f, b"whatever").unwrap(), Frame::Unknown(0x7f));
    }

    #[test]
    fn test_short_bodies_rejected() {
        assert!(Frame::decode(FrameType::SendPacket as u8, &[0; 10]).is_err());
        assert!(Frame::decode(FrameType::ServerKey as u8, b"MPRELAY0").is_err());
        assert!(Frame::decode(FrameType::Ping as u8, &[0; 4]).is_err());
    }

    #[test]
    fn test_sealed_client_info() {
        let client = NodePrivateKey::generate(&mut OsRng);
        let server = NodePrivateKey::generate(&mut OsRng);
        let c = SharedKey::between_nodes(&client, &server.public_key());
        let s = SharedKey::between_nodes(&server, &client.public_key());

        let info = ClientInfo::default();
        let (nonce, sealed) = seal_info(&c, &info).unwrap();
        let opened: ClientInfo = open_info(&s, &nonce, &sealed).unwrap();
        assert_eq!(opened, info);
    }

    #[tokio::test]
    async fn test_read_write_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Pong { data: [9; 8] };
        write_frame(&mut a, &frame).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), frame);

        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![FrameType::RecvPacket as u8];
        header.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        a.write_all(&header).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(RelayError::FrameTooLarge(_))
        ));
    }
}
