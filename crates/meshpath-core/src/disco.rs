//! Discovery protocol codec.
//!
//! Wire layout of one disco packet:
//!
//! ```text
//! MAGIC (6) | sender disco key (32) | nonce (24) | box(payload)
//! ```
//!
//! The box is XSalsa20-Poly1305 under the shared key of the sender's and
//! receiver's disco keys. The payload is `type (1) | version (1) | body`:
//!
//! | type | message | body |
//! |------|---------|------|
//! | 0x01 | Ping | tx id (12) \| sender node key (32) |
//! | 0x02 | Pong | tx id (12) \| src ip as 16-byte v6 (16) \| src port BE (2) |
//! | 0x03 | CallMeMaybe | N × (ip (16) \| port (2)) |
//!
//! Trailing bytes after a known body are ignored so newer peers can extend
//! messages.

use meshpath_crypto::{DiscoPublicKey, NONCE_SIZE, NodePublicKey, SharedKey, SharedKeyCache};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub use meshpath_transport::DISCO_MAGIC as MAGIC;

/// Discovery transaction id
pub type TxId = [u8; 12];

/// Length of MAGIC + sender key + nonce.
pub const HEADER_LEN: usize = MAGIC.len() + 32 + NONCE_SIZE;

/// Payload version written by this implementation.
pub const VERSION: u8 = 0;

/// Encoded size of one address.
const ADDR_LEN: usize = 18;

const TYPE_PING: u8 = 0x01;
const TYPE_PONG: u8 = 0x02;
const TYPE_CALL_ME_MAYBE: u8 = 0x03;

/// Disco decode errors.
///
/// None of these warrant more than trace logging: every one can be
/// triggered by a remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DiscoError {
    /// Not a disco packet
    #[error("bad disco magic")]
    BadMagic,
    /// Box did not open: unknown or rotated key, or forged packet
    #[error("disco box failed to open")]
    BadKey,
    /// Box opened but the payload isn't a known message
    #[error("unparseable disco payload")]
    BadParse,
    /// Local sealing failed
    #[error("disco seal failed")]
    Seal,
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Transaction id echoed in the Pong
    pub tx_id: TxId,
    /// Sender's node key
    pub node_key: NodePublicKey,
}

/// Answer to a Ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// Transaction id of the Ping
    pub tx_id: TxId,
    /// Source address the Ping arrived from
    pub src: SocketAddr,
}

/// "I just sent you traffic; ping me on these addresses."
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMeMaybe {
    /// Sender's own endpoints
    pub endpoints: Vec<SocketAddr>,
}

/// A discovery message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoMessage {
    /// Ping
    Ping(Ping),
    /// Pong
    Pong(Pong),
    /// CallMeMaybe
    CallMeMaybe(CallMeMaybe),
}

impl DiscoMessage {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::CallMeMaybe(_) => "call-me-maybe",
        }
    }

    /// Encode the plaintext payload.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Self::Ping(p) => {
                let mut out = Vec::with_capacity(2 + 12 + 32);
                out.extend_from_slice(&[TYPE_PING, VERSION]);
                out.extend_from_slice(&p.tx_id);
                out.extend_from_slice(p.node_key.as_bytes());
                out
            }
            Self::Pong(p) => {
                let mut out = Vec::with_capacity(2 + 12 + ADDR_LEN);
                out.extend_from_slice(&[TYPE_PONG, VERSION]);
                out.extend_from_slice(&p.tx_id);
                put_addr(&mut out, p.src);
                out
            }
            Self::CallMeMaybe(c) => {
                let mut out = Vec::with_capacity(2 + c.endpoints.len() * ADDR_LEN);
                out.extend_from_slice(&[TYPE_CALL_ME_MAYBE, VERSION]);
                for ep in &c.endpoints {
                    put_addr(&mut out, *ep);
                }
                out
            }
        }
    }

    /// Parse a plaintext payload.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoError::BadParse`] for unknown types or short bodies.
    pub fn from_payload(payload: &[u8]) -> Result<Self, DiscoError> {
        let [msg_type, _version, body @ ..] = payload else {
            return Err(DiscoError::BadParse);
        };
        match *msg_type {
            TYPE_PING => {
                let tx_id = tx_id_at(body)?;
                let key = body.get(12..44).ok_or(DiscoError::BadParse)?;
                let node_key = NodePublicKey::from_slice(key).map_err(|_| DiscoError::BadParse)?;
                Ok(Self::Ping(Ping { tx_id, node_key }))
            }
            TYPE_PONG => {
                let tx_id = tx_id_at(body)?;
                let src = get_addr(body.get(12..12 + ADDR_LEN).ok_or(DiscoError::BadParse)?);
                Ok(Self::Pong(Pong { tx_id, src }))
            }
            TYPE_CALL_ME_MAYBE => {
                let endpoints = body.chunks_exact(ADDR_LEN).map(get_addr).collect();
                Ok(Self::CallMeMaybe(CallMeMaybe { endpoints }))
            }
            _ => Err(DiscoError::BadParse),
        }
    }
}

fn tx_id_at(body: &[u8]) -> Result<TxId, DiscoError> {
    body.get(..12)
        .and_then(|b| b.try_into().ok())
        .ok_or(DiscoError::BadParse)
}

fn put_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
}

fn get_addr(b: &[u8]) -> SocketAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&b[..16]);
    let v6 = Ipv6Addr::from(octets);
    let ip = v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4);
    SocketAddr::new(ip, u16::from_be_bytes([b[16], b[17]]))
}

/// Whether `packet` starts like a disco packet and is long enough to be one.
#[must_use]
pub fn looks_like_disco(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet.starts_with(&MAGIC)
}

/// Sender disco key of a packet, without opening it.
///
/// # Errors
///
/// Returns [`DiscoError::BadMagic`] if the packet isn't disco.
pub fn sender_key(packet: &[u8]) -> Result<DiscoPublicKey, DiscoError> {
    if !looks_like_disco(packet) {
        return Err(DiscoError::BadMagic);
    }
    DiscoPublicKey::from_slice(&packet[MAGIC.len()..MAGIC.len() + 32])
        .map_err(|_| DiscoError::BadMagic)
}

/// Seal `msg` from `sender` under `shared`.
///
/// # Errors
///
/// Returns [`DiscoError::Seal`] if no nonce could be generated.
pub fn seal(
    shared: &SharedKey,
    sender: &DiscoPublicKey,
    msg: &DiscoMessage,
) -> Result<Vec<u8>, DiscoError> {
    let (nonce, boxed) = shared
        .seal(&msg.to_payload())
        .map_err(|_| DiscoError::Seal)?;
    let mut out = Vec::with_capacity(HEADER_LEN + boxed.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&boxed);
    Ok(out)
}

/// Open a packet under `shared`.
///
/// # Errors
///
/// [`DiscoError::BadMagic`], [`DiscoError::BadKey`] or
/// [`DiscoError::BadParse`].
pub fn open(shared: &SharedKey, packet: &[u8]) -> Result<DiscoMessage, DiscoError> {
    if !looks_like_disco(packet) {
        return Err(DiscoError::BadMagic);
    }
    let nonce_at = MAGIC.len() + 32;
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&packet[nonce_at..HEADER_LEN]);
    let payload = shared
        .open(&nonce, &packet[HEADER_LEN..])
        .map_err(|_| DiscoError::BadKey)?;
    DiscoMessage::from_payload(&payload)
}

/// Codec bound to the local disco key, memoizing shared keys per peer.
#[derive(Debug)]
pub struct DiscoCodec {
    keys: SharedKeyCache,
}

impl DiscoCodec {
    /// Codec for the given key cache.
    #[must_use]
    pub fn new(keys: SharedKeyCache) -> Self {
        Self { keys }
    }

    /// Local disco public key.
    #[must_use]
    pub fn local_key(&self) -> DiscoPublicKey {
        self.keys.local_public()
    }

    /// Seal `msg` for `dst`.
    ///
    /// # Errors
    ///
    /// See [`seal`].
    pub fn encode(&self, dst: &DiscoPublicKey, msg: &DiscoMessage) -> Result<Vec<u8>, DiscoError> {
        seal(&self.keys.get(dst), &self.keys.local_public(), msg)
    }

    /// Decode a packet from whichever disco key it claims to be from.
    ///
    /// # Errors
    ///
    /// See [`open`].
    pub fn decode(&self, packet: &[u8]) -> Result<(DiscoPublicKey, DiscoMessage), DiscoError> {
        let sender = sender_key(packet)?;
        let msg = open(&self.keys.get(&sender), packet)?;
        Ok((sender, msg))
    }

    /// Drop the memoized shared key for `peer`.
    pub fn forget(&self, peer: &DiscoPublicKey) {
        self.keys.forget(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshpath_crypto::DiscoPrivateKey;
    use rand_core::OsRng;

    fn codec() -> DiscoCodec {
        DiscoCodec::new(SharedKeyCache::new(DiscoPrivateKey::generate(&mut OsRng)))
    }

    fn messages() -> Vec<DiscoMessage> {
        vec![
            DiscoMessage::Ping(Ping {
                tx_id: [7; 12],
                node_key: NodePublicKey::from_bytes([9; 32]),
            }),
            DiscoMessage::Pong(Pong {
                tx_id: [1; 12],
                src: "1.2.3.4:41641".parse().unwrap(),
            }),
            DiscoMessage::Pong(Pong {
                tx_id: [2; 12],
                src: "[2001:db8::1]:5".parse().unwrap(),
            }),
            DiscoMessage::CallMeMaybe(CallMeMaybe {
                endpoints: vec![
                    "203.0.113.5:41641".parse().unwrap(),
                    "[2001:db8::2]:41641".parse().unwrap(),
                ],
            }),
            DiscoMessage::CallMeMaybe(CallMeMaybe::default()),
        ]
    }

    #[test]
    fn test_encode_decode_between_peers() {
        let a = codec();
        let b = codec();
        for msg in messages() {
            let packet = a.encode(&b.local_key(), &msg).unwrap();
            assert!(looks_like_disco(&packet));
            let (sender, decoded) = b.decode(&packet).unwrap();
            assert_eq!(sender, a.local_key());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_wrong_receiver_is_bad_key() {
        let a = codec();
        let b = codec();
        let c = codec();
        let packet = a.encode(&b.local_key(), &messages()[0]).unwrap();
        assert_eq!(c.decode(&packet), Err(DiscoError::BadKey));
    }

    #[test]
    fn test_bad_magic() {
        let c = codec();
        assert_eq!(c.decode(b"hello"), Err(DiscoError::BadMagic));
        let mut packet = vec![0u8; HEADER_LEN + 20];
        packet[..6].copy_from_slice(b"TS\xf0\x9f\x92\xad");
        assert_eq!(c.decode(&packet), Err(DiscoError::BadMagic));
    }

    #[test]
    fn test_tampered_packet_is_bad_key() {
        let a = codec();
        let b = codec();
        let mut packet = a.encode(&b.local_key(), &messages()[1]).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 1;
        assert_eq!(b.decode(&packet), Err(DiscoError::BadKey));
    }

    #[test]
    fn test_payload_layout() {
        let ping = DiscoMessage::Ping(Ping {
            tx_id: [0xaa; 12],
            node_key: NodePublicKey::from_bytes([0xbb; 32]),
        });
        let payload = ping.to_payload();
        assert_eq!(payload.len(), 46);
        assert_eq!(&payload[..2], &[TYPE_PING, VERSION]);

        let pong = DiscoMessage::Pong(Pong {
            tx_id: [0; 12],
            src: "1.2.3.4:258".parse().unwrap(),
        });
        let payload = pong.to_payload();
        assert_eq!(payload.len(), 32);
        assert_eq!(&payload[14..26], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&payload[26..], &[1, 2, 3, 4, 1, 2]);
    }

    #[test]
    fn test_unknown_or_short_payload_is_bad_parse() {
        assert_eq!(DiscoMessage::from_payload(&[]), Err(DiscoError::BadParse));
        assert_eq!(DiscoMessage::from_payload(&[0x7f, 0]), Err(DiscoError::BadParse));
        assert_eq!(DiscoMessage::from_payload(&[TYPE_PING, 0, 1, 2]), Err(DiscoError::BadParse));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut payload = messages()[0].to_payload();
        payload.extend_from_slice(b"future");
        assert_eq!(DiscoMessage::from_payload(&payload).unwrap(), messages()[0]);
    }

    #[test]
    fn test_call_me_maybe_partial_entry_ignored() {
        let ep: SocketAddr = "198.51.100.4:41641".parse().unwrap();
        let msg = DiscoMessage::CallMeMaybe(CallMeMaybe { endpoints: vec![ep] });
        let mut payload = msg.to_payload();
        payload.extend_from_slice(&[1, 2, 3]);
        assert_eq!(DiscoMessage::from_payload(&payload).unwrap(), msg);

        assert_eq!(
            DiscoMessage::from_payload(&[TYPE_CALL_ME_MAYBE, 0, 1, 2, 3]).unwrap(),
            DiscoMessage::CallMeMaybe(CallMeMaybe { endpoints: Vec::new() })
        );
    }
}
