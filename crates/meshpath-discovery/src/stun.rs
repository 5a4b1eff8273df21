//! STUN Protocol Implementation (RFC 5389)
//!
//! Just enough STUN for server-reflexive address discovery: Binding requests
//! and responses with MAPPED-ADDRESS, XOR-MAPPED-ADDRESS, SOFTWARE and
//! FINGERPRINT attributes.
//!
//! Probes are sent from the engine's own UDP sockets so the observed mapping
//! is the one peers will see. Responses come back through the normal readers
//! and are matched to their request by [`StunTracker`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub use meshpath_transport::classify::{STUN_HEADER_SIZE as HEADER_SIZE, STUN_MAGIC_COOKIE as MAGIC_COOKIE, looks_like_stun};

/// FINGERPRINT XOR constant ("STUN")
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// SOFTWARE attribute value sent with every request
pub const SOFTWARE: &str = "meshpath";

/// STUN transaction id
pub type TransactionId = [u8; 12];

/// STUN error types
#[derive(Debug, thiserror::Error)]
pub enum StunError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Probe couldn't be sent on the engine socket
    #[error("transport error: {0}")]
    Transport(#[from] meshpath_transport::TransportError),
    /// Query timeout
    #[error("STUN query timeout")]
    Timeout,
    /// Invalid message format
    #[error("STUN message too short")]
    MessageTooShort,
    /// Invalid magic cookie
    #[error("Invalid STUN magic cookie")]
    InvalidMagicCookie,
    /// Invalid message type
    #[error("Invalid STUN message type")]
    InvalidMessageType,
    /// Invalid attribute
    #[error("Invalid STUN attribute")]
    InvalidAttribute,
    /// Missing required attribute
    #[error("Missing required STUN attribute")]
    MissingAttribute,
    /// Fingerprint mismatch
    #[error("FINGERPRINT verification failed")]
    FingerprintMismatch,
    /// Randomness unavailable for a transaction id
    #[error("random number generation failed")]
    Random,
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

impl StunMessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }
}

/// Binding is the only method we speak.
const METHOD_BINDING: u16 = 0x0001;

/// Encode method and class into a message type (RFC 5389 Section 6).
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn encode_type(method: u16, class: StunMessageClass) -> u16 {
    let class_bits = class.bits();
    (method & 0x0F)
        | ((class_bits & 0x01) << 4)
        | ((method & 0x70) << 1)
        | ((class_bits & 0x02) << 7)
        | ((method & 0xF80) << 2)
}

fn decode_type(msg_type: u16) -> Result<StunMessageClass, StunError> {
    let class_bits = ((msg_type >> 4) & 0x01) | (((msg_type >> 8) & 0x01) << 1);
    let class = match class_bits {
        0b00 => StunMessageClass::Request,
        0b01 => StunMessageClass::Indication,
        0b10 => StunMessageClass::SuccessResponse,
        _ => StunMessageClass::ErrorResponse,
    };
    let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
    if method != METHOD_BINDING {
        return Err(StunError::InvalidMessageType);
    }
    Ok(class)
}

/// STUN attribute types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// Mapped address (0x0001), sent by RFC 3489 servers
    MappedAddress(SocketAddr),
    /// XOR-Mapped address (0x0020), preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddr),
    /// Software identifier (0x8022)
    Software(String),
    /// Fingerprint (0x8028), CRC-32
    Fingerprint(u32),
    /// Unknown attribute type
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => 0x0001,
            Self::XorMappedAddress(_) => 0x0020,
            Self::Software(_) => 0x8022,
            Self::Fingerprint(_) => 0x8028,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &TransactionId) -> Vec<u8> {
        let value = self.encode_value(transaction_id);
        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&value);

        // Padding to 4-byte boundary
        let padding = (4 - (value.len() % 4)) % 4;
        bytes.extend(std::iter::repeat_n(0, padding));
        bytes
    }

    fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) => encode_address(*addr, None),
            Self::XorMappedAddress(addr) => encode_address(*addr, Some(transaction_id)),
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Fingerprint(f) => f.to_be_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, StunError> {
        match attr_type {
            0x0001 => decode_address(value, None).map(Self::MappedAddress),
            0x0020 => decode_address(value, Some(transaction_id)).map(Self::XorMappedAddress),
            0x8022 => Ok(Self::Software(String::from_utf8_lossy(value).to_string())),
            0x8028 => {
                let bytes: [u8; 4] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::Fingerprint(u32::from_be_bytes(bytes)))
            }
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

/// XOR key for an address: the cookie, followed by the transaction id for IPv6.
fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_address(addr: SocketAddr, xor: Option<&TransactionId>) -> Vec<u8> {
    let key = xor.map(xor_key);
    let mut value = vec![0, if addr.is_ipv4() { 0x01 } else { 0x02 }];
    let port = match key {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    value.extend_from_slice(&port.to_be_bytes());

    let ip: Vec<u8> = match addr.ip() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    for (i, b) in ip.iter().enumerate() {
        value.push(key.map_or(*b, |k| b ^ k[i]));
    }
    value
}

fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let key = xor.map(xor_key);
    let raw_port = u16::from_be_bytes([value[2], value[3]]);
    let port = match key {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    let unxor = |i: usize| key.map_or(value[4 + i], |k| value[4 + i] ^ k[i]);

    let ip = match value[1] {
        0x01 if value.len() >= 8 => {
            IpAddr::V4(Ipv4Addr::new(unxor(0), unxor(1), unxor(2), unxor(3)))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = unxor(i);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: TransactionId,
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new Binding Request with a random transaction id, a SOFTWARE
    /// attribute and a FINGERPRINT.
    ///
    /// # Errors
    ///
    /// Returns [`StunError::Random`] if no transaction id can be generated.
    pub fn binding_request() -> Result<Self, StunError> {
        let transaction_id =
            meshpath_crypto::random::random_tx_id().map_err(|_| StunError::Random)?;
        let mut msg = Self {
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: vec![StunAttribute::Software(SOFTWARE.to_string())],
        };
        msg.add_fingerprint();
        Ok(msg)
    }

    /// Binding success response reporting `mapped` as the observed source.
    #[must_use]
    pub fn binding_response(transaction_id: TransactionId, mapped: SocketAddr) -> Self {
        Self {
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(&self.attributes, None)
    }

    /// Encode a header plus `attributes`. `extra_len` overrides the length
    /// field to account for attributes appended afterwards.
    fn encode_with(&self, attributes: &[StunAttribute], extra_len: Option<usize>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 32);
        bytes.extend_from_slice(&encode_type(METHOD_BINDING, self.message_class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in attributes {
            bytes.extend_from_slice(&attr.encode(&self.transaction_id));
        }

        let msg_length = bytes.len() - HEADER_SIZE + extra_len.unwrap_or(0);
        bytes[2..4].copy_from_slice(&(msg_length as u16).to_be_bytes());
        bytes
    }

    /// Decode message from bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed. Attributes that fail to
    /// parse are skipped.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);
        let message_class = decode_type(msg_type)?;

        let end = (HEADER_SIZE + msg_length).min(bytes.len());
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_length > end {
                break;
            }

            let value = &bytes[offset..offset + attr_length];
            if let Ok(attr) = StunAttribute::decode(attr_type, value, &transaction_id) {
                attributes.push(attr);
            }
            offset += attr_length + (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// The reflexive address: XOR-MAPPED-ADDRESS, else MAPPED-ADDRESS.
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let mut fallback = None;
        for attr in &self.attributes {
            match attr {
                StunAttribute::XorMappedAddress(addr) => return Some(*addr),
                StunAttribute::MappedAddress(addr) => fallback = Some(*addr),
                _ => {}
            }
        }
        fallback
    }

    /// Append a FINGERPRINT, replacing any existing one.
    pub fn add_fingerprint(&mut self) {
        self.attributes
            .retain(|attr| !matches!(attr, StunAttribute::Fingerprint(_)));
        let bytes = self.encode_with(&self.attributes, Some(8));
        let fingerprint = crc32(&bytes) ^ FINGERPRINT_XOR;
        self.attributes.push(StunAttribute::Fingerprint(fingerprint));
    }

    /// Verify the FINGERPRINT attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if FINGERPRINT is missing or does not match.
    pub fn verify_fingerprint(&self) -> Result<(), StunError> {
        let Some(StunAttribute::Fingerprint(value)) = self.attributes.last() else {
            return Err(StunError::MissingAttribute);
        };
        let rest = &self.attributes[..self.attributes.len() - 1];
        let bytes = self.encode_with(rest, Some(8));
        if crc32(&bytes) ^ FINGERPRINT_XOR == *value {
            Ok(())
        } else {
            Err(StunError::FingerprintMismatch)
        }
    }
}

/// CRC-32 (IEEE, reflected, polynomial 0xEDB88320) as RFC 5389 requires.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

// ============================================================================
// Transaction tracking
// ============================================================================

/// A matched STUN binding response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunReply {
    /// Our address as observed by the server
    pub mapped: SocketAddr,
    /// When the reply was read off the socket
    pub received_at: Instant,
}

/// Outstanding STUN transactions, keyed by transaction id.
///
/// The prober registers a transaction before sending; the engine's socket
/// readers hand every STUN datagram to [`StunTracker::handle_packet`].
#[derive(Debug, Default)]
pub struct StunTracker {
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<StunReply>>>,
}

impl StunTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transaction_id` and get the receiver for its reply.
    pub fn register(&self, transaction_id: TransactionId) -> oneshot::Receiver<StunReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction_id, tx);
        rx
    }

    /// Forget a transaction (timed out or abandoned).
    pub fn cancel(&self, transaction_id: &TransactionId) {
        self.pending.lock().remove(transaction_id);
    }

    /// Feed an inbound STUN packet. Returns whether it matched a transaction.
    pub fn handle_packet(&self, packet: &[u8], received_at: Instant) -> bool {
        let msg = match StunMessage::decode(packet) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::trace!("dropping malformed STUN packet: {e}");
                return false;
            }
        };
        if msg.message_class != StunMessageClass::SuccessResponse {
            return false;
        }
        let Some(mapped) = msg.mapped_address() else {
            return false;
        };
        let Some(tx) = self.pending.lock().remove(&msg.transaction_id) else {
            tracing::trace!("unsolicited STUN response");
            return false;
        };
        tx.send(StunReply {
            mapped,
            received_at,
        })
        .is_ok()
    }

    /// Number of outstanding transactions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
