//! Inbound datagram classification.

/// Prefix of every discovery message: `"TS"` followed by U+1F4AC in UTF-8.
pub const DISCO_MAGIC: [u8; 6] = [b'T', b'S', 0xf0, 0x9f, 0x92, 0xac];

/// STUN magic cookie (RFC 5389) at bytes 4..8 of every STUN message.
pub const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of a STUN header.
pub const STUN_HEADER_SIZE: usize = 20;

/// What an inbound datagram carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A STUN message (binding response to one of our probes)
    Stun,
    /// A sealed discovery message
    Disco,
    /// Anything else: opaque tunnel data
    Data,
}

/// Classify a datagram by its leading bytes.
#[must_use]
pub fn classify(packet: &[u8]) -> PacketKind {
    if looks_like_stun(packet) {
        PacketKind::Stun
    } else if packet.starts_with(&DISCO_MAGIC) {
        PacketKind::Disco
    } else {
        PacketKind::Data
    }
}

/// STUN messages start with two zero bits and carry the magic cookie.
#[must_use]
pub fn looks_like_stun(packet: &[u8]) -> bool {
    packet.len() >= STUN_HEADER_SIZE
        && packet[0] & 0xC0 == 0
        && u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]) == STUN_MAGIC_COOKIE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stun() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x01;
        packet[1] = 0x01;
        packet[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(classify(&packet), PacketKind::Stun);

        // Too short to be STUN
        assert_eq!(classify(&packet[..19]), PacketKind::Data);
    }

    #[test]
    fn test_classify_disco() {
        let mut packet = DISCO_MAGIC.to_vec();
        packet.extend_from_slice(&[0u8; 80]);
        assert_eq!(classify(&packet), PacketKind::Disco);
        assert_eq!(&DISCO_MAGIC[2..], "💬".as_bytes());
    }

    #[test]
    fn test_classify_data() {
        // A WireGuard-style handshake initiation
        let mut packet = vec![0u8; 148];
        packet[0] = 1;
        assert_eq!(classify(&packet), PacketKind::Data);
        assert_eq!(classify(&[]), PacketKind::Data);
    }
}
