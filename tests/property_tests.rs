//! Property-based tests for the disco codec and path selection.
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

fn socket_addr() -> impl Strategy<Value = SocketAddr> {
    prop_oneof![
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
        (any::<[u8; 16]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)),
    ]
}

// ============================================================================
// Disco Codec Properties
// ============================================================================

mod disco_properties {
    use super::*;
    use meshpath_core::disco::{CallMeMaybe, DiscoError, Ping, Pong};
    use meshpath_core::{DiscoCodec, DiscoMessage};
    use meshpath_crypto::{DiscoPrivateKey, NodePublicKey, SharedKeyCache};
    use rand_core::OsRng;

    fn codec() -> DiscoCodec {
        DiscoCodec::new(SharedKeyCache::new(DiscoPrivateKey::generate(&mut OsRng)))
    }

    fn message() -> impl Strategy<Value = DiscoMessage> {
        prop_oneof![
            (any::<[u8; 12]>(), any::<[u8; 32]>()).prop_map(|(tx_id, key)| {
                DiscoMessage::Ping(Ping {
                    tx_id,
                    node_key: NodePublicKey::from_bytes(key),
                })
            }),
            (any::<[u8; 12]>(), socket_addr())
                .prop_map(|(tx_id, src)| DiscoMessage::Pong(Pong { tx_id, src })),
            prop::collection::vec(socket_addr(), 0..16)
                .prop_map(|endpoints| DiscoMessage::CallMeMaybe(CallMeMaybe { endpoints })),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// A message sealed for a peer opens to the same message, attributed
        /// to the sender
        #[test]
        fn sealed_message_opens_for_recipient(msg in message()) {
            let (a, b) = (codec(), codec());
            let packet = a.encode(&b.local_key(), &msg).unwrap();
            let (sender, decoded) = b.decode(&packet).unwrap();
            prop_assert_eq!(sender, a.local_key());
            prop_assert_eq!(decoded, msg);
        }

        /// Only the addressed key can open a packet
        #[test]
        fn third_party_cannot_open(msg in message()) {
            let (a, b, c) = (codec(), codec(), codec());
            let packet = a.encode(&b.local_key(), &msg).unwrap();
            prop_assert_eq!(c.decode(&packet).unwrap_err(), DiscoError::BadKey);
        }

        /// Flipping any byte never yields a different accepted message
        #[test]
        fn corrupted_packet_never_accepted(msg in message(), pos in any::<prop::sample::Index>(), flip in 1u8..=255) {
            let (a, b) = (codec(), codec());
            let mut packet = a.encode(&b.local_key(), &msg).unwrap();
            let i = pos.index(packet.len());
            packet[i] ^= flip;
            prop_assert!(b.decode(&packet).is_err());
        }

        /// Decoding arbitrary bytes never panics
        #[test]
        fn decode_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = codec().decode(&data);
        }
    }
}

// ============================================================================
// Address Book Properties
// ============================================================================

mod addrbook_properties {
    use super::*;
    use meshpath_core::addrbook::{AddressBook, BestAddr, Preference};
    use tokio::time::Instant;

    const ACTIVE: Duration = Duration::from_secs(45);

    proptest! {
        /// Re-delivered pings are flagged; fresh transaction ids are not, and
        /// neither creates a second entry
        #[test]
        fn duplicate_pings_detected(addr in socket_addr(), txs in prop::collection::vec(any::<[u8; 12]>(), 1..20)) {
            let now = Instant::now();
            let mut book = AddressBook::new(8, ACTIVE);
            let mut last = None;
            for tx in txs {
                let dup = book.add_candidate(addr, tx, now);
                prop_assert_eq!(dup, last == Some(tx));
                prop_assert!(book.add_candidate(addr, tx, now));
                last = Some(tx);
            }
            prop_assert_eq!(book.len(), 1);
        }

        /// Pinged-only candidates expire after the active timeout; CallMeMaybe
        /// grants and advertised endpoints never do
        #[test]
        fn prune_respects_grants(
            pinged in socket_addr(),
            granted in socket_addr(),
            advertised in socket_addr(),
            elapsed_ms in 0u64..200_000,
        ) {
            prop_assume!(pinged != granted && pinged != advertised && granted != advertised);
            prop_assume!(!matches!(granted, SocketAddr::V6(a) if (a.ip().segments()[0] & 0xffc0) == 0xfe80));
            let start = Instant::now();
            let mut book = AddressBook::new(8, ACTIVE);
            book.update_from_network_map(&[advertised], start);
            book.add_candidate(pinged, [1; 12], start);
            book.handle_call_me_maybe(&[granted], start);

            let elapsed = Duration::from_millis(elapsed_ms);
            let removed = book.prune(start + elapsed);
            prop_assert!(book.contains(&granted));
            prop_assert!(book.contains(&advertised));
            prop_assert_eq!(removed.contains(&pinged), elapsed > ACTIVE);
        }

        /// The best address is only replaced by a strictly faster one beyond
        /// the hysteresis margin
        #[test]
        fn hysteresis_blocks_marginal_switches(
            best_ms in 1u64..1000,
            ratio in 0.0f64..2.0,
            a in any::<[u8; 4]>(),
            b in any::<[u8; 4]>(),
        ) {
            prop_assume!(a != b);
            let pref = Preference::default();
            let best = BestAddr {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(a)), 41641),
                latency: Duration::from_millis(best_ms),
                confirmed_at: Instant::now(),
                trust_until: None,
            };
            let candidate = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(b)), 41641);
            let latency = best.latency.mul_f64(ratio);
            let better = pref.is_better(&candidate, latency, Some(&best));
            prop_assert_eq!(better, latency.as_secs_f64() < best.latency.as_secs_f64() * pref.hysteresis);
            prop_assert!(!pref.is_better(&best.addr, Duration::ZERO, Some(&best)));
        }
    }
}

// ============================================================================
// Health Properties
// ============================================================================

mod health_properties {
    use super::*;
    use meshpath_core::HealthStatus;

    proptest! {
        #[test]
        fn health_ok_only_when_everything_works(logged_in: bool, udp: bool, relay: bool) {
            let h = HealthStatus::from_flags(logged_in, udp, relay);
            prop_assert_eq!(h.is_ok(), logged_in && udp && relay);
            prop_assert_eq!(h == HealthStatus::LoggedOut, !logged_in);
        }
    }
}
