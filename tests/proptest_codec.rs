//! 패킷 코덱 속성 테스트
//!
//! 세 방언 모두 decode(encode(p)) == p 가 필드 단위로 성립하는지,
//! 임의 바이트 입력에 디코더가 패닉하지 않는지 확인한다.

use bytes::Bytes;
use proptest::prelude::*;
use prudp::codec::{decode, decode_all, encode, verify, SignatureKeys};
use prudp::{Config, Dialect, Packet, PacketFlags, PacketType, StreamType, VirtualPort};

fn packet_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Syn),
        Just(PacketType::Connect),
        Just(PacketType::Data),
        Just(PacketType::Disconnect),
        Just(PacketType::Ping),
    ]
}

fn flags() -> impl Strategy<Value = PacketFlags> {
    (0u16..16).prop_map(PacketFlags::from_bits_retain)
}

fn port(max_port: u8) -> impl Strategy<Value = VirtualPort> {
    (1u8..=11, 0u8..=max_port).prop_map(|(stream_type, port)| VirtualPort::new(StreamType(stream_type), port))
}

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// 와이어에 실리지 않는 필드는 방언 규칙에 맞춰 정리
fn normalize(mut packet: Packet) -> Packet {
    let is_handshake = matches!(packet.packet_type, PacketType::Syn | PacketType::Connect);

    if packet.packet_type != PacketType::Data {
        packet.fragment_id = 0;
    }

    match packet.dialect {
        Dialect::V0 => {
            packet.substream_id = 0;
            packet.options = Default::default();
            if !is_handshake {
                packet.connection_signature = Bytes::new();
            }
        }
        Dialect::V1 => {
            if is_handshake {
                packet.options.supported_functions &= 0x00FF_FFFF;
                if packet.packet_type != PacketType::Connect {
                    packet.options.initial_unreliable_sequence_id = 0;
                }
            } else {
                packet.options = Default::default();
                packet.connection_signature = Bytes::new();
            }
        }
        Dialect::Lite => {
            packet.session_id = 0;
            packet.substream_id = 0;
            packet.options.max_substream_id = 0;
            packet.options.initial_unreliable_sequence_id = 0;
            if is_handshake {
                packet.options.supported_functions &= 0x00FF_FFFF;
            } else {
                packet.options.supported_functions = 0;
                packet.options.minor_version = 0;
            }
            let ack = packet.has_flag(PacketFlags::ACK);
            let signed = match packet.packet_type {
                PacketType::Syn => ack,
                PacketType::Connect => !ack,
                _ => false,
            };
            if !signed {
                packet.connection_signature = Bytes::new();
            }
        }
    }

    packet
}

fn arbitrary_packet(dialect: Dialect) -> impl Strategy<Value = Packet> {
    let max_port = dialect.max_port();
    let signature_size = dialect.connection_signature_size();

    (
        packet_type(),
        flags(),
        port(max_port),
        port(max_port),
        (any::<u8>(), any::<u8>(), any::<u16>(), any::<u8>()),
        prop::collection::vec(any::<u8>(), signature_size),
        (any::<u32>(), any::<u8>(), any::<u8>(), any::<u16>()),
        payload(),
    )
        .prop_map(
            move |(packet_type, flags, source, destination, ids, signature, options, payload)| {
                let mut packet = Packet::new(dialect, packet_type, flags);
                packet.source = source;
                packet.destination = destination;
                packet.session_id = ids.0;
                packet.substream_id = ids.1;
                packet.sequence_id = ids.2;
                packet.fragment_id = ids.3;
                packet.connection_signature = Bytes::from(signature);
                packet.options.supported_functions = options.0;
                packet.options.minor_version = options.1;
                packet.options.max_substream_id = options.2;
                packet.options.initial_unreliable_sequence_id = options.3;
                packet.payload = Bytes::from(payload);
                normalize(packet)
            },
        )
}

fn dialect() -> impl Strategy<Value = Dialect> {
    prop_oneof![Just(Dialect::V0), Just(Dialect::V1), Just(Dialect::Lite)]
}

fn assert_same_fields(decoded: &Packet, original: &Packet) -> Result<(), TestCaseError> {
    prop_assert_eq!(decoded.dialect, original.dialect);
    prop_assert_eq!(decoded.packet_type, original.packet_type);
    prop_assert_eq!(decoded.flags, original.flags);
    prop_assert_eq!(decoded.source, original.source);
    prop_assert_eq!(decoded.destination, original.destination);
    prop_assert_eq!(decoded.session_id, original.session_id);
    prop_assert_eq!(decoded.substream_id, original.substream_id);
    prop_assert_eq!(decoded.sequence_id, original.sequence_id);
    prop_assert_eq!(decoded.fragment_id, original.fragment_id);
    prop_assert_eq!(&decoded.connection_signature, &original.connection_signature);
    prop_assert_eq!(decoded.options, original.options);
    prop_assert_eq!(&decoded.payload, &original.payload);
    Ok(())
}

proptest! {
    #[test]
    fn packet_roundtrip(packet in dialect().prop_flat_map(arbitrary_packet)) {
        let config = Config::default().with_access_key("ridfebb9");
        let session_key = [0x42u8; 32];
        let signature = [0x24u8; 16];
        let keys = SignatureKeys::new(&session_key, &signature);

        let bytes = encode(&packet, &config, &keys);
        let allow_lite = packet.dialect == Dialect::Lite;
        let decoded = decode(&bytes, &config, allow_lite).unwrap();

        assert_same_fields(&decoded, &packet)?;
        prop_assert!(verify(&decoded, &config, &keys).is_ok());
    }

    #[test]
    fn v0_enhanced_checksum_roundtrip(packet in arbitrary_packet(Dialect::V0)) {
        let mut config = Config::default().with_access_key("6f599f81");
        config.v0.enhanced_checksum = true;

        let bytes = encode(&packet, &config, &SignatureKeys::default());
        let decoded = decode(&bytes, &config, false).unwrap();
        assert_same_fields(&decoded, &packet)?;
    }

    #[test]
    fn coalesced_v1_packets_split(first in arbitrary_packet(Dialect::V1), second in arbitrary_packet(Dialect::V1)) {
        let config = Config::default();
        let keys = SignatureKeys::default();

        let mut datagram = encode(&first, &config, &keys).to_vec();
        datagram.extend_from_slice(&encode(&second, &config, &keys));

        let packets = decode_all(&datagram, &config, false).unwrap();
        prop_assert_eq!(packets.len(), 2);
        assert_same_fields(&packets[0], &first)?;
        assert_same_fields(&packets[1], &second)?;
    }

    #[test]
    fn decode_arbitrary_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let config = Config::default();
        let _ = decode_all(&data, &config, true);
        let _ = decode_all(&data, &config, false);

        let mut quazal = Config::legacy_v0();
        quazal.v0.enhanced_checksum = true;
        let _ = decode_all(&data, &quazal, false);
    }

    #[test]
    fn v1_prefix_survives_arbitrary_tail(tail in prop::collection::vec(any::<u8>(), 0..128)) {
        let mut data = vec![0xEA, 0xD0, 0x01];
        data.extend_from_slice(&tail);
        let _ = decode_all(&data, &Config::default(), false);
    }
}
