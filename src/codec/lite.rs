//! PRUDPLite 레이아웃 (WebSocket 전용)
//!
//! `80 | options_len | payload_len | stream types | src port | dst port |
//! fragment | type/flags | seq | options | payload`. 서명 없음.

use bytes::{BufMut, Bytes, BytesMut};

use super::{decode_options, fixed_signature, option_id, split_type_flags, Reader, SignatureKeys, WireFormat};
use crate::packet::{Dialect, Packet, PacketFlags, PacketType, StreamType, VirtualPort};
use crate::{Config, Error, Result, LITE_MAGIC};

/// PRUDPLite 포맷
pub struct LiteFormat;

impl LiteFormat {
    fn carries_signature(packet: &Packet) -> bool {
        let ack = packet.has_flag(PacketFlags::ACK);
        match packet.packet_type {
            PacketType::Syn => ack,
            PacketType::Connect => !ack,
            _ => false,
        }
    }

    fn encode_options(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();

        if matches!(packet.packet_type, PacketType::Syn | PacketType::Connect) {
            buf.put_u8(option_id::SUPPORTED_FUNCTIONS);
            buf.put_u8(4);
            buf.put_u32_le(
                u32::from(packet.options.minor_version) | (packet.options.supported_functions << 8),
            );
        }

        if Self::carries_signature(packet) {
            buf.put_u8(option_id::CONNECTION_SIGNATURE);
            buf.put_u8(16);
            buf.put_slice(&fixed_signature(&packet.connection_signature, 16));
        }

        buf
    }
}

impl WireFormat for LiteFormat {
    fn decode(&self, reader: &mut Reader<'_>, _config: &Config) -> Result<Packet> {
        let magic = reader.u8()?;
        if magic != LITE_MAGIC {
            return Err(Error::MalformedPacket(format!(
                "lite 태그 불일치: {:02X}",
                magic
            )));
        }

        let options_len = reader.u8()? as usize;
        let payload_len = reader.u16_le()? as usize;
        let stream_types = reader.u8()?;
        let source_port = reader.u8()?;
        let destination_port = reader.u8()?;
        let fragment_id = reader.u8()?;
        let (packet_type, flags) = split_type_flags(reader.u16_le()?, 4)?;
        let sequence_id = reader.u16_le()?;

        if reader.remaining() < options_len + payload_len {
            return Err(Error::Truncated {
                needed: options_len + payload_len,
                remaining: reader.remaining(),
            });
        }
        let options = decode_options(reader.take(options_len)?)?;
        let payload = reader.take(payload_len)?;

        let mut packet = Packet::new(Dialect::Lite, packet_type, PacketFlags::from_bits_retain(flags));
        packet.source = VirtualPort::new(StreamType(stream_types >> 4), source_port);
        packet.destination = VirtualPort::new(StreamType(stream_types & 0x0F), destination_port);
        packet.sequence_id = sequence_id;
        packet.fragment_id = fragment_id;
        packet.connection_signature = options.connection_signature.unwrap_or_default();
        packet.options = options.options;
        packet.payload = Bytes::copy_from_slice(payload);
        Ok(packet)
    }

    fn encode(&self, packet: &Packet, _config: &Config, _keys: &SignatureKeys<'_>) -> Bytes {
        let options = Self::encode_options(packet);
        let type_flags = packet.packet_type as u16 | (packet.flags.bits() << 4);

        let mut buf = BytesMut::with_capacity(12 + options.len() + packet.payload.len());
        buf.put_u8(LITE_MAGIC);
        buf.put_u8(options.len() as u8);
        buf.put_u16_le(packet.payload.len() as u16);
        buf.put_u8((packet.source.stream_type.0 << 4) | (packet.destination.stream_type.0 & 0x0F));
        buf.put_u8(packet.source.port);
        buf.put_u8(packet.destination.port);
        buf.put_u8(packet.fragment_id);
        buf.put_u16_le(type_flags);
        buf.put_u16_le(packet.sequence_id);
        buf.put_slice(&options);
        buf.put_slice(&packet.payload);
        buf.freeze()
    }

    fn signature(&self, _packet: &Packet, _config: &Config, _keys: &SignatureKeys<'_>) -> Bytes {
        Bytes::new()
    }

    fn is_signed(&self, _packet: &Packet, _config: &Config) -> bool {
        false
    }
}
