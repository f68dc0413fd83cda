//! PRUDPv0 레이아웃
//!
//! 매직 없음. 마지막에 access key 합으로 시드한 체크섬이 붙는다.

use bytes::{BufMut, Bytes, BytesMut};

use super::{fixed_signature, split_type_flags, Reader, SignatureKeys, WireFormat};
use crate::crypto;
use crate::packet::{Dialect, Packet, PacketFlags, PacketType, VirtualPort};
use crate::{Config, Error, Result};

const SIGNATURE_SIZE: usize = 4;

/// 세션 키/페이로드가 비어 있을 때의 고정 서명
const EMPTY_DATA_SIGNATURE: u32 = 0x1234_5678;

/// PRUDPv0 포맷
pub struct V0Format;

impl V0Format {
    /// 체크섬 계산 (체크섬 앞까지의 모든 바이트 대상)
    pub fn checksum(config: &Config, data: &[u8]) -> u32 {
        let key_sum = config.access_key_sum();

        if config.v0.enhanced_checksum {
            let mut padded = data.to_vec();
            padded.resize((data.len() + 3) & !3, 0);
            return padded
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .fold(key_sum & 0xFF, u32::wrapping_add);
        }

        let words = data.len() / 4;
        let temp = data[..words * 4]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0u32, u32::wrapping_add);

        let tail = data[words * 4..]
            .iter()
            .map(|&b| u32::from(b))
            .fold(key_sum, u32::wrapping_add);

        temp.to_le_bytes()
            .iter()
            .map(|&b| u32::from(b))
            .fold(tail, u32::wrapping_add)
            & 0xFF
    }

    fn has_connection_signature(packet_type: PacketType) -> bool {
        matches!(packet_type, PacketType::Syn | PacketType::Connect)
    }

    fn write_type_flags(buf: &mut BytesMut, packet: &Packet, config: &Config) {
        if config.v0.quazal_mode {
            buf.put_u8(packet.packet_type as u8 | ((packet.flags.bits() as u8) << 3));
        } else {
            buf.put_u16_le(packet.packet_type as u16 | (packet.flags.bits() << 4));
        }
    }
}

impl WireFormat for V0Format {
    fn decode(&self, reader: &mut Reader<'_>, config: &Config) -> Result<Packet> {
        let start = reader.position();
        let checksum_size = config.v0.checksum_size();

        let source = VirtualPort::from_byte(reader.u8()?);
        let destination = VirtualPort::from_byte(reader.u8()?);
        let (packet_type, flags) = if config.v0.quazal_mode {
            split_type_flags(u16::from(reader.u8()?), 3)?
        } else {
            split_type_flags(reader.u16_le()?, 4)?
        };
        let flags = PacketFlags::from_bits_retain(flags);
        let session_id = reader.u8()?;
        let signature = reader.take(SIGNATURE_SIZE)?;
        let sequence_id = reader.u16_le()?;

        let connection_signature = if Self::has_connection_signature(packet_type) {
            reader.take(SIGNATURE_SIZE)?
        } else {
            &[]
        };

        let fragment_id = if packet_type == PacketType::Data {
            reader.u8()?
        } else {
            0
        };

        let payload_len = if flags.contains(PacketFlags::HAS_SIZE) {
            reader.u16_le()? as usize
        } else {
            reader
                .remaining()
                .checked_sub(checksum_size)
                .ok_or(Error::Truncated {
                    needed: checksum_size,
                    remaining: reader.remaining(),
                })?
        };
        let payload = reader.take(payload_len)?;

        let expected = Self::checksum(config, reader.consumed_since(start));
        let got = if config.v0.enhanced_checksum {
            reader.u32_le()?
        } else {
            u32::from(reader.u8()?)
        };
        if expected != got {
            return Err(Error::ChecksumMismatch { expected, got });
        }

        let mut packet = Packet::new(Dialect::V0, packet_type, flags);
        packet.source = source;
        packet.destination = destination;
        packet.session_id = session_id;
        packet.sequence_id = sequence_id;
        packet.fragment_id = fragment_id;
        packet.connection_signature = Bytes::copy_from_slice(connection_signature);
        packet.payload = Bytes::copy_from_slice(payload);
        packet.signature = Bytes::copy_from_slice(signature);
        Ok(packet)
    }

    fn encode(&self, packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes {
        let signature = self.signature(packet, config, keys);

        let mut buf = BytesMut::with_capacity(16 + packet.payload.len());
        buf.put_u8(packet.source.to_byte());
        buf.put_u8(packet.destination.to_byte());
        Self::write_type_flags(&mut buf, packet, config);
        buf.put_u8(packet.session_id);
        buf.put_slice(&signature);
        buf.put_u16_le(packet.sequence_id);

        if Self::has_connection_signature(packet.packet_type) {
            buf.put_slice(&fixed_signature(&packet.connection_signature, SIGNATURE_SIZE));
        }
        if packet.packet_type == PacketType::Data {
            buf.put_u8(packet.fragment_id);
        }
        if packet.has_flag(PacketFlags::HAS_SIZE) {
            buf.put_u16_le(packet.payload.len() as u16);
        }
        buf.put_slice(&packet.payload);

        let checksum = Self::checksum(config, &buf);
        if config.v0.enhanced_checksum {
            buf.put_u32_le(checksum);
        } else {
            buf.put_u8(checksum as u8);
        }
        buf.freeze()
    }

    fn signature(&self, packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes {
        if !self.is_signed(packet, config) {
            return Bytes::from(fixed_signature(keys.connection_signature, SIGNATURE_SIZE));
        }

        let mut data = keys.session_key.to_vec();
        data.extend_from_slice(&packet.sequence_id.to_le_bytes());
        data.push(packet.fragment_id);
        data.extend_from_slice(&packet.payload);

        if data.is_empty() {
            return Bytes::copy_from_slice(&EMPTY_DATA_SIGNATURE.to_le_bytes());
        }

        let key = crypto::md5(config.access_key.as_bytes());
        let digest = crypto::hmac_md5(&key, &[&data]);
        Bytes::copy_from_slice(&digest[..SIGNATURE_SIZE])
    }

    fn is_signed(&self, packet: &Packet, config: &Config) -> bool {
        packet.packet_type == PacketType::Data && !config.legacy_connection_signature
    }
}
