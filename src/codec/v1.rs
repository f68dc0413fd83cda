//! PRUDPv1 레이아웃
//!
//! `EA D0 | header(12) | signature(16) | options | payload`

use bytes::{BufMut, Bytes, BytesMut};

use super::{decode_options, fixed_signature, option_id, split_type_flags, Reader, SignatureKeys, WireFormat};
use crate::crypto;
use crate::packet::{Dialect, Packet, PacketFlags, PacketType, VirtualPort};
use crate::{Config, Error, Result, V1_MAGIC};

const VERSION: u8 = 1;
const HEADER_SIZE: usize = 12;
const SIGNATURE_SIZE: usize = 16;

/// PRUDPv1 포맷
pub struct V1Format;

impl V1Format {
    fn encode_options(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();

        match packet.packet_type {
            PacketType::Syn | PacketType::Connect => {
                buf.put_u8(option_id::SUPPORTED_FUNCTIONS);
                buf.put_u8(4);
                buf.put_u32_le(
                    u32::from(packet.options.minor_version)
                        | (packet.options.supported_functions << 8),
                );

                buf.put_u8(option_id::CONNECTION_SIGNATURE);
                buf.put_u8(16);
                buf.put_slice(&fixed_signature(&packet.connection_signature, 16));

                if packet.packet_type == PacketType::Connect {
                    buf.put_u8(option_id::INITIAL_UNRELIABLE_SEQUENCE_ID);
                    buf.put_u8(2);
                    buf.put_u16_le(packet.options.initial_unreliable_sequence_id);
                }

                buf.put_u8(option_id::MAX_SUBSTREAM_ID);
                buf.put_u8(1);
                buf.put_u8(packet.options.max_substream_id);
            }
            PacketType::Data => {
                buf.put_u8(option_id::FRAGMENT_ID);
                buf.put_u8(1);
                buf.put_u8(packet.fragment_id);
            }
            _ => {}
        }

        buf
    }

    fn encode_header(packet: &Packet, options_len: usize) -> [u8; HEADER_SIZE] {
        let type_flags = packet.packet_type as u16 | (packet.flags.bits() << 4);
        let payload_len = packet.payload.len() as u16;

        let mut header = [0u8; HEADER_SIZE];
        header[0] = VERSION;
        header[1] = options_len as u8;
        header[2..4].copy_from_slice(&payload_len.to_le_bytes());
        header[4] = packet.source.to_byte();
        header[5] = packet.destination.to_byte();
        header[6..8].copy_from_slice(&type_flags.to_le_bytes());
        header[8] = packet.session_id;
        header[9] = packet.substream_id;
        header[10..12].copy_from_slice(&packet.sequence_id.to_le_bytes());
        header
    }

    fn compute_signature(
        config: &Config,
        keys: &SignatureKeys<'_>,
        header: &[u8; HEADER_SIZE],
        options: &[u8],
        payload: &[u8],
    ) -> [u8; SIGNATURE_SIZE] {
        let access_key = config.access_key.as_bytes();
        let key = crypto::md5(access_key);
        let key_sum = config.access_key_sum().to_le_bytes();

        crypto::hmac_md5(
            &key,
            &[
                &header[4..],
                keys.session_key,
                &key_sum,
                keys.connection_signature,
                options,
                payload,
            ],
        )
    }
}

impl WireFormat for V1Format {
    fn decode(&self, reader: &mut Reader<'_>, _config: &Config) -> Result<Packet> {
        let magic = reader.take(2)?;
        if magic != V1_MAGIC {
            return Err(Error::MalformedPacket(format!(
                "v1 매직 불일치: {:02X}{:02X}",
                magic[0], magic[1]
            )));
        }

        let version = reader.u8()?;
        if version != VERSION {
            return Err(Error::MalformedPacket(format!(
                "지원하지 않는 v1 버전: {}",
                version
            )));
        }

        let options_len = reader.u8()? as usize;
        let payload_len = reader.u16_le()? as usize;
        let source = VirtualPort::from_byte(reader.u8()?);
        let destination = VirtualPort::from_byte(reader.u8()?);
        let (packet_type, flags) = split_type_flags(reader.u16_le()?, 4)?;
        let session_id = reader.u8()?;
        let substream_id = reader.u8()?;
        let sequence_id = reader.u16_le()?;
        let signature = reader.take(SIGNATURE_SIZE)?;

        // 길이 필드를 먼저 검증한 뒤 읽음
        if reader.remaining() < options_len + payload_len {
            return Err(Error::Truncated {
                needed: options_len + payload_len,
                remaining: reader.remaining(),
            });
        }
        let options = decode_options(reader.take(options_len)?)?;
        let payload = reader.take(payload_len)?;

        let mut packet = Packet::new(Dialect::V1, packet_type, PacketFlags::from_bits_retain(flags));
        packet.source = source;
        packet.destination = destination;
        packet.session_id = session_id;
        packet.substream_id = substream_id;
        packet.sequence_id = sequence_id;
        packet.fragment_id = options.fragment_id.unwrap_or(0);
        packet.connection_signature = options.connection_signature.unwrap_or_default();
        packet.options = options.options;
        packet.payload = Bytes::copy_from_slice(payload);
        packet.signature = Bytes::copy_from_slice(signature);
        Ok(packet)
    }

    fn encode(&self, packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes {
        let options = Self::encode_options(packet);
        let header = Self::encode_header(packet, options.len());
        let signature = Self::compute_signature(config, keys, &header, &options, &packet.payload);

        let mut buf = BytesMut::with_capacity(
            2 + HEADER_SIZE + SIGNATURE_SIZE + options.len() + packet.payload.len(),
        );
        buf.put_slice(&V1_MAGIC);
        buf.put_slice(&header);
        buf.put_slice(&signature);
        buf.put_slice(&options);
        buf.put_slice(&packet.payload);
        buf.freeze()
    }

    fn signature(&self, packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes {
        let options = Self::encode_options(packet);
        let header = Self::encode_header(packet, options.len());
        let signature = Self::compute_signature(config, keys, &header, &options, &packet.payload);
        Bytes::copy_from_slice(&signature)
    }

    fn is_signed(&self, _packet: &Packet, _config: &Config) -> bool {
        true
    }
}
