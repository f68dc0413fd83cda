//! 패킷 코덱
//!
//! 방언별 레이아웃은 [`WireFormat`] 구현 하나씩으로 분리되어 있고,
//! 여기서는 선두 바이트로 방언을 고른 뒤 해당 구현에 위임한다.
//!
//! - 디코딩은 모든 읽기를 길이 검사하므로 임의 입력에 대해 패닉하지 않는다.
//! - 인코딩은 호출마다 서명을 새로 계산한다.

mod lite;
mod v0;
mod v1;

use bytes::{Buf, Bytes};

use crate::packet::{Dialect, Packet, PacketOptions, PacketType};
use crate::{Config, Error, Result};

pub use lite::LiteFormat;
pub use v0::V0Format;
pub use v1::V1Format;

/// 서명 계산에 쓰는 연결별 키 재료
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureKeys<'a> {
    pub session_key: &'a [u8],
    pub connection_signature: &'a [u8],
}

impl<'a> SignatureKeys<'a> {
    pub fn new(session_key: &'a [u8], connection_signature: &'a [u8]) -> Self {
        Self {
            session_key,
            connection_signature,
        }
    }
}

/// 방언 하나의 와이어 레이아웃
pub trait WireFormat: Send + Sync {
    /// 패킷 하나 디코딩 (reader는 다음 패킷 시작 위치로 이동)
    fn decode(&self, reader: &mut Reader<'_>, config: &Config) -> Result<Packet>;

    /// 패킷 인코딩 (서명은 새로 계산)
    fn encode(&self, packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes;

    /// 패킷 서명 계산. 서명이 없는 방언은 빈 값.
    fn signature(&self, packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes;

    /// 이 패킷이 서명 검증 대상인지
    fn is_signed(&self, packet: &Packet, config: &Config) -> bool;
}

/// 방언에 맞는 포맷 구현
pub fn wire_format(dialect: Dialect) -> &'static dyn WireFormat {
    match dialect {
        Dialect::V0 => &V0Format,
        Dialect::V1 => &V1Format,
        Dialect::Lite => &LiteFormat,
    }
}

/// 첫 패킷 하나 디코딩
pub fn decode(data: &[u8], config: &Config, allow_lite: bool) -> Result<Packet> {
    let dialect = Dialect::detect(data, allow_lite);
    let mut reader = Reader::new(data);
    wire_format(dialect).decode(&mut reader, config)
}

/// 데이터그램 하나에 이어 붙은 모든 패킷 디코딩
///
/// 중간에 하나라도 손상되면 전체를 거부한다 (경계를 신뢰할 수 없으므로).
pub fn decode_all(data: &[u8], config: &Config, allow_lite: bool) -> Result<Vec<Packet>> {
    let dialect = Dialect::detect(data, allow_lite);
    let format = wire_format(dialect);
    let mut reader = Reader::new(data);
    let mut packets = Vec::new();

    while reader.remaining() > 0 {
        packets.push(format.decode(&mut reader, config)?);
    }

    if packets.is_empty() {
        return Err(Error::MalformedPacket("빈 데이터그램".into()));
    }

    Ok(packets)
}

/// 패킷 인코딩
pub fn encode(packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Bytes {
    wire_format(packet.dialect).encode(packet, config, keys)
}

/// 수신 패킷 서명 검증
pub fn verify(packet: &Packet, config: &Config, keys: &SignatureKeys<'_>) -> Result<()> {
    let format = wire_format(packet.dialect);
    if !format.is_signed(packet, config) {
        return Ok(());
    }

    let expected = format.signature(packet, config, keys);
    if expected != packet.signature {
        return Err(Error::SignatureMismatch {
            sequence_id: packet.sequence_id,
        });
    }
    Ok(())
}

/// 길이 검사 바이트 리더
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// 이미 읽은 구간
    pub fn consumed_since(&self, start: usize) -> &'a [u8] {
        &self.data[start..self.pos]
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        let mut bytes = self.take(2)?;
        Ok(bytes.get_u16_le())
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_u32_le())
    }
}

/// 옵션 ID
pub(crate) mod option_id {
    pub const SUPPORTED_FUNCTIONS: u8 = 0;
    pub const CONNECTION_SIGNATURE: u8 = 1;
    pub const FRAGMENT_ID: u8 = 2;
    pub const INITIAL_UNRELIABLE_SEQUENCE_ID: u8 = 3;
    pub const MAX_SUBSTREAM_ID: u8 = 4;
}

/// v1/lite 공통 TLV 옵션 파싱 결과
#[derive(Debug, Default)]
pub(crate) struct DecodedOptions {
    pub options: PacketOptions,
    pub connection_signature: Option<Bytes>,
    pub fragment_id: Option<u8>,
}

/// TLV 옵션 파싱 (알 수 없는 ID는 길이만큼 건너뜀)
pub(crate) fn decode_options(data: &[u8]) -> Result<DecodedOptions> {
    let mut reader = Reader::new(data);
    let mut decoded = DecodedOptions::default();

    while reader.remaining() > 0 {
        let id = reader.u8()?;
        let size = reader.u8()? as usize;
        let value = reader.take(size)?;

        let expect = |wanted: usize| -> Result<()> {
            if size != wanted {
                return Err(Error::MalformedPacket(format!(
                    "옵션 {} 크기 불일치: expected {}, got {}",
                    id, wanted, size
                )));
            }
            Ok(())
        };

        match id {
            option_id::SUPPORTED_FUNCTIONS => {
                expect(4)?;
                let raw = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                decoded.options.minor_version = (raw & 0xFF) as u8;
                decoded.options.supported_functions = raw >> 8;
            }
            option_id::CONNECTION_SIGNATURE => {
                expect(16)?;
                decoded.connection_signature = Some(Bytes::copy_from_slice(value));
            }
            option_id::FRAGMENT_ID => {
                expect(1)?;
                decoded.fragment_id = Some(value[0]);
            }
            option_id::INITIAL_UNRELIABLE_SEQUENCE_ID => {
                expect(2)?;
                decoded.options.initial_unreliable_sequence_id =
                    u16::from_le_bytes([value[0], value[1]]);
            }
            option_id::MAX_SUBSTREAM_ID => {
                expect(1)?;
                decoded.options.max_substream_id = value[0];
            }
            _ => {}
        }
    }

    Ok(decoded)
}

/// 연결 서명을 고정 길이로 맞춤 (부족하면 0 채움)
pub(crate) fn fixed_signature(signature: &[u8], size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size];
    let len = signature.len().min(size);
    out[..len].copy_from_slice(&signature[..len]);
    out
}

/// 패킷 타입/플래그 필드 해석
pub(crate) fn split_type_flags(raw: u16, type_bits: u32) -> Result<(PacketType, u16)> {
    let mask = (1u16 << type_bits) - 1;
    let packet_type = PacketType::try_from(raw & mask)?;
    Ok((packet_type, raw >> type_bits))
}
