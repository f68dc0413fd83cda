//! 패킷 정의
//!
//! 세 가지 방언(v0, v1, lite)에 공통인 패킷 표현.
//! 패킷은 값 객체이며, 재전송은 원본을 수정하지 않고 복사본을 만든다.

use std::fmt;
use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;

use crate::{Error, Result, LITE_MAGIC, V1_MAGIC};

/// 와이어 방언
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// 레거시 (매직 없음)
    V0,
    /// 2바이트 매직 `EA D0`
    V1,
    /// WebSocket 전용, 1바이트 태그 `0x80`
    Lite,
}

impl Dialect {
    /// 선두 바이트로 방언 판별
    ///
    /// lite 태그는 WebSocket 전송에서만 인정한다 (v0 포트 바이트와 겹칠 수 있음).
    pub fn detect(data: &[u8], allow_lite: bool) -> Dialect {
        if allow_lite && data.first() == Some(&LITE_MAGIC) {
            Dialect::Lite
        } else if data.len() >= 2 && data[..2] == V1_MAGIC {
            Dialect::V1
        } else {
            Dialect::V0
        }
    }

    /// 허용하는 소스 포트 번호 최대값
    ///
    /// v0/v1은 포트 바이트의 하위 4비트만 쓴다. lite는 포트를 1바이트로
    /// 따로 싣기 때문에 32까지 받는다.
    pub fn max_port(&self) -> u8 {
        match self {
            Dialect::Lite => 32,
            Dialect::V0 | Dialect::V1 => 0x0F,
        }
    }

    /// 연결 서명 길이
    pub fn connection_signature_size(&self) -> usize {
        match self {
            Dialect::V0 => 4,
            Dialect::V1 | Dialect::Lite => 16,
        }
    }

    /// 페이로드 암호화 여부 (lite는 WSS 위라서 암호화하지 않음)
    pub fn encrypts_payload(&self) -> bool {
        !matches!(self, Dialect::Lite)
    }
}

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Syn = 0,
    Connect = 1,
    Data = 2,
    Disconnect = 3,
    Ping = 4,
}

impl TryFrom<u16> for PacketType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Syn),
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Data),
            3 => Ok(PacketType::Disconnect),
            4 => Ok(PacketType::Ping),
            other => Err(Error::MalformedPacket(format!(
                "알 수 없는 패킷 타입: {}",
                other
            ))),
        }
    }
}

bitflags! {
    /// 패킷 플래그
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u16 {
        const ACK = 0x001;
        const RELIABLE = 0x002;
        const NEEDS_ACK = 0x004;
        const HAS_SIZE = 0x008;
        const MULTI_ACK = 0x200;
    }
}

impl PacketFlags {
    /// ACK 계열 패킷 여부
    pub fn is_ack(&self) -> bool {
        self.intersects(PacketFlags::ACK | PacketFlags::MULTI_ACK)
    }
}

/// 가상 포트 스트림 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamType(pub u8);

impl StreamType {
    pub const DO: StreamType = StreamType(1);
    pub const RV: StreamType = StreamType(2);
    pub const OLD_RV_SEC: StreamType = StreamType(3);
    pub const SB_MGMT: StreamType = StreamType(4);
    pub const NAT: StreamType = StreamType(5);
    pub const SESSION_DISCOVERY: StreamType = StreamType(6);
    pub const NAT_ECHO: StreamType = StreamType(7);
    pub const ROUTING: StreamType = StreamType(8);
    pub const GAME: StreamType = StreamType(9);
    pub const RV_SECURE: StreamType = StreamType(10);
    pub const RELAY: StreamType = StreamType(11);

    /// 유효 범위 (Relay 이하)
    pub fn is_valid(&self) -> bool {
        self.0 <= Self::RELAY.0
    }
}

/// 가상 포트 (스트림 타입 + 포트 번호)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualPort {
    pub stream_type: StreamType,
    pub port: u8,
}

impl VirtualPort {
    pub fn new(stream_type: StreamType, port: u8) -> Self {
        Self { stream_type, port }
    }

    /// v0/v1 바이트 표현 (상위 4비트 타입, 하위 4비트 포트)
    pub fn to_byte(&self) -> u8 {
        (self.stream_type.0 << 4) | (self.port & 0x0F)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            stream_type: StreamType(byte >> 4),
            port: byte & 0x0F,
        }
    }
}

impl fmt::Display for VirtualPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream_type.0, self.port)
    }
}

/// SYN/CONNECT 협상 옵션
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketOptions {
    pub supported_functions: u32,
    pub minor_version: u8,
    pub max_substream_id: u8,
    pub initial_unreliable_sequence_id: u16,
}

/// 방언 독립 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dialect: Dialect,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub source: VirtualPort,
    pub destination: VirtualPort,
    pub session_id: u8,
    pub substream_id: u8,
    pub sequence_id: u16,
    /// 0 = 단일 패킷 또는 마지막 프래그먼트, 1..N = 프래그먼트 순번
    pub fragment_id: u8,
    pub connection_signature: Bytes,
    pub options: PacketOptions,
    pub payload: Bytes,
    /// 마지막 인코딩/디코딩 시점의 서명
    pub signature: Bytes,
    /// 전송 횟수 (로컬 전용, 와이어에 없음)
    pub send_count: u32,
    /// 마지막 전송 시각 (로컬 전용)
    pub sent_at: Option<Instant>,
}

impl Packet {
    /// 새 패킷 생성
    pub fn new(dialect: Dialect, packet_type: PacketType, flags: PacketFlags) -> Self {
        Self {
            dialect,
            packet_type,
            flags,
            source: VirtualPort::new(StreamType(0), 0),
            destination: VirtualPort::new(StreamType(0), 0),
            session_id: 0,
            substream_id: 0,
            sequence_id: 0,
            fragment_id: 0,
            connection_signature: Bytes::new(),
            options: PacketOptions::default(),
            payload: Bytes::new(),
            signature: Bytes::new(),
            send_count: 0,
            sent_at: None,
        }
    }

    pub fn has_flag(&self, flag: PacketFlags) -> bool {
        self.flags.contains(flag)
    }

    /// 수신 패킷에 대한 ACK 생성 (포트 반전, 같은 시퀀스)
    pub fn ack(&self) -> Packet {
        let mut ack = Packet::new(
            self.dialect,
            self.packet_type,
            PacketFlags::ACK | PacketFlags::HAS_SIZE,
        );
        ack.source = self.destination;
        ack.destination = self.source;
        ack.substream_id = self.substream_id;
        ack.sequence_id = self.sequence_id;
        ack.fragment_id = self.fragment_id;
        ack
    }

    /// 재전송용 복사본 (전송 횟수/시각 갱신)
    pub fn resent(&self) -> Packet {
        Packet {
            send_count: self.send_count + 1,
            sent_at: Some(Instant::now()),
            ..self.clone()
        }
    }
}
