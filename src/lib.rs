//! # PRUDP
//!
//! UDP/WebSocket 기반 가상 포트 신뢰성 전송 프로토콜 엔진
//!
//! ## 핵심 특징
//! - **3개 방언**: v0 (레거시), v1, lite (WebSocket)
//! - **가상 포트**: 하나의 소켓 위에 여러 endpoint (stream id) 다중화
//! - **Sliding Window**: substream별 순서 보장, 중복 제거, 재전송
//! - **프래그먼트**: MTU 크기 분할 + 순서 기반 재조립
//! - **서명/암호화**: 연결별 키로 HMAC 서명, RC4 암호화, zlib 압축

pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod packet;
pub mod server;
pub mod sliding_window;
pub mod timeout_manager;
pub mod transport;

pub use codec::{decode, decode_all, encode, SignatureKeys};
pub use compression::Compression;
pub use config::Config;
pub use connection::{Connection, ConnectionKey, ConnectionState};
pub use endpoint::{ConnectHandler, ConnectOutcome, Endpoint};
pub use error::{Error, Result};
pub use packet::{Dialect, Packet, PacketFlags, PacketType, StreamType, VirtualPort};
pub use server::{EventReceiver, Server, ServerEvent};
pub use sliding_window::SlidingWindow;
pub use timeout_manager::TimeoutManager;
pub use transport::{PeerId, PeerTransport};

/// 기본 프래그먼트 크기 (바이트)
pub const DEFAULT_FRAGMENT_SIZE: usize = 1300;

/// 기본 세션 키 길이 (바이트)
pub const DEFAULT_SESSION_KEY_LENGTH: usize = 32;

/// v1 매직 넘버
pub const V1_MAGIC: [u8; 2] = [0xEA, 0xD0];

/// lite 매직 바이트
pub const LITE_MAGIC: u8 = 0x80;
