//! 서버 설정

use std::time::Duration;

use crate::compression::Compression;
use crate::{DEFAULT_FRAGMENT_SIZE, DEFAULT_SESSION_KEY_LENGTH};

/// PRUDPv0 전용 설정
#[derive(Debug, Clone, Default)]
pub struct V0Settings {
    /// Quazal 모드: type/flags를 1바이트로 인코딩 (type=&7, flags=>>3)
    pub quazal_mode: bool,

    /// 4바이트 체크섬 사용 (기본 1바이트)
    pub enhanced_checksum: bool,
}

impl V0Settings {
    /// 체크섬 필드 크기 (바이트)
    pub fn checksum_size(&self) -> usize {
        if self.enhanced_checksum {
            4
        } else {
            1
        }
    }
}

/// 상위(RMC/직렬화) 계층이 읽는 스트림 설정
///
/// 이 계층에서는 해석하지 않고 그대로 전달만 한다.
#[derive(Debug, Clone)]
pub struct ByteStreamSettings {
    pub string_length_size: usize,
    pub pid_size: usize,
    pub use_structure_header: bool,
}

impl Default for ByteStreamSettings {
    fn default() -> Self {
        Self {
            string_length_size: 2,
            pid_size: 4,
            use_structure_header: false,
        }
    }
}

/// PRUDP 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 프래그먼트 최대 페이로드 크기 (바이트)
    pub fragment_size: usize,

    /// 세션 키 길이 (바이트)
    pub session_key_length: usize,

    /// 게임별 access key (체크섬/서명 키)
    pub access_key: String,

    /// v1/lite 연결 서명 HMAC 키 (16 bytes)
    /// 길이가 16이 아니면 서버 생성 시 랜덤 생성
    pub v1_connection_signature_key: Vec<u8>,

    /// 송신 서명에 클라이언트 연결 서명 사용 (구버전 호환)
    pub legacy_connection_signature: bool,

    /// 지원 기능 플래그 (SYN/CONNECT 옵션 0)
    pub supported_functions: u32,

    /// 마이너 버전 (옵션 0 하위 바이트)
    pub minor_version: u8,

    /// 최대 substream ID
    pub max_substream_id: u8,

    /// PRUDPv0 설정
    pub v0: V0Settings,

    /// 신뢰성 DATA 페이로드 압축 방식
    pub compression: Compression,

    /// 재전송 대기 시간 (고정)
    pub resend_timeout: Duration,

    /// 최대 재전송 횟수
    pub max_resends: u32,

    /// 프래그먼트 전송 간격
    /// 0이면 간격 없이 전송
    pub fragment_interval: Duration,

    /// 순서 어긋난 패킷 버퍼링 한계 (시퀀스 거리)
    pub max_window_ahead: u16,

    /// 수신 패킷 서명 검증
    pub verify_signatures: bool,

    /// 유휴 연결 정리 시간 (None이면 비활성)
    pub idle_timeout: Option<Duration>,

    /// 상위 계층 이벤트 큐 크기
    pub event_queue_size: usize,

    /// 상위 RMC 계층 verbose 모드
    pub use_verbose_rmc: bool,

    /// 상위 직렬화 계층 설정
    pub byte_stream: ByteStreamSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            session_key_length: DEFAULT_SESSION_KEY_LENGTH,
            access_key: String::new(),
            v1_connection_signature_key: Vec::new(),
            legacy_connection_signature: false,
            supported_functions: 0,
            minor_version: 0,
            max_substream_id: 0,
            v0: V0Settings::default(),
            compression: Compression::None,
            resend_timeout: Duration::from_millis(1000),
            max_resends: 5,
            fragment_interval: Duration::from_millis(16), // 60Hz 클라이언트 루프 기준
            max_window_ahead: 256,
            verify_signatures: true,
            idle_timeout: None,
            event_queue_size: 1024,
            use_verbose_rmc: false,
            byte_stream: ByteStreamSettings::default(),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// access key 지정
    pub fn with_access_key(mut self, access_key: impl Into<String>) -> Self {
        self.access_key = access_key.into();
        self
    }

    /// 구형 PRUDPv0 (Quazal) 서버용 설정
    pub fn legacy_v0() -> Self {
        Self {
            fragment_size: 962,
            session_key_length: 16,
            legacy_connection_signature: true,
            v0: V0Settings {
                quazal_mode: true,
                enhanced_checksum: false,
            },
            ..Self::default()
        }
    }

    /// WebSocket(lite) 서버용 설정
    pub fn websocket() -> Self {
        Self {
            fragment_size: 1300,
            // WSS 위에서는 재전송이 거의 필요 없음
            resend_timeout: Duration::from_millis(2000),
            fragment_interval: Duration::ZERO,
            ..Self::default()
        }
    }

    /// access key 바이트 합 (체크섬/서명 시드)
    pub fn access_key_sum(&self) -> u32 {
        self.access_key.bytes().map(u32::from).sum()
    }
}
