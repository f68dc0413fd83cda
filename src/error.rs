//! 에러 타입 정의

use thiserror::Error;

/// PRUDP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket 에러: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("잘못된 패킷: {0}")]
    MalformedPacket(String),

    #[error("패킷 길이 부족: {needed} bytes 필요, {remaining} bytes 남음")]
    Truncated { needed: usize, remaining: usize },

    #[error("체크섬 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("서명 불일치: sequence_id={sequence_id}")]
    SignatureMismatch { sequence_id: u16 },

    #[error("바인딩되지 않은 stream id: {stream_id}")]
    UnboundEndpoint { stream_id: u8 },

    #[error("유효하지 않은 포트: {0}")]
    InvalidPort(String),

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("알 수 없는 연결: {0}")]
    UnknownConnection(String),

    #[error("유효하지 않은 substream: {substream_id} (max {max})")]
    InvalidSubstream { substream_id: u8, max: u8 },

    #[error("재전송 한도 초과: sequence_id={sequence_id}, resends={resends}")]
    RetransmissionExhausted { sequence_id: u16, resends: u32 },

    #[error("압축 에러: {0}")]
    Compression(String),

    #[error("핸드쉐이크 실패: {0}")]
    Handshake(String),

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 구조적으로 손상된 패킷 (손상된 전송 계층)
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_) | Error::Truncated { .. } | Error::ChecksumMismatch { .. }
        )
    }

    /// 인증 실패 (공격 또는 키 불일치)
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self, Error::SignatureMismatch { .. })
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnboundEndpoint { .. }
                | Error::InvalidPort(_)
                | Error::ProtocolViolation(_)
                | Error::UnknownConnection(_)
                | Error::InvalidSubstream { .. }
        )
    }

    /// 연결을 종료시키는 에러
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::RetransmissionExhausted { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::WebSocket(_))
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let truncated = Error::Truncated {
            needed: 4,
            remaining: 1,
        };
        assert!(truncated.is_malformed());
        assert!(!truncated.is_signature_mismatch());

        let bad_sig = Error::SignatureMismatch { sequence_id: 7 };
        assert!(bad_sig.is_signature_mismatch());
        assert!(!bad_sig.is_malformed());

        assert!(Error::UnboundEndpoint { stream_id: 3 }.is_protocol_violation());
        assert!(Error::RetransmissionExhausted {
            sequence_id: 2,
            resends: 5
        }
        .is_connection_fatal());
    }
}
