//! 프래그먼트 분할과 재조립
//!
//! - 송신: 페이로드를 fragment_size 단위로 자르고 1, 2, ..., 0 순서로 ID 부여
//! - 수신: 시퀀스 순서대로 들어온 조각을 이어 붙이다가 ID 0에서 완성

use bytes::{Bytes, BytesMut};
use tracing::warn;

/// 프래그먼트 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 0 = 마지막(또는 단일), 1..N = 순번
    pub fragment_id: u8,
    pub payload: Bytes,
}

/// 페이로드를 프래그먼트로 분할
///
/// 빈 페이로드도 ID 0인 조각 하나로 보낸다.
pub fn split(payload: &Bytes, fragment_size: usize) -> Vec<Fragment> {
    let fragment_size = fragment_size.max(1);
    if payload.len() <= fragment_size {
        return vec![Fragment {
            fragment_id: 0,
            payload: payload.clone(),
        }];
    }

    let count = (payload.len() + fragment_size - 1) / fragment_size;
    (0..count)
        .map(|i| {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(payload.len());
            let fragment_id = if i + 1 == count {
                0
            } else {
                // 255개를 넘으면 ID가 순환하지만 순서는 시퀀스 ID가 보장
                ((i % 255) + 1) as u8
            };
            Fragment {
                fragment_id,
                payload: payload.slice(start..end),
            }
        })
        .collect()
}

/// substream 하나의 재조립 버퍼
///
/// 한 번에 하나의 메시지만 조립 중일 수 있다.
#[derive(Debug, Default)]
pub struct Reassembly {
    buffer: BytesMut,
    in_progress: bool,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// 순서대로 전달된 조각 추가. 메시지가 완성되면 반환.
    pub fn push(&mut self, fragment_id: u8, payload: &[u8]) -> Option<Bytes> {
        if fragment_id == 1 && self.in_progress {
            warn!(
                "미완성 재조립 버퍼 폐기: {} bytes (새 프래그먼트 시작)",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        self.buffer.extend_from_slice(payload);

        if fragment_id == 0 {
            self.in_progress = false;
            return Some(self.buffer.split().freeze());
        }

        self.in_progress = true;
        None
    }
}
