//! 페이로드 압축
//!
//! zlib 압축 결과 앞에 비율 힌트 1바이트를 붙인다.
//! 힌트가 0이면 압축하지 않은 원본.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::{Error, Result};

/// 압축 해제 결과 상한 (패킷 페이로드 최대 길이)
pub const MAX_DECOMPRESSED_SIZE: usize = u16::MAX as usize;

/// 압축 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// 압축 없음
    #[default]
    None,
    /// zlib + 비율 헤더
    Zlib,
}

impl Compression {
    /// 압축
    pub fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(payload.to_vec()),
            Compression::Zlib => {
                if payload.is_empty() {
                    return Ok(vec![0]);
                }

                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(payload)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                let compressed = encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))?;

                // 압축 이득이 없으면 원본 저장
                if compressed.len() >= payload.len() {
                    let mut out = Vec::with_capacity(payload.len() + 1);
                    out.push(0);
                    out.extend_from_slice(payload);
                    return Ok(out);
                }

                let ratio = (payload.len() / compressed.len() + 1).min(u8::MAX as usize) as u8;
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(ratio);
                out.extend_from_slice(&compressed);
                Ok(out)
            }
        }
    }

    /// 압축 해제
    ///
    /// 결과가 [`MAX_DECOMPRESSED_SIZE`]를 넘으면 에러.
    pub fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(payload.to_vec()),
            Compression::Zlib => {
                let (&ratio, body) = payload
                    .split_first()
                    .ok_or_else(|| Error::Compression("빈 페이로드".into()))?;

                if ratio == 0 {
                    return Ok(body.to_vec());
                }

                let capacity = (body.len() * ratio as usize).min(MAX_DECOMPRESSED_SIZE);
                let mut out = Vec::with_capacity(capacity);
                ZlibDecoder::new(body)
                    .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                if out.len() > MAX_DECOMPRESSED_SIZE {
                    return Err(Error::Compression(format!(
                        "압축 해제 크기 초과: {} bytes 이상",
                        MAX_DECOMPRESSED_SIZE + 1
                    )));
                }
                Ok(out)
            }
        }
    }
}
