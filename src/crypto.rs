//! 암호화 모듈 - HMAC-MD5 서명 + RC4 스트림 암호화
//!
//! 흐름:
//! 1. 연결 서명: 피어 주소를 서버 키로 HMAC
//! 2. 패킷 서명: access key 기반 HMAC-MD5
//! 3. 신뢰성 DATA: substream별 RC4 키스트림 (시퀀스 순서대로 진행)
//! 4. 비신뢰성 DATA: 패킷마다 새 RC4 (시퀀스/세션 ID로 키 변형)

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

/// 세션 키가 없을 때 쓰는 기본 RC4 키
pub const DEFAULT_STREAM_KEY: &[u8] = b"CD&ML";

/// 비신뢰성 베이스 키 크기
pub const UNRELIABLE_KEY_SIZE: usize = 32;

const UNRELIABLE_KEY_SALT_A: [u8; 8] = [0x18, 0xD8, 0x23, 0x34, 0x37, 0xE4, 0xE3, 0xFE];
const UNRELIABLE_KEY_SALT_B: [u8; 8] = [0x23, 0x3E, 0x60, 0x01, 0x23, 0xCD, 0xAB, 0x80];

type HmacMd5 = Hmac<Md5>;

/// MD5 다이제스트
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// 여러 조각을 이어서 HMAC-MD5 계산
pub fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    // HMAC은 임의 길이 키를 받으므로 실패하지 않음
    let mut mac = match <HmacMd5 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 16],
    };
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// RC4 스트림 암호기
///
/// 키 길이가 연결마다 달라서 (기본 키 5바이트, 세션 키 16/32바이트)
/// 가변 길이 키를 직접 받는다.
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// 키 스케줄링
    pub fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (idx, slot) in state.iter_mut().enumerate() {
            *slot = idx as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            let k = if key.is_empty() { 0 } else { key[i % key.len()] };
            j = j.wrapping_add(state[i]).wrapping_add(k);
            state.swap(i, j as usize);
        }

        Self { state, i: 0, j: 0 }
    }

    /// 키스트림 XOR (암호화/복호화 동일)
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let idx = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[idx as usize];
        }
    }

    /// 새 버퍼로 변환
    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply_keystream(&mut out);
        out
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 내부 상태는 키 유출이므로 출력하지 않음
        f.debug_struct("Rc4").finish_non_exhaustive()
    }
}

/// substream 한 방향의 신뢰성 페이로드 암호기
#[derive(Debug, Clone)]
pub enum StreamCipher {
    /// 암호화 없음 (lite)
    Plain,
    /// RC4 연속 키스트림
    Rc4(Rc4),
}

impl StreamCipher {
    /// 키로 생성 (빈 키면 기본 키 사용)
    pub fn rc4(key: &[u8]) -> Self {
        if key.is_empty() {
            StreamCipher::Rc4(Rc4::new(DEFAULT_STREAM_KEY))
        } else {
            StreamCipher::Rc4(Rc4::new(key))
        }
    }

    pub fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        match self {
            StreamCipher::Plain => data.to_vec(),
            StreamCipher::Rc4(rc4) => rc4.process(data),
        }
    }
}

/// 세션 키로 비신뢰성 베이스 키 유도
pub fn derive_unreliable_key(session_key: &[u8]) -> [u8; UNRELIABLE_KEY_SIZE] {
    let mut first = session_key.to_vec();
    first.extend_from_slice(&UNRELIABLE_KEY_SALT_A);
    let mut second = session_key.to_vec();
    second.extend_from_slice(&UNRELIABLE_KEY_SALT_B);

    let mut key = [0u8; UNRELIABLE_KEY_SIZE];
    key[..16].copy_from_slice(&md5(&first));
    key[16..].copy_from_slice(&md5(&second));
    key
}

/// 비신뢰성 DATA 페이로드 변환 (대칭)
///
/// 패킷마다 독립 키를 쓰므로 순서 뒤바뀜/중복에 영향 없음.
pub fn unreliable_transform(
    base_key: &[u8; UNRELIABLE_KEY_SIZE],
    sequence_id: u16,
    session_id: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut key = *base_key;
    key[0] = key[0].wrapping_add(sequence_id as u8);
    key[1] = key[1].wrapping_add((sequence_id >> 8) as u8);
    key[31] = key[31].wrapping_add(session_id);

    Rc4::new(&key).process(payload)
}

/// 주소 바이트 (IP + big-endian 포트)
fn address_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut data = match addr {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    };
    data.extend_from_slice(&addr.port().to_be_bytes());
    data
}

/// v1/lite 서버 연결 서명 (16 bytes)
pub fn v1_connection_signature(key: &[u8], addr: &SocketAddr) -> [u8; 16] {
    hmac_md5(key, &[&address_bytes(addr)])
}

/// v0 서버 연결 서명 (4 bytes)
pub fn v0_connection_signature(addr: &SocketAddr) -> [u8; 4] {
    let digest = md5(&address_bytes(addr));
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc4_known_vector() {
        // RFC 6229 이전부터 알려진 벡터: Key="Key", Plaintext="Plaintext"
        let mut rc4 = Rc4::new(b"Key");
        let out = rc4.process(b"Plaintext");
        assert_eq!(out, vec![0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]);
    }

    #[test]
    fn test_stream_cipher_roundtrip_in_order() {
        let key = b"0123456789abcdef0123456789abcdef";
        let mut enc = StreamCipher::rc4(key);
        let mut dec = StreamCipher::rc4(key);

        let messages: [&[u8]; 4] = [b"first", b"second message", b"", b"third"];
        for msg in messages {
            let encrypted = enc.apply(msg);
            assert_eq!(dec.apply(&encrypted), msg);
        }
    }

    #[test]
    fn test_empty_key_uses_default() {
        let mut a = StreamCipher::rc4(&[]);
        let mut b = StreamCipher::rc4(DEFAULT_STREAM_KEY);
        assert_eq!(a.apply(b"hello"), b.apply(b"hello"));
    }

    #[test]
    fn test_unreliable_transform_roundtrip() {
        let base = derive_unreliable_key(b"session key bytes");
        let payload = b"unreliable payload";

        let encrypted = unreliable_transform(&base, 513, 7, payload);
        assert_ne!(encrypted.as_slice(), payload.as_slice());
        assert_eq!(unreliable_transform(&base, 513, 7, &encrypted), payload);

        // 시퀀스가 다르면 다른 키스트림
        assert_ne!(unreliable_transform(&base, 514, 7, payload), encrypted);
    }

    #[test]
    fn test_connection_signatures_depend_on_address() {
        let key = [0x11u8; 16];
        let a: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        assert_ne!(v1_connection_signature(&key, &a), v1_connection_signature(&key, &b));
        assert_eq!(v1_connection_signature(&key, &a), v1_connection_signature(&key, &a));
        assert_ne!(v0_connection_signature(&a), v0_connection_signature(&b));
    }
}
