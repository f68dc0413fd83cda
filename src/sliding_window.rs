//! Substream별 sliding window
//!
//! 송신: 시퀀스 ID 발급 + 페이로드 압축/암호화를 한 락 안에서 처리해서
//! 키스트림이 시퀀스 순서대로 진행되도록 한다.
//!
//! 수신: 기대 시퀀스와 비교해서
//! - 일치: 즉시 전달 + 버퍼에 이어지는 패킷 모두 전달
//! - 앞섬 (윈도우 내): 버퍼링
//! - 뒤처짐: 중복 (재ACK만, 재전달 없음)

use std::collections::HashMap;
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use crate::compression::Compression;
use crate::crypto::StreamCipher;
use crate::packet::Packet;
use crate::timeout_manager::{RetransmitTarget, TimeoutManager};
use crate::{Config, Result};

/// 수신 처리 결과
#[derive(Debug)]
pub enum Received {
    /// 순서대로 전달할 패킷들 (복호화/압축 해제 완료)
    ///
    /// 압축 해제에 실패한 패킷은 빠지므로 비어 있을 수 있다.
    Deliver(Vec<Packet>),
    /// 순서가 앞서서 버퍼에 보관
    Buffered,
    /// 이미 받은 시퀀스
    Duplicate,
    /// 버퍼링 한계를 넘어선 시퀀스 (폐기)
    OutOfWindow,
}

struct WindowState {
    /// 마지막으로 발급한 송신 시퀀스 ID
    outgoing_sequence: u16,
    /// 다음에 기대하는 수신 시퀀스 ID
    incoming_expected: u16,
    incoming_buffer: HashMap<u16, Packet>,
    encrypt: StreamCipher,
    decrypt: StreamCipher,
}

/// substream 하나의 송수신 윈도우
pub struct SlidingWindow {
    state: Mutex<WindowState>,
    timeouts: TimeoutManager,
    compression: Compression,
    max_window_ahead: u16,
}

impl SlidingWindow {
    /// 새 윈도우 생성
    ///
    /// `cipher`는 송수신 방향 각각의 초기 상태로 복제된다.
    pub fn new(
        config: &Config,
        cipher: StreamCipher,
        incoming_expected: u16,
        target: Weak<dyn RetransmitTarget>,
    ) -> Self {
        Self {
            state: Mutex::new(WindowState {
                // 첫 DATA는 2번부터 (1번은 CONNECT가 사용)
                outgoing_sequence: 1,
                incoming_expected,
                incoming_buffer: HashMap::new(),
                encrypt: cipher.clone(),
                decrypt: cipher,
            }),
            timeouts: TimeoutManager::new(config.resend_timeout, config.max_resends, target),
            compression: config.compression,
            max_window_ahead: config.max_window_ahead,
        }
    }

    /// 다음 송신 시퀀스 ID 발급
    pub fn next_outgoing_sequence_id(&self) -> u16 {
        let mut state = self.state.lock();
        state.outgoing_sequence = state.outgoing_sequence.wrapping_add(1);
        state.outgoing_sequence
    }

    /// 신뢰성 DATA 송신 준비: 압축 + 암호화 + 시퀀스 ID 발급
    ///
    /// 압축이 실패하면 시퀀스 ID를 소모하지 않는다.
    pub fn prepare_outgoing(&self, packet: &mut Packet) -> Result<()> {
        let compressed = self.compression.compress(&packet.payload)?;

        let mut state = self.state.lock();
        packet.payload = Bytes::from(state.encrypt.apply(&compressed));
        state.outgoing_sequence = state.outgoing_sequence.wrapping_add(1);
        packet.sequence_id = state.outgoing_sequence;
        Ok(())
    }

    /// 다음 기대 수신 시퀀스 ID
    pub fn incoming_expected(&self) -> u16 {
        self.state.lock().incoming_expected
    }

    /// 신뢰성 패킷 수신
    ///
    /// 압축 해제에 실패한 패킷은 시퀀스만 소비하고 버린다. 키스트림은 이미
    /// 진행됐으므로 뒤따르는 패킷은 계속 전달된다.
    pub fn receive(&self, packet: Packet) -> Received {
        let mut state = self.state.lock();

        let distance = packet.sequence_id.wrapping_sub(state.incoming_expected) as i16;
        if distance < 0 {
            return Received::Duplicate;
        }
        if distance > 0 {
            if distance as u16 >= self.max_window_ahead {
                return Received::OutOfWindow;
            }
            if state.incoming_buffer.contains_key(&packet.sequence_id) {
                return Received::Duplicate;
            }
            state.incoming_buffer.insert(packet.sequence_id, packet);
            return Received::Buffered;
        }

        let mut delivered = Vec::new();
        let mut next = Some(packet);
        while let Some(mut packet) = next {
            state.incoming_expected = state.incoming_expected.wrapping_add(1);

            let decrypted = state.decrypt.apply(&packet.payload);
            match self.compression.decompress(&decrypted) {
                Ok(payload) => {
                    packet.payload = Bytes::from(payload);
                    delivered.push(packet);
                }
                Err(e) => warn!("수신 패킷 폐기: seq={} ({})", packet.sequence_id, e),
            }

            let expected = state.incoming_expected;
            next = state.incoming_buffer.remove(&expected);
        }

        Received::Deliver(delivered)
    }

    /// 버퍼에 보관 중인 패킷 수
    pub fn buffered(&self) -> usize {
        self.state.lock().incoming_buffer.len()
    }

    /// 송신 패킷 타임아웃 등록
    pub fn schedule_timeout(&self, packet: Packet) {
        self.timeouts.schedule(packet);
    }

    /// 단일 ACK 처리. 이미 확인된 ID면 false (에러 아님).
    pub fn acknowledge(&self, sequence_id: u16) -> bool {
        self.timeouts.cancel(sequence_id)
    }

    /// 집합 ACK 처리: base 이하 전부 + 명시된 ID들
    pub fn acknowledge_through(&self, base: u16, sequence_ids: &[u16]) -> usize {
        self.timeouts.cancel_where(|pending| {
            (base.wrapping_sub(pending) as i16) >= 0 || sequence_ids.contains(&pending)
        })
    }

    /// 미확인 송신 패킷 수
    pub fn pending(&self) -> usize {
        self.timeouts.pending()
    }

    pub fn is_pending(&self, sequence_id: u16) -> bool {
        self.timeouts.is_pending(sequence_id)
    }

    /// 연결 종료 시 모든 재전송 취소
    pub fn close(&self) {
        self.timeouts.cancel_all();
        self.state.lock().incoming_buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Dialect, PacketFlags, PacketType};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullTarget;

    #[async_trait]
    impl RetransmitTarget for NullTarget {
        async fn retransmit(&self, _packet: Packet) {}
        async fn retransmission_exhausted(&self, _packet: Packet) {}
    }

    fn window(config: &Config, cipher: StreamCipher, expected: u16) -> (SlidingWindow, Arc<dyn RetransmitTarget>) {
        let target: Arc<dyn RetransmitTarget> = Arc::new(NullTarget);
        let window = SlidingWindow::new(config, cipher, expected, Arc::downgrade(&target));
        (window, target)
    }

    fn data(sequence_id: u16, payload: &'static [u8]) -> Packet {
        let mut packet = Packet::new(Dialect::V1, PacketType::Data, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK);
        packet.sequence_id = sequence_id;
        packet.payload = Bytes::from_static(payload);
        packet
    }

    fn delivered_ids(received: Received) -> Vec<u16> {
        match received {
            Received::Deliver(packets) => packets.iter().map(|p| p.sequence_id).collect(),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_outgoing_sequence_monotonic() {
        let (window, _target) = window(&Config::default(), StreamCipher::Plain, 2);
        let ids: Vec<u16> = (0..100).map(|_| window.next_outgoing_sequence_id()).collect();
        assert_eq!(ids[0], 2);
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (window, _target) = window(&Config::default(), StreamCipher::Plain, 3);

        assert!(matches!(window.receive(data(5, b"five")), Received::Buffered));
        assert_eq!(window.buffered(), 1);
        assert_eq!(delivered_ids(window.receive(data(3, b"three"))), vec![3]);
        assert_eq!(delivered_ids(window.receive(data(4, b"four"))), vec![4, 5]);
        assert_eq!(window.buffered(), 0);
        assert_eq!(window.incoming_expected(), 6);
    }

    #[test]
    fn test_duplicate_not_redelivered() {
        let (window, _target) = window(&Config::default(), StreamCipher::Plain, 2);

        assert_eq!(delivered_ids(window.receive(data(2, b"a"))), vec![2]);
        assert!(matches!(window.receive(data(2, b"a")), Received::Duplicate));

        assert!(matches!(window.receive(data(4, b"c")), Received::Buffered));
        assert!(matches!(window.receive(data(4, b"c")), Received::Duplicate));
    }

    #[test]
    fn test_far_ahead_rejected() {
        let mut config = Config::default();
        config.max_window_ahead = 16;
        let (window, _target) = window(&config, StreamCipher::Plain, 2);

        assert!(matches!(window.receive(data(18, b"x")), Received::OutOfWindow));
        assert!(matches!(window.receive(data(17, b"x")), Received::Buffered));
    }

    #[test]
    fn test_wraparound() {
        let (window, _target) = window(&Config::default(), StreamCipher::Plain, u16::MAX);

        assert!(matches!(window.receive(data(0, b"b")), Received::Buffered));
        assert_eq!(delivered_ids(window.receive(data(u16::MAX, b"a"))), vec![u16::MAX, 0]);
        assert!(matches!(window.receive(data(u16::MAX - 1, b"old")), Received::Duplicate));
    }

    #[test]
    fn test_corrupt_buffered_packet_does_not_drop_earlier_delivery() {
        let mut config = Config::default();
        config.compression = Compression::Zlib;
        let (window, _target) = window(&config, StreamCipher::Plain, 3);

        assert!(matches!(window.receive(data(4, &[3, 0xFF, 0xFF])), Received::Buffered));
        assert!(matches!(window.receive(data(5, b"\0five")), Received::Buffered));

        match window.receive(data(3, b"\0three")) {
            Received::Deliver(packets) => {
                let payloads: Vec<&[u8]> = packets.iter().map(|p| &p.payload[..]).collect();
                assert_eq!(payloads, vec![&b"three"[..], &b"five"[..]]);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
        assert_eq!(window.incoming_expected(), 6);
        assert_eq!(window.buffered(), 0);
    }

    #[test]
    fn test_corrupt_in_order_packet_consumes_sequence() {
        let mut config = Config::default();
        config.compression = Compression::Zlib;
        let (window, _target) = window(&config, StreamCipher::Plain, 2);

        assert!(matches!(window.receive(data(3, b"\0next")), Received::Buffered));
        assert_eq!(delivered_ids(window.receive(data(2, &[3, 0xFF, 0xFF]))), vec![3]);
        assert!(matches!(window.receive(data(2, &[3, 0xFF, 0xFF])), Received::Duplicate));
    }

    #[test]
    fn test_pipeline_roundtrip_with_reordering() {
        let mut config = Config::default();
        config.compression = Compression::Zlib;
        let key = [0x3Cu8; 32];

        let (sender, _t1) = window(&config, StreamCipher::rc4(&key), 2);
        let (receiver, _t2) = window(&config, StreamCipher::rc4(&key), 2);

        let messages: [&'static [u8]; 3] = [b"first message", &[0u8; 600], b"third"];
        let mut outgoing: Vec<Packet> = messages
            .iter()
            .map(|&msg| {
                let mut packet = data(0, msg);
                sender.prepare_outgoing(&mut packet).unwrap();
                packet
            })
            .collect();
        assert_eq!(outgoing.iter().map(|p| p.sequence_id).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_ne!(&outgoing[0].payload[..], messages[0]);

        // 3번째, 1번째, 2번째 순서로 도착
        let third = outgoing.pop().unwrap();
        let second = outgoing.pop().unwrap();
        let first = outgoing.pop().unwrap();

        assert!(matches!(receiver.receive(third), Received::Buffered));
        let mut payloads = Vec::new();
        for packet in [first, second] {
            if let Received::Deliver(packets) = receiver.receive(packet) {
                payloads.extend(packets.into_iter().map(|p| p.payload));
            }
        }

        assert_eq!(payloads.len(), 3);
        for (payload, msg) in payloads.iter().zip(messages) {
            assert_eq!(&payload[..], msg);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_ack() {
        let (window, _target) = window(&Config::default(), StreamCipher::Plain, 2);
        for seq in [2u16, 3, 4, 8, 9] {
            let mut packet = data(seq, b"");
            packet.send_count = 1;
            window.schedule_timeout(packet);
        }

        assert_eq!(window.acknowledge_through(4, &[9]), 4);
        assert!(window.is_pending(8));
        assert!(window.acknowledge(8));
        assert!(!window.acknowledge(8));
        assert_eq!(window.pending(), 0);
    }
}
