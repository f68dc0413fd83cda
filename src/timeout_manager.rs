//! 재전송 타임아웃 관리
//!
//! 시퀀스 ID마다 타이머 태스크 하나. 타이머가 깨어나면 락 안에서
//! 엔트리가 아직 살아 있는지 확인한 뒤 재전송 여부를 결정하므로,
//! ACK로 취소된 엔트리는 절대 다시 보내지 않는다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::packet::Packet;

/// 재전송 대상 (보통 Connection)
#[async_trait]
pub trait RetransmitTarget: Send + Sync {
    /// 같은 시퀀스 ID로 다시 전송 (서명은 새로 계산)
    async fn retransmit(&self, packet: Packet);

    /// 재전송 한도 초과
    async fn retransmission_exhausted(&self, packet: Packet);
}

struct Entry {
    packet: Packet,
    token: u64,
}

enum Action {
    Resend(Packet),
    Exhausted(Packet),
}

/// substream 한 방향의 재전송 스케줄
pub struct TimeoutManager {
    entries: Arc<Mutex<HashMap<u16, Entry>>>,
    next_token: AtomicU64,
    resend_timeout: Duration,
    max_resends: u32,
    target: Weak<dyn RetransmitTarget>,
}

impl TimeoutManager {
    pub fn new(resend_timeout: Duration, max_resends: u32, target: Weak<dyn RetransmitTarget>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            resend_timeout,
            max_resends,
            target,
        }
    }

    /// 전송한 패킷의 타임아웃 등록
    ///
    /// tokio 런타임 안에서 호출해야 한다.
    pub fn schedule(&self, packet: Packet) {
        let sequence_id = packet.sequence_id;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(sequence_id, Entry { packet, token });

        let entries = Arc::clone(&self.entries);
        let target = self.target.clone();
        let resend_timeout = self.resend_timeout;
        let max_resends = self.max_resends;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(resend_timeout).await;

                let action = {
                    let mut entries = entries.lock();
                    let exhausted = match entries.get(&sequence_id) {
                        Some(entry) if entry.token == token => {
                            entry.packet.send_count.saturating_sub(1) >= max_resends
                        }
                        // 취소되었거나 같은 시퀀스로 다시 등록됨
                        _ => return,
                    };

                    if exhausted {
                        match entries.remove(&sequence_id) {
                            Some(entry) => Action::Exhausted(entry.packet),
                            None => return,
                        }
                    } else {
                        match entries.get_mut(&sequence_id) {
                            Some(entry) => {
                                entry.packet = entry.packet.resent();
                                Action::Resend(entry.packet.clone())
                            }
                            None => return,
                        }
                    }
                };

                let Some(target) = target.upgrade() else {
                    return;
                };

                match action {
                    Action::Resend(packet) => {
                        debug!(
                            "재전송: seq={} substream={} send_count={}",
                            packet.sequence_id, packet.substream_id, packet.send_count
                        );
                        target.retransmit(packet).await;
                    }
                    Action::Exhausted(packet) => {
                        warn!(
                            "재전송 한도 초과: seq={} resends={}",
                            packet.sequence_id, max_resends
                        );
                        target.retransmission_exhausted(packet).await;
                        return;
                    }
                }
            }
        });
    }

    /// ACK 수신: 타임아웃 취소. 이미 확인된 ID면 false.
    pub fn cancel(&self, sequence_id: u16) -> bool {
        self.entries.lock().remove(&sequence_id).is_some()
    }

    /// 조건에 맞는 모든 엔트리 취소, 취소된 개수 반환
    pub fn cancel_where(&self, mut predicate: impl FnMut(u16) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|&sequence_id, _| !predicate(sequence_id));
        before - entries.len()
    }

    pub fn cancel_all(&self) {
        self.entries.lock().clear();
    }

    pub fn is_pending(&self, sequence_id: u16) -> bool {
        self.entries.lock().contains_key(&sequence_id)
    }

    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Dialect, PacketFlags, PacketType};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        resent: Mutex<Vec<(u16, u32)>>,
        exhausted: AtomicUsize,
    }

    #[async_trait]
    impl RetransmitTarget for Recorder {
        async fn retransmit(&self, packet: Packet) {
            self.resent.lock().push((packet.sequence_id, packet.send_count));
        }

        async fn retransmission_exhausted(&self, _packet: Packet) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sent_packet(sequence_id: u16) -> Packet {
        let mut packet = Packet::new(
            Dialect::V1,
            PacketType::Data,
            PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK,
        );
        packet.sequence_id = sequence_id;
        packet.send_count = 1;
        packet
    }

    fn manager(recorder: &Arc<Recorder>) -> TimeoutManager {
        let target: Arc<dyn RetransmitTarget> = recorder.clone();
        TimeoutManager::new(Duration::from_secs(1), 5, Arc::downgrade(&target))
    }

    #[tokio::test(start_paused = true)]
    async fn test_resends_exactly_max_then_exhausts() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&recorder);

        manager.schedule(sent_packet(2));
        tokio::time::sleep(Duration::from_secs(30)).await;

        let resent = recorder.resent.lock().clone();
        assert_eq!(resent.len(), 5);
        // 같은 시퀀스, 전송 횟수 증가
        assert!(resent.iter().all(|(seq, _)| *seq == 2));
        assert_eq!(
            resent.iter().map(|(_, count)| *count).collect::<Vec<_>>(),
            vec![2, 3, 4, 5, 6]
        );
        assert_eq!(recorder.exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire_is_noop() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&recorder);

        manager.schedule(sent_packet(7));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(recorder.resent.lock().len(), 1);

        assert!(manager.cancel(7));
        // 이미 확인된 ACK는 무시
        assert!(!manager.cancel(7));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.resent.lock().len(), 1);
        assert_eq!(recorder.exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_where_range() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&recorder);

        for seq in [2u16, 3, 4, 9] {
            manager.schedule(sent_packet(seq));
        }
        assert_eq!(manager.cancel_where(|seq| seq <= 4), 3);
        assert!(manager.is_pending(9));

        manager.cancel_all();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(recorder.resent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_target_stops_timer() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&recorder);
        manager.schedule(sent_packet(2));

        let weak = Arc::downgrade(&recorder);
        drop(recorder);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(weak.upgrade().is_none());
        // 엔트리는 남아 있지만 보낼 곳이 없음
        assert!(manager.is_pending(2));
    }
}
