//! 연결 (원격 피어 하나의 세션 상태)
//!
//! - 키/서명 재료, substream별 sliding window, 재조립 버퍼
//! - 모든 송신은 [`Connection::send_packet`] 하나로 모인다
//! - 재전송 한도 초과 시 스스로 endpoint에서 빠지고 실패 이벤트를 올린다

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{self, Reader, SignatureKeys};
use crate::crypto::{self, StreamCipher, UNRELIABLE_KEY_SIZE};
use crate::endpoint::Endpoint;
use crate::fragment::Reassembly;
use crate::packet::{Dialect, Packet, PacketFlags, PacketType, StreamType, VirtualPort};
use crate::server::ServerEvent;
use crate::sliding_window::{Received, SlidingWindow};
use crate::timeout_manager::RetransmitTarget;
use crate::transport::{PeerId, PeerTransport};
use crate::{Config, Error, Result};

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// SYN 교환 완료, CONNECT 대기
    Connecting,
    /// CONNECT 완료, DATA 송수신 가능
    Established,
    /// 정상 종료
    Disconnected,
    /// 재전송 한도 초과
    Failed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// endpoint 안에서 연결을 구분하는 키
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub peer: PeerId,
    pub stream_type: StreamType,
    pub port: u8,
}

impl ConnectionKey {
    pub fn new(peer: PeerId, source: VirtualPort) -> Self {
        Self {
            peer,
            stream_type: source.stream_type,
            port: source.port,
        }
    }
}

/// CONNECT로 확정되는 연결 파라미터
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub client_signature: Bytes,
    pub client_session_id: u8,
    pub session_key: Vec<u8>,
    /// substream 수 (max substream id + 1)
    pub substream_count: usize,
    /// 클라이언트가 다음에 보낼 신뢰성 시퀀스 ID
    pub incoming_expected: u16,
    pub initial_unreliable_sequence_id: u16,
}

#[derive(Default)]
struct ConnectionKeys {
    session_key: Vec<u8>,
    unreliable_key: Option<[u8; UNRELIABLE_KEY_SIZE]>,
    client_signature: Bytes,
    server_signature: Bytes,
    client_session_id: u8,
    server_session_id: u8,
}

/// substream 하나: 윈도우 + 재조립 버퍼
///
/// 재조립 락은 이벤트 전송(await) 동안에도 잡고 있어야 전달 순서가 유지되므로
/// tokio Mutex를 쓴다.
pub(crate) struct Substream {
    pub window: SlidingWindow,
    pub delivery: tokio::sync::Mutex<Reassembly>,
}

/// 원격 피어 연결
pub struct Connection {
    key: ConnectionKey,
    transport: PeerTransport,
    dialect: Dialect,
    /// 서버측 가상 포트 (수신 패킷의 destination)
    local_port: VirtualPort,
    /// 클라이언트측 가상 포트
    remote_port: VirtualPort,
    state: Mutex<ConnectionState>,
    keys: RwLock<ConnectionKeys>,
    substreams: RwLock<Vec<Arc<Substream>>>,
    connect_response: Mutex<Option<Bytes>>,
    unreliable_sequence: AtomicU16,
    ping_sequence: AtomicU16,
    ping_sent_at: Mutex<Option<(u16, Instant)>>,
    rtt: Mutex<Option<Duration>>,
    last_activity: Mutex<tokio::time::Instant>,
    config: Arc<Config>,
    endpoint: Weak<Endpoint>,
    events: mpsc::Sender<ServerEvent>,
    self_ref: Weak<Connection>,
}

impl Connection {
    /// SYN 수신 시 생성 (Connecting 상태)
    pub(crate) fn new(
        key: ConnectionKey,
        transport: PeerTransport,
        dialect: Dialect,
        local_port: VirtualPort,
        remote_port: VirtualPort,
        config: Arc<Config>,
        endpoint: Weak<Endpoint>,
        events: mpsc::Sender<ServerEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            key,
            transport,
            dialect,
            local_port,
            remote_port,
            state: Mutex::new(ConnectionState::Connecting),
            keys: RwLock::new(ConnectionKeys::default()),
            substreams: RwLock::new(Vec::new()),
            connect_response: Mutex::new(None),
            unreliable_sequence: AtomicU16::new(0),
            ping_sequence: AtomicU16::new(0),
            ping_sent_at: Mutex::new(None),
            rtt: Mutex::new(None),
            last_activity: Mutex::new(tokio::time::Instant::now()),
            config,
            endpoint,
            events,
            self_ref: self_ref.clone(),
        })
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn transport(&self) -> &PeerTransport {
        &self.transport
    }

    pub fn peer_id(&self) -> PeerId {
        self.transport.peer_id()
    }

    pub fn local_port(&self) -> VirtualPort {
        self.local_port
    }

    pub fn remote_port(&self) -> VirtualPort {
        self.remote_port
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// 서버가 부여한 세션 ID
    pub fn server_session_id(&self) -> u8 {
        self.keys.read().server_session_id
    }

    pub fn client_session_id(&self) -> u8 {
        self.keys.read().client_session_id
    }

    pub fn server_signature(&self) -> Bytes {
        self.keys.read().server_signature.clone()
    }

    pub fn client_signature(&self) -> Bytes {
        self.keys.read().client_signature.clone()
    }

    pub fn session_key(&self) -> Vec<u8> {
        self.keys.read().session_key.clone()
    }

    pub fn substream_count(&self) -> usize {
        self.substreams.read().len()
    }

    /// 마지막 PING 왕복 시간
    pub fn rtt(&self) -> Option<Duration> {
        *self.rtt.lock()
    }

    /// SYN 응답 전에 서버측 서명/세션 ID 설정
    pub(crate) fn prepare_syn(&self, server_signature: Bytes, server_session_id: u8) {
        let mut keys = self.keys.write();
        keys.server_signature = server_signature;
        keys.server_session_id = server_session_id;
    }

    /// CONNECT 처리: 키 확정, substream 생성, Established 전이
    pub(crate) fn establish(&self, handshake: Handshake, response: Bytes) {
        let cipher = if self.dialect.encrypts_payload() {
            StreamCipher::rc4(&handshake.session_key)
        } else {
            StreamCipher::Plain
        };
        let target: Weak<dyn RetransmitTarget> = self.self_ref.clone();

        let substreams = (0..handshake.substream_count.max(1))
            .map(|_| {
                Arc::new(Substream {
                    window: SlidingWindow::new(
                        &self.config,
                        cipher.clone(),
                        handshake.incoming_expected,
                        target.clone(),
                    ),
                    delivery: tokio::sync::Mutex::new(Reassembly::new()),
                })
            })
            .collect();

        {
            let mut keys = self.keys.write();
            keys.unreliable_key = self
                .dialect
                .encrypts_payload()
                .then(|| crypto::derive_unreliable_key(&handshake.session_key));
            keys.session_key = handshake.session_key;
            keys.client_signature = handshake.client_signature;
            keys.client_session_id = handshake.client_session_id;
        }

        *self.substreams.write() = substreams;
        *self.connect_response.lock() = Some(response);
        self.unreliable_sequence
            .store(handshake.initial_unreliable_sequence_id, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Established;
        self.touch();
    }

    /// 중복 CONNECT에 다시 실어 보낼 응답
    pub(crate) fn connect_response(&self) -> Option<Bytes> {
        self.connect_response.lock().clone()
    }

    pub(crate) fn substream(&self, substream_id: u8) -> Result<Arc<Substream>> {
        let substreams = self.substreams.read();
        substreams
            .get(substream_id as usize)
            .cloned()
            .ok_or(Error::InvalidSubstream {
                substream_id,
                max: substreams.len().saturating_sub(1) as u8,
            })
    }

    /// substream의 신뢰성 송신 시퀀스 ID 발급
    pub fn next_outgoing_sequence_id(&self, substream_id: u8) -> Result<u16> {
        Ok(self.substream(substream_id)?.window.next_outgoing_sequence_id())
    }

    pub fn next_unreliable_sequence_id(&self) -> u16 {
        self.unreliable_sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub fn next_ping_sequence_id(&self) -> u16 {
        self.ping_sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// 마지막 수신 활동 시각 갱신
    pub fn touch(&self) {
        *self.last_activity.lock() = tokio::time::Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// 서명 계산용 키 재료 (송수신 공통)
    ///
    /// legacy 모드는 클라이언트 서명, 그 외에는 서버 서명을 쓴다.
    fn signature_material(&self) -> (Vec<u8>, Bytes) {
        let keys = self.keys.read();
        let signature = if self.config.legacy_connection_signature {
            keys.client_signature.clone()
        } else {
            keys.server_signature.clone()
        };
        (keys.session_key.clone(), signature)
    }

    /// 수신 패킷 서명 검증
    pub fn verify(&self, packet: &Packet) -> Result<()> {
        let (session_key, signature) = self.signature_material();
        codec::verify(packet, &self.config, &SignatureKeys::new(&session_key, &signature))
    }

    /// 패킷 인코딩 (서명 새로 계산)
    pub fn encode(&self, packet: &Packet) -> Bytes {
        let (session_key, signature) = self.signature_material();
        codec::encode(packet, &self.config, &SignatureKeys::new(&session_key, &signature))
    }

    /// 송신 경로
    ///
    /// 1. 시퀀스 ID 발급 (신뢰성 DATA는 압축/암호화까지 한 번에)
    /// 2. 세션 ID, 전송 횟수/시각 설정
    /// 3. 서명 포함 인코딩
    /// 4. 신뢰성 + NeedsAck면 타임아웃 등록
    /// 5. 물리 전송
    pub async fn send_packet(&self, mut packet: Packet) -> Result<()> {
        if self.state().is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if packet.payload.len() > u16::MAX as usize {
            return Err(Error::ProtocolViolation(format!(
                "페이로드가 너무 큼: {} bytes",
                packet.payload.len()
            )));
        }

        let mut window = None;
        if !packet.flags.is_ack() {
            if packet.has_flag(PacketFlags::RELIABLE) {
                let substream = self.substream(packet.substream_id)?;
                if packet.packet_type == PacketType::Data {
                    substream.window.prepare_outgoing(&mut packet)?;
                } else {
                    packet.sequence_id = substream.window.next_outgoing_sequence_id();
                }
                window = Some(substream);
            } else if packet.packet_type == PacketType::Data {
                packet.sequence_id = self.next_unreliable_sequence_id();
                packet.payload = self.unreliable_transform(&packet);
            } else if packet.packet_type == PacketType::Ping {
                packet.sequence_id = self.next_ping_sequence_id();
                *self.ping_sent_at.lock() = Some((packet.sequence_id, Instant::now()));
            } else {
                packet.sequence_id = 0;
            }
        }

        packet.session_id = self.server_session_id();
        packet.send_count = 1;
        packet.sent_at = Some(Instant::now());

        let data = self.encode(&packet);

        if let Some(substream) = window {
            if packet.has_flag(PacketFlags::NEEDS_ACK) {
                substream.window.schedule_timeout(packet);
            }
        }

        self.transport.send(data).await
    }

    /// 비신뢰성 DATA 페이로드 변환 (대칭)
    fn unreliable_transform(&self, packet: &Packet) -> Bytes {
        let keys = self.keys.read();
        match keys.unreliable_key {
            Some(ref base) => Bytes::from(crypto::unreliable_transform(
                base,
                packet.sequence_id,
                keys.server_session_id,
                &packet.payload,
            )),
            None => packet.payload.clone(),
        }
    }

    /// 수신 패킷에 대한 ACK 전송
    pub(crate) async fn send_ack(&self, packet: &Packet) -> Result<()> {
        self.send_packet(packet.ack()).await
    }

    /// 단일 ACK 수신
    pub(crate) fn handle_ack(&self, packet: &Packet) {
        match packet.packet_type {
            PacketType::Ping => {
                let mut sent = self.ping_sent_at.lock();
                if let Some((sequence_id, at)) = *sent {
                    if sequence_id == packet.sequence_id {
                        *self.rtt.lock() = Some(at.elapsed());
                        *sent = None;
                    }
                }
            }
            PacketType::Data | PacketType::Disconnect => {
                match self.substream(packet.substream_id) {
                    Ok(substream) => {
                        if !substream.window.acknowledge(packet.sequence_id) {
                            debug!("이미 확인된 ACK: seq={}", packet.sequence_id);
                        }
                    }
                    Err(e) => debug!("ACK 무시: {}", e),
                }
            }
            PacketType::Syn | PacketType::Connect => {}
        }
    }

    /// 집합 ACK 수신
    ///
    /// - substream 1: `substream u8 | count u8 | base u16 | ids u16 * count`
    /// - 그 외: base = 패킷 시퀀스 ID, 페이로드는 u16 ID 목록
    pub(crate) fn handle_aggregate_ack(&self, packet: &Packet) -> Result<()> {
        let mut reader = Reader::new(&packet.payload);

        let (substream_id, base, count) = if packet.substream_id == 1 {
            let substream_id = reader.u8()?;
            let count = reader.u8()? as usize;
            let base = reader.u16_le()?;
            (substream_id, base, count)
        } else {
            if packet.payload.len() % 2 != 0 {
                return Err(Error::MalformedPacket("집합 ACK 길이가 홀수".into()));
            }
            (0, packet.sequence_id, packet.payload.len() / 2)
        };

        let mut sequence_ids = Vec::with_capacity(count);
        for _ in 0..count {
            sequence_ids.push(reader.u16_le()?);
        }

        let substream = self.substream(substream_id)?;
        let confirmed = substream.window.acknowledge_through(base, &sequence_ids);
        debug!(
            "집합 ACK: substream={} base={} extra={} confirmed={}",
            substream_id,
            base,
            sequence_ids.len(),
            confirmed
        );
        Ok(())
    }

    /// DATA 수신: ACK, 순서 정렬, 복호화, 재조립, 상위 전달
    pub(crate) async fn handle_data(&self, packet: Packet) -> Result<()> {
        if !self.is_established() {
            return Err(Error::ProtocolViolation(format!(
                "연결 전 DATA 수신: {}",
                self.peer_id()
            )));
        }

        if !packet.has_flag(PacketFlags::RELIABLE) {
            if packet.has_flag(PacketFlags::NEEDS_ACK) {
                if let Err(e) = self.send_ack(&packet).await {
                    warn!("ACK 전송 실패 seq={} to {}: {}", packet.sequence_id, self.peer_id(), e);
                }
            }
            let payload = {
                let keys = self.keys.read();
                match keys.unreliable_key {
                    Some(ref base) => Bytes::from(crypto::unreliable_transform(
                        base,
                        packet.sequence_id,
                        packet.session_id,
                        &packet.payload,
                    )),
                    None => packet.payload.clone(),
                }
            };
            self.emit(|connection| ServerEvent::Data {
                connection,
                substream_id: packet.substream_id,
                reliable: false,
                payload,
            })
            .await;
            return Ok(());
        }

        let substream = self.substream(packet.substream_id)?;
        let needs_ack = packet.has_flag(PacketFlags::NEEDS_ACK);
        let ack = packet.ack();
        let substream_id = packet.substream_id;
        let sequence_id = packet.sequence_id;

        let mut reassembly = substream.delivery.lock().await;
        let received = substream.window.receive(packet);

        // ACK 유실은 상대 재전송으로 복구되지만 전달 누락은 복구되지 않는다
        if !matches!(received, Received::OutOfWindow) && needs_ack {
            if let Err(e) = self.send_packet(ack).await {
                warn!("ACK 전송 실패 seq={} to {}: {}", sequence_id, self.peer_id(), e);
            }
        }

        match received {
            Received::Deliver(packets) => {
                for packet in packets {
                    if let Some(payload) = reassembly.push(packet.fragment_id, &packet.payload) {
                        self.emit(|connection| ServerEvent::Data {
                            connection,
                            substream_id,
                            reliable: true,
                            payload,
                        })
                        .await;
                    }
                }
            }
            Received::Buffered => debug!("순서 어긋난 패킷 버퍼링: seq={}", sequence_id),
            Received::Duplicate => debug!("중복 패킷 재ACK: seq={}", sequence_id),
            Received::OutOfWindow => {
                warn!("윈도우 밖 패킷 폐기: seq={} from {}", sequence_id, self.peer_id())
            }
        }

        Ok(())
    }

    /// 상위 이벤트 전송 (수신측이 없으면 버림)
    pub(crate) async fn emit(&self, build: impl FnOnce(Arc<Connection>) -> ServerEvent) {
        let Some(connection) = self.self_ref.upgrade() else {
            return;
        };
        if self.events.send(build(connection)).await.is_err() {
            debug!("이벤트 수신측 없음");
        }
    }

    /// 종료 상태로 전이하고 재전송 정리. 이미 닫혀 있으면 false.
    pub(crate) fn close(&self, state: ConnectionState) -> bool {
        {
            let mut current = self.state.lock();
            if current.is_closed() {
                return false;
            }
            *current = state;
        }
        for substream in self.substreams.read().iter() {
            substream.window.close();
        }
        true
    }

    /// 연결 실패 처리: endpoint에서 제거 + 실패 이벤트
    pub(crate) async fn fail(&self, reason: String) {
        if !self.close(ConnectionState::Failed) {
            return;
        }
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_connection(self);
        }
        warn!("연결 실패 {}: {}", self.peer_id(), reason);
        self.emit(|connection| ServerEvent::ConnectionFailed { connection, reason })
            .await;
    }
}

#[async_trait]
impl RetransmitTarget for Connection {
    async fn retransmit(&self, packet: Packet) {
        if self.state().is_closed() {
            return;
        }
        // 같은 시퀀스 ID, 서명만 새로 계산
        let data = self.encode(&packet);
        if let Err(e) = self.transport.send(data).await {
            warn!("재전송 실패 {}: {}", self.peer_id(), e);
        }
    }

    async fn retransmission_exhausted(&self, packet: Packet) {
        let error = Error::RetransmissionExhausted {
            sequence_id: packet.sequence_id,
            resends: self.config.max_resends,
        };
        info!("재전송 한도 초과로 연결 종료: {}", self.peer_id());
        self.fail(error.to_string()).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_id())
            .field("dialect", &self.dialect)
            .field("remote_port", &self.remote_port)
            .field("state", &self.state())
            .finish()
    }
}
