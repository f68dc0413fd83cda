//! PRUDP 서버
//!
//! - UDP 소켓 / WebSocket 리스너에서 데이터그램 수신
//! - 데이터그램마다 별도 태스크로 디코딩, 포트 검증, endpoint 라우팅
//! - 상위 계층용 송신 진입점 (프래그먼트 분할 + 페이싱)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::connection::{Connection, ConnectionState};
use crate::endpoint::{Endpoint, EndpointContext};
use crate::fragment;
use crate::packet::{Packet, PacketFlags, PacketType};
use crate::transport::{PeerId, PeerTransport};
use crate::{Config, Error, Result};

/// 수신 루프가 종료 플래그를 확인하는 주기
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 상위 계층으로 올라가는 이벤트
#[derive(Debug)]
pub enum ServerEvent {
    /// CONNECT 완료
    Connected { connection: Arc<Connection> },
    /// 재조립/복호화가 끝난 페이로드
    Data {
        connection: Arc<Connection>,
        substream_id: u8,
        reliable: bool,
        payload: Bytes,
    },
    /// DISCONNECT 수신, 로컬 종료, 유휴 정리
    Disconnected { connection: Arc<Connection> },
    /// 재전송 한도 초과
    ConnectionFailed {
        connection: Arc<Connection>,
        reason: String,
    },
}

/// 이벤트 수신기 타입
pub type EventReceiver = mpsc::Receiver<ServerEvent>;

/// PRUDP 서버
pub struct Server {
    config: Arc<Config>,
    endpoints: DashMap<u8, Arc<Endpoint>>,
    events: mpsc::Sender<ServerEvent>,
    next_websocket_id: AtomicU64,
    running: AtomicBool,
    sweeping: AtomicBool,
}

impl Server {
    /// 새 서버 생성
    ///
    /// v1 연결 서명 키가 16바이트가 아니면 랜덤 키를 만든다.
    pub fn new(mut config: Config) -> (Arc<Self>, EventReceiver) {
        if config.v1_connection_signature_key.len() != 16 {
            config.v1_connection_signature_key = rand::random::<[u8; 16]>().to_vec();
        }
        let (events, receiver) = mpsc::channel(config.event_queue_size.max(1));

        let server = Arc::new(Self {
            config: Arc::new(config),
            endpoints: DashMap::new(),
            events,
            next_websocket_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            sweeping: AtomicBool::new(false),
        });
        (server, receiver)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// endpoint 바인딩
    ///
    /// 같은 stream id가 이미 있으면 경고만 남기고 false.
    pub fn bind_endpoint(&self, endpoint: Arc<Endpoint>) -> bool {
        let stream_id = endpoint.stream_id();
        if self.endpoints.contains_key(&stream_id) {
            warn!("stream id {} 는 이미 바인딩됨", stream_id);
            return false;
        }

        let attached = endpoint.attach(EndpointContext {
            config: Arc::clone(&self.config),
            events: self.events.clone(),
        });
        if !attached {
            warn!("endpoint {} 는 다른 서버에 바인딩됨", stream_id);
            return false;
        }

        self.endpoints.insert(stream_id, endpoint);
        info!("endpoint 바인딩: stream id {}", stream_id);
        true
    }

    pub fn endpoint(&self, stream_id: u8) -> Option<Arc<Endpoint>> {
        self.endpoints.get(&stream_id).map(|entry| Arc::clone(entry.value()))
    }

    /// UDP 소켓을 열고 수신 루프를 백그라운드로 시작
    pub async fn bind_udp(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        info!("PRUDP UDP 수신 시작: {}", local);

        self.spawn_idle_sweep();
        tokio::spawn(Arc::clone(self).run_udp(socket));
        Ok(local)
    }

    /// UDP 수신 루프를 현재 태스크에서 실행 (stop까지 반환하지 않음)
    pub async fn listen_udp(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("PRUDP UDP 수신 시작: {}", socket.local_addr()?);

        self.spawn_idle_sweep();
        Arc::clone(self).run_udp(socket).await;
        Ok(())
    }

    async fn run_udp(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65535];

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            let data = Bytes::copy_from_slice(&buf[..len]);
                            let transport = PeerTransport::udp(Arc::clone(&socket), addr);
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                let peer = transport.peer_id();
                                if let Err(e) = server.handle_datagram(&data, transport).await {
                                    log_rejected(&e, peer);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("UDP 수신 에러: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        info!("PRUDP UDP 수신 종료");
    }

    /// WebSocket(lite) 리스너 시작
    ///
    /// TLS 종단은 앞단 프록시가 맡는다.
    pub async fn bind_websocket(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("PRUDP WebSocket 수신 시작: {}", local);

        self.spawn_idle_sweep();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while server.running.load(Ordering::SeqCst) {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let server = Arc::clone(&server);
                                tokio::spawn(async move {
                                    if let Err(e) = server.serve_websocket(stream, peer).await {
                                        debug!("WebSocket 세션 종료 {}: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => warn!("WebSocket accept 에러: {}", e),
                        }
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        });

        Ok(local)
    }

    /// WebSocket 연결 하나의 양방향 루프
    async fn serve_websocket(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let socket = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let id = self.next_websocket_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let transport = PeerTransport::WebSocket { id, addr, tx };
        let peer = transport.peer_id();
        info!("WebSocket 연결: {} ({})", addr, peer);

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let server = Arc::clone(&self);
                            let transport = transport.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_datagram(&data, transport).await {
                                    log_rejected(&e, peer);
                                }
                            });
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!("WebSocket 수신 에러 {}: {}", peer, e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(data) => {
                            if ws_tx.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // 물리 연결이 끊기면 그 위의 가상 연결도 모두 정리
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.iter().map(|entry| Arc::clone(entry.value())).collect();
        for endpoint in endpoints {
            for connection in endpoint.disconnect_peer(peer) {
                connection.emit(|connection| ServerEvent::Disconnected { connection }).await;
            }
        }
        info!("WebSocket 연결 종료: {}", peer);
        Ok(())
    }

    /// 수신 데이터그램 처리
    ///
    /// 디코딩이 실패하면 데이터그램 전체를 버린다. 개별 패킷 처리 에러는
    /// 나머지 패킷 처리를 막지 않으며, 첫 번째 에러를 반환한다.
    pub async fn handle_datagram(&self, data: &[u8], transport: PeerTransport) -> Result<()> {
        let packets = codec::decode_all(data, &self.config, transport.allows_lite())?;

        let mut first_error = None;
        for packet in packets {
            if let Err(e) = self.process_packet(packet, transport.clone()).await {
                if first_error.is_some() {
                    debug!("추가 패킷 거부 {}: {}", transport.peer_id(), e);
                } else {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn process_packet(&self, packet: Packet, transport: PeerTransport) -> Result<()> {
        Self::validate_ports(&packet)?;

        let stream_id = packet.destination.port;
        let endpoint = self
            .endpoint(stream_id)
            .ok_or(Error::UnboundEndpoint { stream_id })?;

        endpoint.handle_packet(packet, transport).await
    }

    /// 가상 포트 검증 (상태 변경 전에 수행)
    pub fn validate_ports(packet: &Packet) -> Result<()> {
        let source = packet.source;
        let destination = packet.destination;

        if source.stream_type != destination.stream_type {
            return Err(Error::InvalidPort(format!(
                "스트림 타입 불일치: source {} destination {}",
                source.stream_type.0, destination.stream_type.0
            )));
        }
        if !destination.stream_type.is_valid() {
            return Err(Error::InvalidPort(format!(
                "잘못된 스트림 타입: {}",
                destination.stream_type.0
            )));
        }
        if source.port > packet.dialect.max_port() {
            return Err(Error::InvalidPort(format!(
                "소스 포트 번호가 너무 큼: {} ({:?} 최대 {})",
                source.port,
                packet.dialect,
                packet.dialect.max_port()
            )));
        }
        Ok(())
    }

    /// 서버 → 클라이언트 패킷 틀 (포트 반전)
    fn outgoing(connection: &Connection, packet_type: PacketType, flags: PacketFlags) -> Packet {
        let mut packet = Packet::new(connection.dialect(), packet_type, flags);
        packet.source = connection.local_port();
        packet.destination = connection.remote_port();
        packet
    }

    /// 신뢰성 송신
    ///
    /// fragment_size 단위로 나눠 같은 substream 시퀀스로 보내고,
    /// 프래그먼트 사이에는 fragment_interval만큼 쉰다.
    ///
    /// 각 프래그먼트는 물리 전송 전에 재전송이 예약되므로 전송 에러가 나도
    /// 남은 프래그먼트를 계속 보내고 첫 에러를 마지막에 반환한다. 연결이
    /// 닫혔거나 substream이 잘못된 경우에만 중단한다.
    pub async fn send(&self, connection: &Arc<Connection>, substream_id: u8, payload: Bytes) -> Result<()> {
        match connection.state() {
            ConnectionState::Established => {}
            ConnectionState::Connecting => {
                return Err(Error::ProtocolViolation(format!(
                    "연결 수립 전 송신: {}",
                    connection.peer_id()
                )));
            }
            ConnectionState::Disconnected | ConnectionState::Failed => return Err(Error::ConnectionClosed),
        }
        connection.substream(substream_id)?;

        let fragments = fragment::split(&payload, self.config.fragment_size);
        let last = fragments.len() - 1;
        if last > 0 {
            debug!(
                "{} bytes → {} 프래그먼트 ({})",
                payload.len(),
                fragments.len(),
                connection.peer_id()
            );
        }

        let mut first_error = None;
        for (i, fragment) in fragments.into_iter().enumerate() {
            let mut packet = Self::outgoing(
                connection,
                PacketType::Data,
                PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK | PacketFlags::HAS_SIZE,
            );
            packet.substream_id = substream_id;
            packet.fragment_id = fragment.fragment_id;
            packet.payload = fragment.payload;

            match connection.send_packet(packet).await {
                Ok(()) => {}
                Err(e @ (Error::ConnectionClosed | Error::InvalidSubstream { .. })) => return Err(e),
                Err(e) => {
                    warn!("프래그먼트 {}/{} 전송 실패 {}: {}", i + 1, last + 1, connection.peer_id(), e);
                    first_error.get_or_insert(e);
                }
            }

            if i < last && !self.config.fragment_interval.is_zero() {
                tokio::time::sleep(self.config.fragment_interval).await;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 비신뢰성 송신 (분할 없음, 재전송 없음)
    pub async fn send_unreliable(&self, connection: &Arc<Connection>, substream_id: u8, payload: Bytes) -> Result<()> {
        if !connection.is_established() {
            return Err(Error::ConnectionClosed);
        }
        if payload.len() > self.config.fragment_size {
            return Err(Error::ProtocolViolation(format!(
                "비신뢰성 페이로드가 프래그먼트 크기 초과: {} > {}",
                payload.len(),
                self.config.fragment_size
            )));
        }

        let mut packet = Self::outgoing(connection, PacketType::Data, PacketFlags::HAS_SIZE);
        packet.substream_id = substream_id;
        packet.payload = payload;
        connection.send_packet(packet).await
    }

    /// 호출측이 만든 패킷을 그대로 송신 경로에 태운다
    pub async fn send_packet(&self, connection: &Arc<Connection>, packet: Packet) -> Result<()> {
        connection.send_packet(packet).await
    }

    /// PING 송신 (ACK가 오면 RTT 기록)
    pub async fn ping(&self, connection: &Arc<Connection>) -> Result<()> {
        let packet = Self::outgoing(connection, PacketType::Ping, PacketFlags::NEEDS_ACK | PacketFlags::HAS_SIZE);
        connection.send_packet(packet).await
    }

    /// 로컬 종료: DISCONNECT 송신 후 연결 제거
    pub async fn disconnect(&self, connection: &Arc<Connection>) -> Result<()> {
        let packet = Self::outgoing(connection, PacketType::Disconnect, PacketFlags::RELIABLE | PacketFlags::HAS_SIZE);
        let sent = connection.send_packet(packet).await;

        if let Some(endpoint) = self.endpoint(connection.local_port().port) {
            endpoint.remove_connection(connection);
        }
        if connection.close(ConnectionState::Disconnected) {
            info!("연결 종료 (로컬): {}", connection.peer_id());
            connection.emit(|connection| ServerEvent::Disconnected { connection }).await;
        }
        sent
    }

    /// 유휴 연결 정리 태스크 (idle_timeout이 있을 때 한 번만 시작)
    fn spawn_idle_sweep(self: &Arc<Self>) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }

        let server = Arc::downgrade(self);
        let interval = (timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(server) = server.upgrade() else {
                    return;
                };
                if !server.running.load(Ordering::SeqCst) {
                    return;
                }

                let endpoints: Vec<Arc<Endpoint>> =
                    server.endpoints.iter().map(|entry| Arc::clone(entry.value())).collect();
                for endpoint in endpoints {
                    for connection in endpoint.disconnect_idle(timeout) {
                        info!("유휴 연결 정리: {}", connection.peer_id());
                        connection.emit(|connection| ServerEvent::Disconnected { connection }).await;
                    }
                }
            }
        });
    }

    /// 수신 루프 정지
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 거부된 데이터그램 로깅 (에러 종류별 레벨)
fn log_rejected(error: &Error, peer: PeerId) {
    if error.is_signature_mismatch() {
        warn!("서명 불일치, 패킷 폐기 {}: {}", peer, error);
    } else if error.is_malformed() {
        debug!("손상된 패킷 폐기 {}: {}", peer, error);
    } else if error.is_protocol_violation() {
        warn!("프로토콜 위반 {}: {}", peer, error);
    } else if error.is_transport() {
        error!("전송 에러 {}: {}", peer, error);
    } else {
        warn!("패킷 처리 실패 {}: {}", peer, error);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoints", &self.endpoints.len())
            .field("running", &self.is_running())
            .finish()
    }
}
