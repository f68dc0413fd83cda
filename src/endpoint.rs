//! Endpoint (가상 포트 stream id 하나)
//!
//! 같은 stream id로 들어오는 연결들을 묶고 SYN/CONNECT/DISCONNECT
//! 핸드쉐이크를 처리한다.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionKey, ConnectionState, Handshake};
use crate::crypto;
use crate::packet::{Dialect, Packet, PacketFlags, PacketType};
use crate::server::ServerEvent;
use crate::transport::{PeerId, PeerTransport};
use crate::{Config, Error, Result};

/// CONNECT 처리 결과
#[derive(Debug, Clone, Default)]
pub struct ConnectOutcome {
    /// 세션 키 (None이면 키 없이 동작)
    ///
    /// 길이가 `Config::session_key_length`와 다르면 CONNECT를 거부한다.
    pub session_key: Option<Vec<u8>>,
    /// CONNECT ACK에 실을 응답 페이로드
    pub response: Bytes,
}

/// CONNECT 페이로드(티켓 등) 검증 훅
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    /// 에러를 반환하면 연결을 거부한다.
    async fn on_connect(&self, connection: &Arc<Connection>, payload: &Bytes) -> Result<ConnectOutcome>;
}

/// 바인딩 시 서버가 넘겨주는 공유 자원
pub(crate) struct EndpointContext {
    pub config: Arc<Config>,
    pub events: mpsc::Sender<ServerEvent>,
}

/// stream id 하나에 묶인 연결 집합
pub struct Endpoint {
    stream_id: u8,
    connections: DashMap<ConnectionKey, Arc<Connection>>,
    connect_handler: Option<Arc<dyn ConnectHandler>>,
    context: OnceLock<EndpointContext>,
}

impl Endpoint {
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            connections: DashMap::new(),
            connect_handler: None,
            context: OnceLock::new(),
        }
    }

    /// CONNECT 검증 훅 지정
    pub fn with_connect_handler(mut self, handler: Arc<dyn ConnectHandler>) -> Self {
        self.connect_handler = Some(handler);
        self
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    /// 서버에 바인딩 (한 번만 성공)
    pub(crate) fn attach(&self, context: EndpointContext) -> bool {
        self.context.set(context).is_ok()
    }

    fn context(&self) -> Result<&EndpointContext> {
        self.context.get().ok_or(Error::UnboundEndpoint {
            stream_id: self.stream_id,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn find_connection(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn require_connection(&self, key: &ConnectionKey) -> Result<Arc<Connection>> {
        self.find_connection(key)
            .ok_or_else(|| Error::UnknownConnection(format!("{} {}:{}", key.peer, key.stream_type.0, key.port)))
    }

    /// 연결 제거 (같은 키로 교체된 새 연결은 건드리지 않음)
    pub(crate) fn remove_connection(&self, connection: &Connection) -> bool {
        self.connections
            .remove_if(&connection.key(), |_, current| std::ptr::eq(Arc::as_ptr(current), connection))
            .is_some()
    }

    /// 수신 패킷 처리 (포트 검증은 서버가 이미 수행)
    pub async fn handle_packet(self: &Arc<Self>, packet: Packet, transport: PeerTransport) -> Result<()> {
        let key = ConnectionKey::new(transport.peer_id(), packet.source);

        if packet.flags.is_ack() {
            let connection = self.require_connection(&key)?;
            self.verify(&connection, &packet)?;
            connection.touch();
            if packet.has_flag(PacketFlags::MULTI_ACK) {
                return connection.handle_aggregate_ack(&packet);
            }
            connection.handle_ack(&packet);
            return Ok(());
        }

        match packet.packet_type {
            PacketType::Syn => self.handle_syn(key, packet, transport).await,
            PacketType::Connect => self.handle_connect(key, packet).await,
            PacketType::Data => {
                let connection = self.require_connection(&key)?;
                self.verify(&connection, &packet)?;
                connection.touch();
                connection.handle_data(packet).await
            }
            PacketType::Disconnect => {
                let connection = self.require_connection(&key)?;
                self.verify(&connection, &packet)?;
                self.handle_disconnect(connection, packet).await
            }
            PacketType::Ping => {
                let connection = self.require_connection(&key)?;
                self.verify(&connection, &packet)?;
                connection.touch();
                if packet.has_flag(PacketFlags::NEEDS_ACK) {
                    connection.send_ack(&packet).await?;
                }
                Ok(())
            }
        }
    }

    /// 연결 수립 이후 패킷만 서명 검증 (SYN/CONNECT는 키 재료가 아직 없음)
    fn verify(&self, connection: &Connection, packet: &Packet) -> Result<()> {
        let config = &self.context()?.config;
        if !config.verify_signatures || !connection.is_established() {
            return Ok(());
        }
        connection.verify(packet)
    }

    /// SYN: 새 연결 생성 (기존 연결은 교체)
    async fn handle_syn(self: &Arc<Self>, key: ConnectionKey, packet: Packet, transport: PeerTransport) -> Result<()> {
        let context = self.context()?;
        let config = &context.config;

        let server_signature = match packet.dialect {
            Dialect::V0 => Bytes::copy_from_slice(&crypto::v0_connection_signature(&transport.addr())),
            Dialect::V1 | Dialect::Lite => Bytes::copy_from_slice(&crypto::v1_connection_signature(
                &config.v1_connection_signature_key,
                &transport.addr(),
            )),
        };
        let server_session_id: u8 = rand::random();

        let connection = Connection::new(
            key,
            transport,
            packet.dialect,
            packet.destination,
            packet.source,
            Arc::clone(config),
            Arc::downgrade(self),
            context.events.clone(),
        );
        connection.prepare_syn(server_signature.clone(), server_session_id);

        if let Some(previous) = self.connections.insert(key, Arc::clone(&connection)) {
            debug!("SYN 재수신, 연결 교체: {}", key.peer);
            previous.close(ConnectionState::Disconnected);
        }

        let mut reply = packet.ack();
        reply.connection_signature = server_signature;
        reply.options.supported_functions = config.supported_functions & packet.options.supported_functions;
        reply.options.minor_version = config.minor_version;
        reply.options.max_substream_id = config.max_substream_id.min(packet.options.max_substream_id);

        connection.send_packet(reply).await
    }

    /// CONNECT: 핸드쉐이크 완료
    async fn handle_connect(&self, key: ConnectionKey, packet: Packet) -> Result<()> {
        let context = self.context()?;
        let config = &context.config;
        let connection = self.require_connection(&key)?;

        let reply_template = |response: Bytes| {
            let mut reply = packet.ack();
            reply.connection_signature = Bytes::from(vec![0u8; packet.dialect.connection_signature_size()]);
            reply.options.supported_functions = config.supported_functions & packet.options.supported_functions;
            reply.options.minor_version = config.minor_version;
            reply.options.max_substream_id = config.max_substream_id.min(packet.options.max_substream_id);
            reply.payload = response;
            reply
        };

        match connection.state() {
            ConnectionState::Connecting => {}
            ConnectionState::Established => {
                debug!("중복 CONNECT 재ACK: {}", key.peer);
                let response = connection.connect_response().unwrap_or_default();
                return connection.send_packet(reply_template(response)).await;
            }
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "종료된 연결에 CONNECT: {:?}",
                    state
                )));
            }
        }

        let outcome = match &self.connect_handler {
            Some(handler) => handler.on_connect(&connection, &packet.payload).await,
            None => Ok(ConnectOutcome::default()),
        };
        let outcome = match outcome.and_then(|outcome| check_session_key(outcome, config.session_key_length)) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("CONNECT 거부 {}: {}", key.peer, e);
                self.remove_connection(&connection);
                connection.close(ConnectionState::Disconnected);
                return Err(match e {
                    Error::Handshake(_) => e,
                    other => Error::Handshake(other.to_string()),
                });
            }
        };

        let max_substream_id = config.max_substream_id.min(packet.options.max_substream_id);
        connection.establish(
            Handshake {
                client_signature: packet.connection_signature.clone(),
                client_session_id: packet.session_id,
                session_key: outcome.session_key.unwrap_or_default(),
                substream_count: max_substream_id as usize + 1,
                incoming_expected: packet.sequence_id.wrapping_add(1),
                initial_unreliable_sequence_id: packet.options.initial_unreliable_sequence_id,
            },
            outcome.response.clone(),
        );

        // 응답이 유실돼도 클라이언트의 CONNECT 재전송에 다시 응답한다
        if let Err(e) = connection.send_packet(reply_template(outcome.response)).await {
            warn!("CONNECT 응답 전송 실패 {}: {}", key.peer, e);
        }

        info!("연결 수립: {} (stream {})", key.peer, self.stream_id);
        connection.emit(|connection| ServerEvent::Connected { connection }).await;
        Ok(())
    }

    /// DISCONNECT: ACK 후 연결 제거
    async fn handle_disconnect(&self, connection: Arc<Connection>, packet: Packet) -> Result<()> {
        // ACK 전송 실패와 무관하게 정리는 진행
        if let Err(e) = connection.send_ack(&packet).await {
            debug!("DISCONNECT ACK 실패: {}", e);
        }

        self.remove_connection(&connection);
        if connection.close(ConnectionState::Disconnected) {
            info!("연결 종료: {}", connection.peer_id());
            connection.emit(|connection| ServerEvent::Disconnected { connection }).await;
        }
        Ok(())
    }

    /// 유휴 연결 정리, 제거된 연결 반환
    pub fn disconnect_idle(&self, timeout: Duration) -> Vec<Arc<Connection>> {
        self.drain_where(|connection| connection.idle_for() >= timeout)
    }

    /// 물리 연결(WebSocket)이 끊긴 피어의 연결 정리
    pub fn disconnect_peer(&self, peer: PeerId) -> Vec<Arc<Connection>> {
        self.drain_where(|connection| connection.peer_id() == peer)
    }

    fn drain_where(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        targets
            .into_iter()
            .filter(|connection| {
                self.remove_connection(connection);
                connection.close(ConnectionState::Disconnected)
            })
            .collect()
    }
}

/// 핸들러가 돌려준 세션 키 길이 확인
fn check_session_key(outcome: ConnectOutcome, expected: usize) -> Result<ConnectOutcome> {
    match outcome.session_key {
        Some(ref key) if key.len() != expected => Err(Error::Handshake(format!(
            "세션 키 길이 불일치: {} bytes (기대 {})",
            key.len(),
            expected
        ))),
        _ => Ok(outcome),
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("stream_id", &self.stream_id)
            .field("connections", &self.connections.len())
            .finish()
    }
}
