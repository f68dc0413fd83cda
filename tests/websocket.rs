//! WebSocket(lite) 전송 위에서 서버 흐름 검증

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use prudp::{
    decode, encode, Config, Connection, Dialect, Endpoint, EventReceiver, Packet, PacketFlags, PacketType, Server,
    ServerEvent, SignatureKeys, StreamType, VirtualPort,
};

const WAIT: Duration = Duration::from_secs(5);

/// lite는 v0/v1보다 넓은 포트 범위를 쓴다
const CLIENT_PORT: u8 = 20;

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: Arc<Config>,
}

impl Client {
    async fn connect(addr: SocketAddr, config: Arc<Config>) -> Self {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        Self { ws, config }
    }

    fn packet(&self, packet_type: PacketType, flags: PacketFlags) -> Packet {
        let mut packet = Packet::new(Dialect::Lite, packet_type, flags);
        packet.source = VirtualPort::new(StreamType::RV_SECURE, CLIENT_PORT);
        packet.destination = VirtualPort::new(StreamType::RV_SECURE, 1);
        packet
    }

    async fn send(&mut self, packet: &Packet) {
        let bytes = encode(packet, &self.config, &SignatureKeys::new(&[], &[]));
        self.ws.send(Message::Binary(bytes)).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        loop {
            let message = timeout(WAIT, self.ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Binary(data) = message {
                return decode(&data, &self.config, true).unwrap();
            }
        }
    }

    async fn recv_non_ack(&mut self) -> Packet {
        loop {
            let packet = self.recv().await;
            if !packet.flags.is_ack() {
                return packet;
            }
        }
    }

    async fn handshake(&mut self) {
        let syn = self.packet(PacketType::Syn, PacketFlags::NEEDS_ACK);
        self.send(&syn).await;
        let syn_ack = self.recv().await;
        assert_eq!(syn_ack.dialect, Dialect::Lite);
        assert_eq!(syn_ack.packet_type, PacketType::Syn);
        assert_eq!(syn_ack.destination.port, CLIENT_PORT);

        let mut connect = self.packet(PacketType::Connect, PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK);
        connect.sequence_id = 1;
        connect.connection_signature = Bytes::from(vec![0xC1u8; 16]);
        self.send(&connect).await;

        let connect_ack = self.recv().await;
        assert_eq!(connect_ack.packet_type, PacketType::Connect);
        assert!(connect_ack.has_flag(PacketFlags::ACK));
    }
}

async fn start_server() -> (Arc<Server>, EventReceiver, SocketAddr) {
    let (server, events) = Server::new(Config::websocket().with_access_key("6f599f81"));
    assert!(server.bind_endpoint(Arc::new(Endpoint::new(1))));
    let addr = server.bind_websocket("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (server, events, addr)
}

async fn next_event(events: &mut EventReceiver) -> ServerEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

async fn expect_connected(events: &mut EventReceiver) -> Arc<Connection> {
    match next_event(events).await {
        ServerEvent::Connected { connection } => connection,
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_lite_exchange_is_unencrypted() {
    let (server, mut events, addr) = start_server().await;
    let mut client = Client::connect(addr, Arc::clone(server.config())).await;

    client.handshake().await;
    let connection = expect_connected(&mut events).await;
    assert_eq!(connection.dialect(), Dialect::Lite);
    assert_eq!(connection.remote_port().port, CLIENT_PORT);

    let mut data = client.packet(
        PacketType::Data,
        PacketFlags::RELIABLE | PacketFlags::NEEDS_ACK | PacketFlags::HAS_SIZE,
    );
    data.sequence_id = 2;
    data.payload = Bytes::from_static(b"plain request");
    client.send(&data).await;

    let ack = client.recv().await;
    assert!(ack.has_flag(PacketFlags::ACK));
    assert_eq!(ack.sequence_id, 2);

    match next_event(&mut events).await {
        ServerEvent::Data { payload, reliable, .. } => {
            assert!(reliable);
            assert_eq!(&payload[..], b"plain request");
        }
        other => panic!("unexpected event {:?}", other),
    }

    server.send(&connection, 0, Bytes::from_static(b"plain reply")).await.unwrap();
    let reply = client.recv_non_ack().await;
    assert_eq!(reply.packet_type, PacketType::Data);
    assert_eq!(reply.sequence_id, 2);
    assert_eq!(&reply.payload[..], b"plain reply");

    server.stop();
}

#[tokio::test]
async fn test_ping_over_websocket_records_rtt() {
    let (server, mut events, addr) = start_server().await;
    let mut client = Client::connect(addr, Arc::clone(server.config())).await;
    client.handshake().await;
    let connection = expect_connected(&mut events).await;
    assert!(connection.rtt().is_none());

    server.ping(&connection).await.unwrap();
    let ping = client.recv_non_ack().await;
    assert_eq!(ping.packet_type, PacketType::Ping);
    assert!(ping.has_flag(PacketFlags::NEEDS_ACK));
    assert!(!ping.has_flag(PacketFlags::RELIABLE));

    client.send(&ping.ack()).await;

    let recorded = timeout(WAIT, async {
        while connection.rtt().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(recorded.is_ok());
    server.stop();
}

#[tokio::test]
async fn test_socket_close_tears_down_connections() {
    let (server, mut events, addr) = start_server().await;
    let mut client = Client::connect(addr, Arc::clone(server.config())).await;
    client.handshake().await;
    let connection = expect_connected(&mut events).await;
    assert_eq!(server.endpoint(1).unwrap().connection_count(), 1);

    client.ws.close(None).await.unwrap();

    match next_event(&mut events).await {
        ServerEvent::Disconnected { connection: closed } => assert!(Arc::ptr_eq(&closed, &connection)),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(connection.state().is_closed());
    assert_eq!(server.endpoint(1).unwrap().connection_count(), 0);
    server.stop();
}

#[tokio::test]
async fn test_lite_port_limit_enforced() {
    let (server, _events, addr) = start_server().await;
    let mut client = Client::connect(addr, Arc::clone(server.config())).await;

    let mut syn = client.packet(PacketType::Syn, PacketFlags::NEEDS_ACK);
    syn.source.port = 33;
    client.send(&syn).await;

    assert!(timeout(Duration::from_millis(200), client.ws.next()).await.is_err());
    assert_eq!(server.endpoint(1).unwrap().connection_count(), 0);
    server.stop();
}
