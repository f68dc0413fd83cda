//! 물리 전송 계층 (UDP 소켓 / WebSocket 연결)

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// 물리 피어 식별자 (연결 키의 일부)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerId {
    Udp(SocketAddr),
    /// 수락한 WebSocket 연결마다 부여하는 ID
    WebSocket(u64),
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Udp(addr) => write!(f, "udp://{}", addr),
            PeerId::WebSocket(id) => write!(f, "ws#{}", id),
        }
    }
}

/// 패킷을 돌려보낼 물리 경로
#[derive(Clone)]
pub enum PeerTransport {
    /// 공유 UDP 소켓 + 상대 주소
    Udp {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
    /// WebSocket 쓰기 태스크로 가는 채널
    WebSocket {
        id: u64,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<Bytes>,
    },
}

impl PeerTransport {
    pub fn udp(socket: Arc<UdpSocket>, addr: SocketAddr) -> Self {
        PeerTransport::Udp { socket, addr }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            PeerTransport::Udp { addr, .. } => PeerId::Udp(*addr),
            PeerTransport::WebSocket { id, .. } => PeerId::WebSocket(*id),
        }
    }

    /// 원격 주소
    pub fn addr(&self) -> SocketAddr {
        match self {
            PeerTransport::Udp { addr, .. } | PeerTransport::WebSocket { addr, .. } => *addr,
        }
    }

    /// lite 방언 허용 여부 (WebSocket에서만)
    pub fn allows_lite(&self) -> bool {
        matches!(self, PeerTransport::WebSocket { .. })
    }

    /// 인코딩된 패킷 전송
    pub async fn send(&self, data: Bytes) -> Result<()> {
        match self {
            PeerTransport::Udp { socket, addr } => {
                socket.send_to(&data, addr).await?;
                Ok(())
            }
            PeerTransport::WebSocket { tx, .. } => tx.send(data).map_err(|_| Error::ConnectionClosed),
        }
    }
}

impl fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id())
    }
}
