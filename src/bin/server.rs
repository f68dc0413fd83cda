//! PRUDP 에코 서버
//!
//! endpoint 하나를 바인딩하고 받은 신뢰성 페이로드를 같은 substream으로
//! 돌려보낸다.
//!
//! 사용법:
//!   cargo run --release --bin prudp-server -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin prudp-server -- --bind 0.0.0.0:60000 --access-key ridfebb9
//!   RUST_LOG=prudp=debug cargo run --bin prudp-server -- --legacy-v0

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use prudp::{Config, Endpoint, Server, ServerEvent};

/// 실행 옵션
struct ServerOptions {
    bind_addr: SocketAddr,
    stream_id: u8,
    config: Config,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 60000)),
            stream_id: 1,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 에 값이 필요합니다", flag))
}

fn parse_args() -> Result<ServerOptions, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ServerOptions::default();
    let mut access_key = None;
    let mut fragment_size = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bind" | "-b" => {
                options.bind_addr = value(&args, i, flag)?
                    .parse()
                    .map_err(|e| format!("잘못된 주소: {}", e))?;
                i += 1;
            }
            "--stream-id" => {
                options.stream_id = value(&args, i, flag)?
                    .parse()
                    .map_err(|e| format!("잘못된 stream id: {}", e))?;
                i += 1;
            }
            "--access-key" | "-k" => {
                access_key = Some(value(&args, i, flag)?.to_string());
                i += 1;
            }
            "--fragment-size" => {
                fragment_size = Some(
                    value(&args, i, flag)?
                        .parse::<usize>()
                        .map_err(|e| format!("잘못된 프래그먼트 크기: {}", e))?,
                );
                i += 1;
            }
            "--legacy-v0" => {
                options.config = Config::legacy_v0();
            }
            "--help" | "-h" => {
                println!(
                    r#"PRUDP 에코 서버

사용법:
  cargo run --release --bin prudp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:60000)
  --stream-id <ID>          endpoint stream id (기본: 1)
  -k, --access-key <KEY>    access key
  --fragment-size <SIZE>    프래그먼트 크기 (기본: 1300)
  --legacy-v0               구형 v0 (Quazal) 설정 사용
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other)),
        }
        i += 1;
    }

    // 프리셋을 고른 뒤에 개별 값을 덮어쓴다
    if let Some(access_key) = access_key {
        options.config.access_key = access_key;
    }
    if let Some(fragment_size) = fragment_size {
        options.config.fragment_size = fragment_size;
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = parse_args()?;

    info!("PRUDP 서버 시작");
    info!("  Bind: {}", options.bind_addr);
    info!("  Stream id: {}", options.stream_id);
    info!("  Fragment size: {} bytes", options.config.fragment_size);

    let (server, mut events) = Server::new(options.config);
    server.bind_endpoint(Arc::new(Endpoint::new(options.stream_id)));
    server.bind_udp(options.bind_addr).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    ServerEvent::Connected { connection } => {
                        info!("연결: {} (session {:02X})", connection.peer_id(), connection.client_session_id());
                    }
                    ServerEvent::Data { connection, substream_id, reliable, payload } => {
                        info!("수신 {} bytes from {} (substream {})", payload.len(), connection.peer_id(), substream_id);
                        if !reliable {
                            continue;
                        }
                        let server = Arc::clone(&server);
                        // 페이싱 대기가 이벤트 루프를 막지 않도록 분리
                        tokio::spawn(async move {
                            if let Err(e) = server.send(&connection, substream_id, payload).await {
                                warn!("에코 실패 {}: {}", connection.peer_id(), e);
                            }
                        });
                    }
                    ServerEvent::Disconnected { connection } => {
                        info!("연결 종료: {}", connection.peer_id());
                    }
                    ServerEvent::ConnectionFailed { connection, reason } => {
                        warn!("연결 실패 {}: {}", connection.peer_id(), reason);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료 신호 수신");
                server.stop();
                break;
            }
        }
    }

    Ok(())
}
