//! End-to-end sessions against an in-process cleartext HTTP/2 CONNECT server

use bytes::{Bytes, BytesMut};
use h2tunnel_core::{TunnelConfig, TunnelListener};
use h2tunnel_transport::{BackendTarget, H2Config, H2Transport};
use http::{Method, Response, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

const TIMEOUT: Duration = Duration::from_secs(5);

/// What the backend does with each CONNECT stream
#[derive(Clone)]
enum Mode {
    /// 200, strip a leading PROXY line and echo the rest
    Echo,
    /// Respond with this status and end the stream
    Status(StatusCode),
    /// 200, send these bytes, then reset with PROTOCOL_ERROR once triggered
    ResetAfter(Bytes, Arc<Notify>),
}

/// Observations made by the backend
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Connect { authority: String },
    ProxyLine(String),
    Payload(usize),
    EndOfRequest,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("h2tunnel=debug,h2tunnel_core=debug,h2tunnel_transport=debug")
        .with_test_writer()
        .try_init();
}

struct Backend {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<Event>,
    /// TCP connections accepted so far
    connections: Arc<AtomicUsize>,
}

async fn spawn_backend(mode: Mode) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let mode = mode.clone();
            let events = events_tx.clone();

            tokio::spawn(async move {
                let mut conn = match h2::server::handshake(socket).await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                while let Some(Ok((request, respond))) = conn.accept().await {
                    tokio::spawn(handle_stream(request, respond, mode.clone(), events.clone()));
                }
            });
        }
    });

    Backend {
        addr,
        events,
        connections,
    }
}

async fn handle_stream(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    mode: Mode,
    events: mpsc::UnboundedSender<Event>,
) {
    assert_eq!(request.method(), Method::CONNECT);
    let authority = request
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let _ = events.send(Event::Connect { authority });
    let mut body = request.into_body();

    match mode {
        Mode::Status(status) => {
            let response = Response::builder().status(status).body(()).unwrap();
            let _ = respond.send_response(response, true);
        }
        Mode::ResetAfter(data, trigger) => {
            let response = Response::builder().status(200).body(()).unwrap();
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(data, false).unwrap();
            trigger.notified().await;
            send.send_reset(h2::Reason::PROTOCOL_ERROR);
        }
        Mode::Echo => {
            let response = Response::builder().status(200).body(()).unwrap();
            let mut send = respond.send_response(response, false).unwrap();

            let mut pending = BytesMut::new();
            let mut header_checked = false;

            while let Some(chunk) = body.data().await {
                let Ok(chunk) = chunk else { return };
                let _ = body.flow_control().release_capacity(chunk.len());
                pending.extend_from_slice(&chunk);

                if !header_checked {
                    if pending.len() < 6 && b"PROXY "[..pending.len()] == pending[..] {
                        continue;
                    }
                    if pending.starts_with(b"PROXY ") {
                        let Some(end) = pending.windows(2).position(|w| w == b"\r\n") else {
                            continue;
                        };
                        let line = pending.split_to(end + 2);
                        let line = String::from_utf8_lossy(&line[..end]).into_owned();
                        let _ = events.send(Event::ProxyLine(line));
                    }
                    header_checked = true;
                }

                if !pending.is_empty() {
                    let payload = pending.split().freeze();
                    let _ = events.send(Event::Payload(payload.len()));
                    if send.send_data(payload, false).is_err() {
                        return;
                    }
                }
            }

            let _ = events.send(Event::EndOfRequest);
            let _ = send.send_data(Bytes::new(), true);
        }
    }
}

async fn start_tunnel(backend_addr: SocketAddr) -> SocketAddr {
    let config = H2Config::client_default().with_read_idle_timeout(None);
    let transport = Arc::new(H2Transport::new(Arc::new(config)).unwrap());
    let backend = BackendTarget::parse(&format!("http://{}", backend_addr)).unwrap();

    let listener = TunnelListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        backend,
        transport,
        TunnelConfig::default(),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(listener.serve());
    addr
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("backend event timed out")
        .expect("backend stopped")
}

#[tokio::test]
async fn test_echo_with_proxy_header_and_graceful_close() {
    init_tracing();
    let Backend {
        addr: backend_addr,
        mut events,
        ..
    } = spawn_backend(Mode::Echo).await;
    let tunnel_addr = start_tunnel(backend_addr).await;

    let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
    let client_port = client.local_addr().unwrap().port();

    client.write_all(b"0123456789").await.unwrap();
    let mut echoed = [0u8; 10];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"0123456789");

    assert_eq!(
        next_event(&mut events).await,
        Event::Connect {
            authority: "127.0.0.1:3306".to_string()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::ProxyLine(format!("PROXY TCP4 127.0.0.1 127.0.0.1 {} 3306", client_port))
    );
    assert_eq!(next_event(&mut events).await, Event::Payload(10));

    client.shutdown().await.unwrap();

    // Graceful: FIN, not RST
    let mut rest = Vec::new();
    let read = tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(read.is_ok(), "expected clean close, got {:?}", read);
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_non_200_resets_client() {
    init_tracing();
    let Backend {
        addr: backend_addr,
        mut events,
        ..
    } = spawn_backend(Mode::Status(StatusCode::SERVICE_UNAVAILABLE)).await;
    let tunnel_addr = start_tunnel(backend_addr).await;

    let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connect { .. }));

    let mut buf = [0u8; 16];
    let err = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
}

#[tokio::test]
async fn test_zero_byte_client_sends_no_header() {
    init_tracing();
    let Backend {
        addr: backend_addr,
        mut events,
        ..
    } = spawn_backend(Mode::Echo).await;
    let tunnel_addr = start_tunnel(backend_addr).await;

    let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connect { .. }));

    client.shutdown().await.unwrap();

    // The request body ends without a PROXY line or any payload
    assert_eq!(next_event(&mut events).await, Event::EndOfRequest);

    let mut rest = Vec::new();
    let read = tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(read.is_ok(), "expected clean close, got {:?}", read);
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_mid_stream_reset_resets_client() {
    init_tracing();
    let trigger = Arc::new(Notify::new());
    let Backend {
        addr: backend_addr,
        mut events,
        ..
    } = spawn_backend(Mode::ResetAfter(Bytes::from_static(b"hello"), trigger.clone())).await;
    let tunnel_addr = start_tunnel(backend_addr).await;

    let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
    assert!(matches!(next_event(&mut events).await, Event::Connect { .. }));

    let mut buf = [0u8; 5];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    trigger.notify_one();

    let err = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
}

#[tokio::test]
async fn test_connections_share_one_backend_connection() {
    init_tracing();
    let Backend {
        addr: backend_addr,
        mut events,
        connections,
    } = spawn_backend(Mode::Echo).await;
    let tunnel_addr = start_tunnel(backend_addr).await;

    for i in 0..3u8 {
        let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
        client.write_all(&[b'a' + i; 4]).await.unwrap();

        let mut echoed = [0u8; 4];
        tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, [b'a' + i; 4]);
        let mut event = next_event(&mut events).await;
        // End of the previous tunnel's request body may still be in flight
        if event == Event::EndOfRequest {
            event = next_event(&mut events).await;
        }
        assert!(matches!(event, Event::Connect { .. }));
        assert!(matches!(next_event(&mut events).await, Event::ProxyLine(_)));
        assert_eq!(next_event(&mut events).await, Event::Payload(4));

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest)).await;
    }

    assert_eq!(connections.load(Ordering::SeqCst), 1);
}
