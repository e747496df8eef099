//! One client connection bridged over one CONNECT stream
//!
//! The session sends the CONNECT request, then runs two copy directions as
//! independent tasks and waits for the first of them to report. Completion
//! of either direction ends the session with a graceful close; a failure
//! from the upstream direction carries a verdict that may force a reset.

use bytes::Bytes;
use h2tunnel_transport::{
    body_pipe, BackendTarget, BodyWriter, DebugSink, ResponseBody, TunnelTransport,
    DEFAULT_PIPE_CAPACITY,
};
use http::{Method, Request, StatusCode};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, ErrorVerdict};
use crate::client::ClientConnection;
use crate::proxy_header::{self, ProxyHeaderLine};

/// Read-ahead buffer on the client side
const CLIENT_READ_BUFFER: usize = 32 * 1024;

/// Per-tunnel settings shared by every session
#[derive(Debug, Clone, Copy)]
pub struct TunnelConfig {
    /// Authority of the CONNECT request and destination of the PROXY line
    pub target: SocketAddrV4,
    /// Prepend a PROXY v1 line to the upstream byte stream
    pub proxy_header: bool,
    pub debug: DebugSink,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            target: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3306),
            proxy_header: true,
            debug: DebugSink::disabled(),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A direction reached its end without error
    Completed,
    Failed(ErrorVerdict),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: Option<SocketAddr>,
    pub end: SessionEnd,
}

impl SessionSummary {
    /// Whether the client was closed with RST
    pub fn force_reset(&self) -> bool {
        matches!(self.end, SessionEnd::Failed(v) if v.is_force_reset())
    }
}

/// Build the CONNECT request for `target`
pub fn connect_request(target: SocketAddrV4) -> Result<Request<()>, http::Error> {
    Request::builder()
        .method(Method::CONNECT)
        .uri(target.to_string())
        .body(())
}

/// Bridge one accepted client connection through the backend.
///
/// Returns once the client connection has been closed. The copy tasks may
/// outlive this call briefly while they observe the teardown, each logging
/// its byte total on the way out.
pub async fn run<T>(
    backend: &BackendTarget,
    transport: &T,
    client: TcpStream,
    config: &TunnelConfig,
) -> SessionSummary
where
    T: TunnelTransport + ?Sized,
{
    let peer = client.peer_addr().ok();

    let client = match ClientConnection::new(client) {
        Ok(c) => c,
        Err(e) => {
            warn!(?peer, "Cannot take control of client socket: {}", e);
            return SessionSummary {
                peer,
                end: SessionEnd::Failed(ErrorVerdict::Benign),
            };
        }
    };
    let peer = client.peer_addr();
    config.debug.event(format_args!("Client {} session started", peer));

    let request = match connect_request(config.target) {
        Ok(r) => r,
        Err(e) => {
            error!(%peer, "Invalid CONNECT target {}: {}", config.target, e);
            return fail(client, peer, ErrorVerdict::ForceReset);
        }
    };

    let (writer, reader) = body_pipe(DEFAULT_PIPE_CAPACITY);
    let pipe = writer.closer();

    let response = match transport.round_trip(backend, request, reader).await {
        Ok(response) => response,
        Err(e) => {
            error!(%peer, "Error in CONNECT round trip to {}: {}", backend, e);
            pipe.close();
            return fail(client, peer, ErrorVerdict::ForceReset);
        }
    };

    if response.status != StatusCode::OK {
        warn!(%peer, status = %response.status, "Backend refused tunnel");
        pipe.close();
        return fail(client, peer, ErrorVerdict::ForceReset);
    }

    debug!(%peer, status = %response.status, "Tunnel established");

    let (stream, closer) = client.into_parts();
    let (read_half, write_half) = stream.into_split();
    let cancel = CancellationToken::new();

    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);
    let (fail_tx, mut fail_rx) = mpsc::channel::<ErrorVerdict>(1);

    tokio::spawn(client_to_upstream(ClientDirection {
        read_half,
        writer,
        backend_host: backend.host().to_string(),
        backend_port: backend.port(),
        peer,
        config: *config,
        done: done_tx.clone(),
    }));

    tokio::spawn(upstream_to_client(UpstreamDirection {
        body: response.body,
        write_half,
        peer,
        debug: config.debug,
        cancel: cancel.clone(),
        done: done_tx,
        fail: fail_tx,
    }));

    let end = tokio::select! {
        Some(()) = done_rx.recv() => SessionEnd::Completed,
        Some(verdict) = fail_rx.recv() => SessionEnd::Failed(verdict),
        else => SessionEnd::Completed,
    };

    let verdict = match end {
        SessionEnd::Completed => ErrorVerdict::Benign,
        SessionEnd::Failed(v) => v,
    };

    // Closing the socket and the pipe unblocks both copies; the token ends
    // a response body read that neither close reaches.
    closer.close(verdict);
    pipe.close();
    cancel.cancel();

    info!(%peer, reset = verdict.is_force_reset(), "Client disconnected");

    SessionSummary {
        peer: Some(peer),
        end,
    }
}

fn fail(client: ClientConnection, peer: SocketAddr, verdict: ErrorVerdict) -> SessionSummary {
    client.close(verdict);
    SessionSummary {
        peer: Some(peer),
        end: SessionEnd::Failed(verdict),
    }
}

struct ClientDirection {
    read_half: OwnedReadHalf,
    writer: BodyWriter,
    backend_host: String,
    backend_port: u16,
    peer: SocketAddr,
    config: TunnelConfig,
    done: mpsc::Sender<()>,
}

/// Client bytes into the request body. Always reports completion.
async fn client_to_upstream(dir: ClientDirection) {
    let ClientDirection {
        read_half,
        writer,
        backend_host,
        backend_port,
        peer,
        config,
        done,
    } = dir;

    let header = client_header(&backend_host, backend_port, peer, &config).await;
    let reader = BufReader::with_capacity(CLIENT_READ_BUFFER, read_half);
    let mut sent = 0u64;
    forward_client(reader, &writer, header, peer, config.debug, &mut sent).await;

    writer.close();
    config
        .debug
        .event(format_args!("Client {}: {} bytes sent upstream", peer, sent));
    let _ = done.try_send(());
}

async fn client_header(
    backend_host: &str,
    backend_port: u16,
    peer: SocketAddr,
    config: &TunnelConfig,
) -> ProxyHeaderLine {
    if config.proxy_header {
        proxy_header::build(backend_host, backend_port, config.target, peer).await
    } else {
        ProxyHeaderLine::empty()
    }
}

/// Copy client bytes into the pipe, counting payload bytes into `total`.
/// Returns on client EOF or error or a closed pipe; teardown produces one of
/// those by shutting the socket down and closing the pipe.
async fn forward_client(
    mut reader: BufReader<OwnedReadHalf>,
    writer: &BodyWriter,
    header: ProxyHeaderLine,
    peer: SocketAddr,
    debug: DebugSink,
    total: &mut u64,
) {
    let label = format!("client {}", peer);

    // Hold the header back until the client has sent something
    match reader.fill_buf().await.map(|buf| buf.is_empty()) {
        Ok(false) => {}
        Ok(true) => return,
        Err(e) => {
            debug!(%peer, "Client read failed before first byte: {}", e);
            return;
        }
    }

    if !header.is_empty() {
        debug!(%peer, "Sending {}", header);
        if writer
            .write(Bytes::copy_from_slice(header.as_bytes()))
            .await
            .is_err()
        {
            return;
        }
    }

    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => return,
            Ok(buf) => Bytes::copy_from_slice(buf),
            Err(e) => {
                debug!(%peer, "Client read ended: {}", e);
                return;
            }
        };
        let n = chunk.len();
        reader.consume(n);
        debug.read(n, &label);

        if writer.write(chunk).await.is_err() {
            debug!(%peer, "Request body closed, dropping client bytes");
            return;
        }
        *total += n as u64;
    }
}

struct UpstreamDirection {
    body: ResponseBody,
    write_half: OwnedWriteHalf,
    peer: SocketAddr,
    debug: DebugSink,
    cancel: CancellationToken,
    done: mpsc::Sender<()>,
    fail: mpsc::Sender<ErrorVerdict>,
}

/// Response body into the client. Errors are classified and reported.
async fn upstream_to_client(dir: UpstreamDirection) {
    let UpstreamDirection {
        mut body,
        mut write_half,
        peer,
        debug,
        cancel,
        done,
        fail,
    } = dir;

    let mut received = 0u64;
    let result = copy_response(
        &mut body,
        &mut write_half,
        peer,
        debug,
        &cancel,
        &mut received,
    )
    .await;

    // Dropping the half normally shuts down writing, which would put a FIN
    // on the wire ahead of a zero-linger RST. The session's closer decides.
    write_half.forget();

    debug.event(format_args!(
        "Client {}: {} bytes received from upstream",
        peer, received
    ));
    if cancel.is_cancelled() {
        return;
    }

    match result {
        Ok(()) => {
            let _ = done.try_send(());
        }
        Err(e) => {
            let verdict = classify(&e);
            warn!(%peer, ?verdict, "Client got error copying from upstream: {}", e);
            let _ = fail.try_send(verdict);
        }
    }
}

/// Copy the response body to the client, counting bytes into `total`.
/// Teardown ends the copy with `Ok`.
async fn copy_response(
    body: &mut ResponseBody,
    write_half: &mut OwnedWriteHalf,
    peer: SocketAddr,
    debug: DebugSink,
    cancel: &CancellationToken,
    total: &mut u64,
) -> io::Result<()> {
    let label = format!("client {}", peer);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            c = body.chunk() => c,
        };
        let Some(chunk) = chunk else {
            return Ok(());
        };
        let chunk = chunk.map_err(io::Error::other)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            r = write_half.write_all(&chunk) => r?,
        }
        debug.wrote(chunk.len(), &label);
        *total += chunk.len() as u64;
    }
}
