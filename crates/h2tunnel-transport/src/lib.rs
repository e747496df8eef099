//! HTTP/2 CONNECT transport using h2
//!
//! This crate opens tunnel streams on an HTTP/2 intermediary (for example an
//! Envoy listener terminating CONNECT). One multiplexed connection is kept per
//! backend authority and every tunnel is a single CONNECT stream on it.
//!
//! # Stream Mapping
//!
//! - Request body = bytes flowing towards the target, fed through a [`body_pipe`]
//! - Response body = bytes flowing back, read from [`ResponseBody`]
//! - Pipe close = END_STREAM on the request side
//! - RST_STREAM / GOAWAY surface as protocol-fatal [`TransportError`]s

pub mod backend;
pub mod config;
pub mod connection;
pub mod connector;
pub mod debug;
pub mod error;
pub mod instrument;
pub mod keylog;
pub mod pipe;
pub mod stream;

pub use backend::{BackendScheme, BackendTarget};
pub use config::{H2Config, KEY_LOG_ENV};
pub use connection::H2ClientConnection;
pub use connector::H2Connector;
pub use debug::DebugSink;
pub use error::{TransportError, TransportResult};
pub use instrument::Instrumented;
pub use pipe::{body_pipe, BodyReader, BodyWriter, PipeCloser, DEFAULT_PIPE_CAPACITY};
pub use stream::{ResponseBody, TunnelResponse};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Anything able to run a streaming CONNECT round trip against a backend
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Send `request` with `body` as its streaming request body and wait for
    /// the response headers. The body keeps streaming after this returns.
    async fn round_trip(
        &self,
        backend: &BackendTarget,
        request: http::Request<()>,
        body: BodyReader,
    ) -> TransportResult<TunnelResponse>;
}

/// HTTP/2 transport with one cached connection per backend authority
pub struct H2Transport {
    connector: H2Connector,
    connections: Mutex<HashMap<String, H2ClientConnection>>,
}

impl std::fmt::Debug for H2Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Transport").finish_non_exhaustive()
    }
}

impl H2Transport {
    pub fn new(config: Arc<H2Config>) -> TransportResult<Self> {
        Ok(Self {
            connector: H2Connector::new(config)?,
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Reuse the live connection for this backend or dial a new one
    async fn connection(&self, backend: &BackendTarget) -> TransportResult<H2ClientConnection> {
        let key = backend.authority();
        if let Some(conn) = self.cached(&key).await {
            return Ok(conn);
        }

        // Dial without the cache lock held so a stalled handshake only
        // delays the sessions waiting on it
        let conn = self.connector.connect(backend).await?;

        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&key).filter(|c| !c.is_closed()) {
            debug!(
                "Keeping {} for {}, dropping concurrent dial {}",
                existing.connection_id(),
                key,
                conn.connection_id()
            );
            return Ok(existing.clone());
        }
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    async fn cached(&self, key: &str) -> Option<H2ClientConnection> {
        let mut connections = self.connections.lock().await;
        let conn = connections.get(key)?;
        if !conn.is_closed() {
            trace!("Reusing {} for {}", conn.connection_id(), key);
            return Some(conn.clone());
        }
        debug!("Discarding closed connection {} for {}", conn.connection_id(), key);
        connections.remove(key);
        None
    }

    /// Drop `conn` from the cache so the next session dials afresh
    async fn forget(&self, backend: &BackendTarget, conn: &H2ClientConnection) {
        conn.mark_closed();
        let key = backend.authority();
        let mut connections = self.connections.lock().await;
        if connections
            .get(&key)
            .is_some_and(|c| c.connection_id() == conn.connection_id())
        {
            connections.remove(&key);
        }
    }
}

#[async_trait]
impl TunnelTransport for H2Transport {
    async fn round_trip(
        &self,
        backend: &BackendTarget,
        request: http::Request<()>,
        mut body: BodyReader,
    ) -> TransportResult<TunnelResponse> {
        let conn = match self.connection(backend).await {
            Ok(conn) => conn,
            Err(e) => {
                body.close();
                return Err(e);
            }
        };

        let mut send_request = match conn.ready().await {
            Ok(sr) => sr,
            Err(e) => {
                self.forget(backend, &conn).await;
                body.close();
                return Err(e);
            }
        };

        let (response, send_stream) = match send_request.send_request(request, false) {
            Ok(pair) => pair,
            Err(e) => {
                // Typically a GOAWAY that arrived while older streams drain
                debug!("[{}] Cannot open stream: {}", conn.connection_id(), e);
                self.forget(backend, &conn).await;
                body.close();
                return Err(e.into());
            }
        };

        let stream_id = send_stream.stream_id().as_u32();
        debug!("[{}] Opened CONNECT stream {}", conn.connection_id(), stream_id);

        tokio::spawn(async move {
            if let Err(e) = stream::pump_request_body(body, send_stream, stream_id).await {
                debug!("Stream {}: request body ended with error: {}", stream_id, e);
            }
        });

        let response = response.await?;
        let (parts, recv) = response.into_parts();

        Ok(TunnelResponse {
            status: parts.status,
            headers: parts.headers,
            body: ResponseBody::from_h2(recv, stream_id),
        })
    }
}
