//! Client-side HTTP/2 connection to the backend

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::config::H2Config;
use crate::{TransportError, TransportResult};

/// Multiplexed HTTP/2 client connection
///
/// Cheap to clone; every clone shares the same underlying connection.
/// Streams are opened through [`H2ClientConnection::ready`].
#[derive(Clone)]
pub struct H2ClientConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    send_request: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for H2ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2ClientConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl H2ClientConnection {
    /// Run the HTTP/2 client handshake over an established byte stream and
    /// spawn the connection driver
    pub async fn handshake<T>(io: T, remote_addr: SocketAddr, config: &H2Config) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("h2-client-{}", uuid::Uuid::new_v4());

        let (send_request, mut h2_conn) = h2::client::Builder::new()
            .initial_window_size(config.initial_window_size)
            .initial_connection_window_size(config.initial_connection_window_size)
            .max_frame_size(config.max_frame_size)
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let dead = Arc::new(Notify::new());

        if let (Some(interval), Some(ping_pong)) = (config.read_idle_timeout, h2_conn.ping_pong()) {
            tokio::spawn(keep_alive(
                connection_id.clone(),
                ping_pong,
                interval,
                config.ping_timeout,
                closed.clone(),
                dead.clone(),
            ));
        }

        // Spawn connection driver
        let closed_clone = closed.clone();
        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = h2_conn => {
                    if let Err(e) = result {
                        if e.is_go_away() || e.is_io() {
                            debug!("[{}] H2 connection ended: {}", conn_id, e);
                        } else {
                            error!("[{}] H2 connection error: {}", conn_id, e);
                        }
                    }
                }
                _ = dead.notified() => {
                    warn!("[{}] Dropping H2 connection after failed health check", conn_id);
                }
            }
            debug!("[{}] H2 connection closed", conn_id);
            closed_clone.store(true, Ordering::SeqCst);
        });

        debug!("[{}] H2 connection established to {}", connection_id, remote_addr);

        Ok(Self {
            connection_id,
            remote_addr,
            send_request,
            closed,
        })
    }

    /// Wait until the connection can accept another stream
    pub async fn ready(&self) -> TransportResult<SendRequest<Bytes>> {
        if self.is_closed() {
            return Err(TransportError::ConnectionError(
                "Connection closed".to_string(),
            ));
        }

        self.send_request.clone().ready().await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            TransportError::from(e)
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Stop handing this connection out for new streams
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// PING the backend every `interval`; a missing PONG tears the connection
/// down so in-flight streams fail instead of hanging on a dead peer.
async fn keep_alive(
    conn_id: String,
    mut ping_pong: PingPong,
    interval: Duration,
    ping_timeout: Duration,
    closed: Arc<AtomicBool>,
    dead: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        ticker.tick().await;
        if closed.load(Ordering::SeqCst) {
            return;
        }

        match tokio::time::timeout(ping_timeout, ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_)) => debug!("[{}] PING acknowledged", conn_id),
            Ok(Err(e)) => {
                debug!("[{}] PING failed: {}", conn_id, e);
                break;
            }
            Err(_) => {
                warn!(
                    "[{}] No PING acknowledgement within {:?}",
                    conn_id, ping_timeout
                );
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    dead.notify_one();
}
