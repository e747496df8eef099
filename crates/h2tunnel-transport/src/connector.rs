//! Dialing the backend: TCP, then TLS with ALPN `h2` (or cleartext h2c),
//! then the HTTP/2 handshake

use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::backend::BackendTarget;
use crate::config::H2Config;
use crate::connection::H2ClientConnection;
use crate::instrument::Instrumented;
use crate::{TransportError, TransportResult};

/// HTTP/2 connector for establishing outgoing backend connections
pub struct H2Connector {
    tls_connector: TlsConnector,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector").finish()
    }
}

impl H2Connector {
    pub fn new(config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;

        let tls_connector = config.build_tls_connector()?;

        debug!("HTTP/2 connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }

    /// Dial the backend. `connect_timeout` bounds the TCP connect together
    /// with the TLS and HTTP/2 handshakes.
    pub async fn connect(&self, backend: &BackendTarget) -> TransportResult<H2ClientConnection> {
        debug!("Connecting to HTTP/2 backend: {}", backend.authority());

        tokio::time::timeout(self.config.connect_timeout, self.dial(backend))
            .await
            .map_err(|_| {
                warn!(
                    "Connecting to {} timed out after {:?}",
                    backend.authority(),
                    self.config.connect_timeout
                );
                TransportError::Timeout
            })?
    }

    async fn dial(&self, backend: &BackendTarget) -> TransportResult<H2ClientConnection> {
        let authority = backend.authority();

        let tcp_stream = TcpStream::connect((backend.host(), backend.port()))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect to {} failed: {}", authority, e)))?;

        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY towards {}: {}", authority, e);
        }
        let remote_addr = tcp_stream.peer_addr()?;

        if !backend.is_tls() {
            let io = Instrumented::new(tcp_stream, self.config.debug, "proxy");
            let conn = H2ClientConnection::handshake(io, remote_addr, &self.config).await?;
            info!("HTTP/2 (cleartext) connection established to {} ({})", authority, remote_addr);
            return Ok(conn);
        }

        let server_name = ServerName::try_from(backend.host().to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = self
            .tls_connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        let negotiated = tls_stream.get_ref().1.alpn_protocol();
        if negotiated != Some(b"h2".as_slice()) {
            return Err(TransportError::ProtocolError(format!(
                "Backend {} did not negotiate h2 via ALPN (got {:?})",
                authority,
                negotiated.map(String::from_utf8_lossy)
            )));
        }

        let io = Instrumented::new(tls_stream, self.config.debug, "proxy");
        let conn = H2ClientConnection::handshake(io, remote_addr, &self.config).await?;

        info!("HTTP/2 connection established to {} ({})", authority, remote_addr);

        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_connector_rejects_invalid_config() {
        let mut config = H2Config::client_default();
        config.initial_window_size = 0;
        assert!(H2Connector::new(Arc::new(config)).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = H2Config::client_default().with_connect_timeout(Duration::from_secs(1));
        let connector = H2Connector::new(Arc::new(config)).unwrap();
        let backend = BackendTarget::parse(&format!("http://127.0.0.1:{}", port)).unwrap();

        let err = connector.connect(&backend).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionError(_)));
        assert!(!err.is_protocol_fatal());
    }

    #[tokio::test]
    async fn test_silent_backend_times_out_during_tls() {
        // Accepts TCP and never answers the ClientHello
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = H2Config::client_default().with_connect_timeout(Duration::from_millis(300));
        let connector = H2Connector::new(Arc::new(config)).unwrap();
        let backend = BackendTarget::parse(&format!("https://{}", addr)).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), connector.connect(&backend))
            .await
            .expect("handshake should be bounded by connect_timeout")
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }
}
