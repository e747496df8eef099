//! Accept loop handing every client to its own session

use h2tunnel_transport::{BackendTarget, TunnelTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::TunnelError;
use crate::session::{self, TunnelConfig};

/// Local listener feeding tunnel sessions
pub struct TunnelListener {
    listener: TcpListener,
    backend: Arc<BackendTarget>,
    transport: Arc<dyn TunnelTransport>,
    config: TunnelConfig,
}

impl std::fmt::Debug for TunnelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("backend", &self.backend.to_string())
            .field("config", &self.config)
            .finish()
    }
}

impl TunnelListener {
    pub async fn bind(
        addr: SocketAddr,
        backend: BackendTarget,
        transport: Arc<dyn TunnelTransport>,
        config: TunnelConfig,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            listener,
            backend: Arc::new(backend),
            transport,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until accepting fails
    pub async fn serve(self) -> Result<(), TunnelError> {
        serve(self.listener, self.backend, self.transport, self.config).await
    }
}

/// Run the accept loop on an already bound listener. Each client gets an
/// independent session task; an accept error ends the loop.
pub async fn serve(
    listener: TcpListener,
    backend: Arc<BackendTarget>,
    transport: Arc<dyn TunnelTransport>,
    config: TunnelConfig,
) -> Result<(), TunnelError> {
    info!(
        "Listening on {} (backend {}, target {})",
        listener.local_addr()?,
        backend,
        config.target
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                return Err(TunnelError::Accept(e));
            }
        };

        info!("Client connected: {}", peer_addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Client {}: failed to set TCP_NODELAY: {}", peer_addr, e);
        }

        let backend = backend.clone();
        let transport = transport.clone();
        let span = info_span!("session", peer = %peer_addr);

        tokio::spawn(
            async move {
                let summary = session::run(&backend, transport.as_ref(), stream, &config).await;
                debug!(?summary, "Session finished");
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2tunnel_transport::{H2Config, H2Transport};

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let transport = Arc::new(H2Transport::new(Arc::new(H2Config::client_default())).unwrap());
        let backend = BackendTarget::parse("https://127.0.0.1:443").unwrap();

        let err = TunnelListener::bind(addr, backend, transport, TunnelConfig::default())
            .await
            .unwrap_err();

        match err {
            TunnelError::BindError { address, port, .. } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(port, addr.port());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let transport = Arc::new(H2Transport::new(Arc::new(H2Config::client_default())).unwrap());
        let backend = BackendTarget::parse("https://127.0.0.1:443").unwrap();

        let listener = TunnelListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            backend,
            transport,
            TunnelConfig::default(),
        )
        .await
        .unwrap();

        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
