//! HTTP/2 transport configuration

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::debug::DebugSink;
use crate::keylog::KeyLogWriter;
use crate::{TransportError, TransportResult};

/// Environment variable naming the TLS key-log file
pub const KEY_LOG_ENV: &str = "SSLKEYLOGFILE";

/// HTTP/2-specific configuration
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Verify the backend certificate chain
    pub verify_server_cert: bool,

    /// Trust anchors (DER); webpki roots are used when empty
    pub root_certs: Vec<rustls::pki_types::CertificateDer<'static>>,

    /// ALPN protocols offered during the TLS handshake
    pub alpn_protocols: Vec<String>,

    /// NSS key-log file for TLS session secrets
    pub key_log_path: Option<PathBuf>,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Interval between PING health checks (None disables them)
    pub read_idle_timeout: Option<Duration>,

    /// How long to wait for a PONG before the connection is considered dead
    pub ping_timeout: Duration,

    /// Initial stream window size
    pub initial_window_size: u32,

    /// Initial connection window size
    pub initial_connection_window_size: u32,

    /// Maximum frame size
    pub max_frame_size: u32,

    /// Reports bytes read from and written to the backend connection
    pub debug: DebugSink,
}

impl H2Config {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec!["h2".to_string()],
            key_log_path: None,
            connect_timeout: Duration::from_secs(5),
            read_idle_timeout: Some(Duration::from_secs(60)),
            ping_timeout: Duration::from_secs(15),
            initial_window_size: 1024 * 1024, // 1MB
            initial_connection_window_size: 4 * 1024 * 1024,
            max_frame_size: 16 * 1024, // 16KB (HTTP/2 default)
            debug: DebugSink::disabled(),
        }
    }

    /// Create a client configuration for local development (skip cert verification)
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    /// Trust only the certificates in a PEM bundle instead of the webpki roots
    pub fn with_ca_cert(mut self, path: &Path) -> TransportResult<Self> {
        let certs = load_certs(path)?;
        if certs.is_empty() {
            return Err(TransportError::ConfigurationError(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        self.root_certs.extend(certs);
        Ok(self)
    }

    pub fn with_key_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_log_path = Some(path.into());
        self
    }

    /// Pick up the key-log path from `SSLKEYLOGFILE` if it is set
    pub fn with_key_log_from_env(self) -> Self {
        match std::env::var_os(KEY_LOG_ENV) {
            Some(path) if !path.is_empty() => self.with_key_log(path),
            _ => self,
        }
    }

    pub fn with_read_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: DebugSink) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        if !(16_384..=16_777_215).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size {} outside the HTTP/2 range 16384..=16777215",
                self.max_frame_size
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Connect timeout must be > 0".to_string(),
            ));
        }
        if matches!(self.read_idle_timeout, Some(t) if t.is_zero()) {
            return Err(TransportError::ConfigurationError(
                "Read idle timeout must be > 0 (omit it to disable health checks)".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector for client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.root_certs {
                roots.add(cert_der.clone()).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                })?;
            }
        }

        let mut client_crypto = if self.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        // Set ALPN for HTTP/2
        client_crypto.alpn_protocols = self
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        if let Some(path) = &self.key_log_path {
            match KeyLogWriter::create(path) {
                Ok(writer) => client_crypto.key_log = Arc::new(writer),
                Err(e) => warn!("Key log disabled, cannot open {}: {}", path.display(), e),
            }
        }

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

impl Default for H2Config {
    fn default() -> Self {
        Self::client_default()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::ConfigurationError(format!(
            "Failed to open CA file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification {
    schemes: Vec<rustls::SignatureScheme>,
}

impl SkipVerification {
    fn new() -> Arc<Self> {
        let schemes = rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes();
        Arc::new(Self { schemes })
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
