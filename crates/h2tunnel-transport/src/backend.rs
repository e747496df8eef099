//! Backend URL parsing

use http::Uri;
use std::fmt;

use crate::{TransportError, TransportResult};

/// How the HTTP/2 connection to the backend is established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendScheme {
    /// TLS with ALPN `h2`
    Https,
    /// Cleartext HTTP/2 with prior knowledge
    Http,
}

impl BackendScheme {
    fn default_port(self) -> u16 {
        match self {
            BackendScheme::Https => 443,
            BackendScheme::Http => 80,
        }
    }
}

/// The HTTP/2 intermediary that terminates CONNECT requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    uri: Uri,
    scheme: BackendScheme,
    host: String,
    port: u16,
}

impl BackendTarget {
    pub fn parse(url: &str) -> TransportResult<Self> {
        let uri: Uri = url.parse().map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid backend URL '{}': {}", url, e))
        })?;

        let scheme = match uri.scheme_str() {
            Some("https") => BackendScheme::Https,
            Some("http") => BackendScheme::Http,
            Some(other) => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported backend URL scheme '{}' (expected https or http)",
                    other
                )))
            }
            None => {
                return Err(TransportError::ConfigurationError(format!(
                    "Backend URL '{}' has no scheme",
                    url
                )))
            }
        };

        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                TransportError::ConfigurationError(format!("Backend URL '{}' has no host", url))
            })?
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            uri,
            scheme,
            host,
            port,
        })
    }

    pub fn scheme(&self) -> BackendScheme {
        self.scheme
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == BackendScheme::Https
    }

    /// Host without IPv6 brackets, usable for DNS lookup and TLS SNI
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}
