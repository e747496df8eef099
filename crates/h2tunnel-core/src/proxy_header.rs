//! PROXY protocol v1 line describing the original client
//!
//! Format: `PROXY TCP4 <egress ip> <target ip> <client port> <target port>\r\n`.
//! The source address is this host's egress address towards the backend,
//! not the client's own address, since the tunnel target sees every client
//! as coming from the tunnel host.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

/// A complete PROXY v1 line, or nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyHeaderLine(String);

impl ProxyHeaderLine {
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn new(egress_ip: Ipv4Addr, client_port: u16, target: SocketAddrV4) -> Self {
        Self(format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            egress_ip,
            target.ip(),
            client_port,
            target.port()
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ProxyHeaderLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end())
    }
}

/// Build the line for one client. Any failure yields the empty line.
pub async fn build(
    backend_host: &str,
    backend_port: u16,
    target: SocketAddrV4,
    client_addr: SocketAddr,
) -> ProxyHeaderLine {
    let client_port = client_addr.port();
    if client_port == 0 {
        return ProxyHeaderLine::empty();
    }

    match egress_ipv4(backend_host, backend_port).await {
        Some(ip) => ProxyHeaderLine::new(ip, client_port, target),
        None => ProxyHeaderLine::empty(),
    }
}

/// Local address the kernel would route packets to the backend from.
/// Connecting a UDP socket only selects a route; nothing is sent.
async fn egress_ipv4(host: &str, port: u16) -> Option<Ipv4Addr> {
    let remote = match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next()?,
        Err(e) => {
            debug!("Cannot resolve {} for PROXY header: {}", host, e);
            return None;
        }
    };

    let bind_addr: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = UdpSocket::bind(bind_addr).await.ok()?;
    if let Err(e) = socket.connect(remote).await {
        debug!("No route to {} for PROXY header: {}", remote, e);
        return None;
    }

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        // TCP4-only line: IPv4-mapped addresses are usable, native IPv6 is not
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3306)
    }

    #[test]
    fn test_line_format() {
        let line = ProxyHeaderLine::new(Ipv4Addr::new(10, 0, 0, 7), 51234, target());
        assert_eq!(line.as_bytes(), b"PROXY TCP4 10.0.0.7 127.0.0.1 51234 3306\r\n");
        assert_eq!(line.to_string(), "PROXY TCP4 10.0.0.7 127.0.0.1 51234 3306");
    }

    #[test]
    fn test_custom_target() {
        let line = ProxyHeaderLine::new(
            Ipv4Addr::new(192, 168, 1, 2),
            40000,
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5432),
        );
        assert_eq!(line.as_bytes(), b"PROXY TCP4 192.168.1.2 10.1.1.1 40000 5432\r\n");
    }

    #[tokio::test]
    async fn test_build_loopback() {
        let client: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        let line = build("127.0.0.1", 443, target(), client).await;
        assert_eq!(line.as_bytes(), b"PROXY TCP4 127.0.0.1 127.0.0.1 40123 3306\r\n");
    }

    #[tokio::test]
    async fn test_zero_client_port_yields_empty() {
        let client: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let line = build("127.0.0.1", 443, target(), client).await;
        assert!(line.is_empty());
        assert!(line.as_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_backend_yields_empty() {
        let client: SocketAddr = "127.0.0.1:40123".parse().unwrap();
        let line = build("backend.invalid", 443, target(), client).await;
        assert!(line.is_empty());
    }
}
