//! TCP over HTTP/2 CONNECT
//!
//! Every accepted TCP connection becomes one CONNECT stream on the backend.
//! Bytes are bridged in both directions, optionally prefixed upstream with a
//! PROXY protocol v1 line naming the original client port. How the client
//! socket is closed mirrors how the upstream stream ended: FIN for ordinary
//! termination, RST when the stream was reset or the connection went away.

pub mod classify;
pub mod client;
pub mod error;
pub mod listener;
pub mod proxy_header;
pub mod session;

pub use classify::{classify, ErrorVerdict};
pub use client::{ClientCloser, ClientConnection};
pub use error::TunnelError;
pub use listener::{serve, TunnelListener};
pub use proxy_header::ProxyHeaderLine;
pub use session::{connect_request, run, SessionEnd, SessionSummary, TunnelConfig};

pub use h2tunnel_transport::{DebugSink, Instrumented};
