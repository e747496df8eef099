//! Accepted client connection with an out-of-band teardown handle

use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::classify::ErrorVerdict;

/// A client socket split into the stream the copy tasks own and a duplicated
/// handle kept by the session for closing it.
#[derive(Debug)]
pub struct ClientConnection {
    stream: TcpStream,
    closer: ClientCloser,
}

impl ClientConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        Ok(Self {
            stream,
            closer: ClientCloser { control, peer },
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.closer.peer
    }

    pub fn into_parts(self) -> (TcpStream, ClientCloser) {
        (self.stream, self.closer)
    }

    /// Close without ever handing the stream to copy tasks
    pub fn close(self, verdict: ErrorVerdict) {
        let (stream, closer) = self.into_parts();
        closer.close(verdict);
        drop(stream);
    }
}

/// Closes the client socket regardless of which task holds the stream.
///
/// The descriptor is released once this handle and every copy of the stream
/// are dropped.
#[derive(Debug)]
pub struct ClientCloser {
    control: std::net::TcpStream,
    peer: SocketAddr,
}

impl ClientCloser {
    /// `ForceReset` arms a zero linger so the final close sends RST, and
    /// shuts down the read side so a pending read returns. Anything else
    /// shuts both directions down, sending FIN and unblocking pending reads.
    pub fn close(self, verdict: ErrorVerdict) {
        if verdict.is_force_reset() {
            if let Err(e) = SockRef::from(&self.control).set_linger(Some(Duration::ZERO)) {
                debug!("Client {}: failed to set zero linger: {}", self.peer, e);
            }
            if let Err(e) = self.control.shutdown(Shutdown::Read) {
                debug!("Client {}: read shutdown: {}", self.peer, e);
            }
        } else if let Err(e) = self.control.shutdown(Shutdown::Both) {
            // NotConnected once the peer is already gone
            debug!("Client {}: shutdown: {}", self.peer, e);
        }
    }
}
