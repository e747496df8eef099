//! Unidirectional byte pipe feeding a streaming request body
//!
//! The write end is fed by whoever produces request bytes; the read end is
//! handed to [`crate::TunnelTransport::round_trip`]. Closing the pipe (from
//! either the writer or any [`PipeCloser`]) ends the body: buffered chunks are
//! still delivered, then the reader sees end-of-stream and pending or later
//! writes fail with `BrokenPipe`.

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Default number of in-flight chunks between writer and reader
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    notify: Notify,
}

impl Shared {
    /// Returns true if this call closed the pipe
    fn close(&self) -> bool {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        !was_closed
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Create a body pipe buffering at most `capacity` chunks
pub fn body_pipe(capacity: usize) -> (BodyWriter, BodyReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        BodyWriter {
            tx,
            shared: shared.clone(),
        },
        BodyReader { rx, shared },
    )
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "body pipe closed")
}

/// Write end of a body pipe
#[derive(Debug)]
pub struct BodyWriter {
    tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
}

impl BodyWriter {
    /// Queue a chunk for the request body, waiting for room in the pipe
    pub async fn write(&self, data: Bytes) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.shared.closed() => Err(closed_pipe()),
            sent = self.tx.send(data) => sent.map_err(|_| closed_pipe()),
        }
    }

    /// Close the write end. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.tx.is_closed()
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: self.shared.clone(),
        }
    }
}

/// Read end of a body pipe
#[derive(Debug)]
pub struct BodyReader {
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl BodyReader {
    /// Next body chunk, or `None` once the pipe is closed and drained
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.shared.is_closed() {
            return self.rx.try_recv().ok();
        }

        tokio::select! {
            biased;
            chunk = self.rx.recv() => chunk,
            _ = self.shared.closed() => self.rx.try_recv().ok(),
        }
    }

    /// Close from the consuming side; pending writes fail
    pub fn close(&mut self) {
        self.shared.close();
        self.rx.close();
    }
}

/// Cloneable handle that can close a pipe it does not own
#[derive(Debug, Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

impl PipeCloser {
    /// Close the pipe. Returns true if this call did the closing.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}
