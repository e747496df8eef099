//! Read/write decorator reporting every I/O call to a [`DebugSink`]

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::debug::DebugSink;

/// Wraps any async byte stream and reports the size of every successful
/// read and write. Errors and EOF pass through untouched.
#[derive(Debug)]
pub struct Instrumented<S> {
    inner: S,
    sink: DebugSink,
    peer: String,
}

impl<S> Instrumented<S> {
    pub fn new(inner: S, sink: DebugSink, peer: impl fmt::Display) -> Self {
        Self {
            inner,
            sink,
            peer: peer.to_string(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Instrumented<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.sink.read(n, &this.peer);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Instrumented<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            this.sink.wrote(n, &this.peer);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = result {
            this.sink.wrote(n, &this.peer);
        }
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_passes_bytes_through() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = Instrumented::new(a, DebugSink::enabled(), "proxy");
        let mut b = Instrumented::new(b, DebugSink::disabled(), "client");

        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(a);
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
