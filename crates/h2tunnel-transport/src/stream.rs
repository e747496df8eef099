//! Streaming request and response bodies over an HTTP/2 stream

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use h2::{Reason, RecvStream, SendStream};
use http::{HeaderMap, StatusCode};
use std::future::poll_fn;
use tracing::{debug, trace};

use crate::pipe::BodyReader;
use crate::{TransportError, TransportResult};

/// Response to a CONNECT round trip, available once headers have arrived
pub struct TunnelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl std::fmt::Debug for TunnelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Streaming response body
pub struct ResponseBody {
    inner: BoxStream<'static, TransportResult<Bytes>>,
}

impl ResponseBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = TransportResult<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// Wrap an HTTP/2 receive stream, returning flow-control capacity as
    /// chunks are handed out
    pub(crate) fn from_h2(recv: RecvStream, stream_id: u32) -> Self {
        Self::new(stream::unfold(Some(recv), move |state| async move {
            let mut recv = state?;
            match recv.data().await {
                Some(Ok(chunk)) => {
                    let _ = recv.flow_control().release_capacity(chunk.len());
                    trace!("Stream {}: received {} bytes", stream_id, chunk.len());
                    Some((Ok(chunk), Some(recv)))
                }
                Some(Err(e)) => {
                    debug!("Stream {}: receive error: {}", stream_id, e);
                    Some((Err(TransportError::from(e)), None))
                }
                None => None,
            }
        }))
    }

    /// Next chunk; `None` on clean end-of-stream
    pub async fn chunk(&mut self) -> Option<TransportResult<Bytes>> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

/// Pump the pipe into the request stream until the pipe ends, honoring
/// HTTP/2 flow control. End of pipe sends END_STREAM; a send failure resets
/// the stream.
pub(crate) async fn pump_request_body(
    mut body: BodyReader,
    mut send: SendStream<Bytes>,
    stream_id: u32,
) -> TransportResult<u64> {
    let mut total = 0u64;

    while let Some(chunk) = body.next_chunk().await {
        let len = chunk.len() as u64;
        if let Err(e) = send_chunk(&mut send, chunk).await {
            debug!("Stream {}: request body send failed: {}", stream_id, e);
            body.close();
            send.send_reset(Reason::CANCEL);
            return Err(e);
        }
        total += len;
    }

    send.send_data(Bytes::new(), true)?;
    trace!("Stream {}: request body finished after {} bytes", stream_id, total);
    Ok(total)
}

async fn send_chunk(send: &mut SendStream<Bytes>, mut chunk: Bytes) -> TransportResult<()> {
    while !chunk.is_empty() {
        send.reserve_capacity(chunk.len());

        let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::StreamClosed),
        };
        if granted == 0 {
            continue;
        }

        let part = chunk.split_to(granted.min(chunk.len()));
        send.send_data(part, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_body_yields_chunks_then_ends() {
        let mut body = ResponseBody::new(stream::iter(vec![
            Ok(Bytes::from_static(b"hello")),
            Ok(Bytes::from_static(b" world")),
        ]));

        assert_eq!(body.chunk().await.unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(body.chunk().await.unwrap().unwrap(), &b" world"[..]);
        assert!(body.chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_response_body_surfaces_errors() {
        let mut body = ResponseBody::new(stream::iter(vec![
            Ok(Bytes::from_static(b"12345")),
            Err(TransportError::StreamReset(Reason::PROTOCOL_ERROR)),
        ]));

        assert!(body.chunk().await.unwrap().is_ok());
        let err = body.chunk().await.unwrap().unwrap_err();
        assert!(err.is_protocol_fatal());
    }

    #[tokio::test]
    async fn test_empty_body() {
        let mut body = ResponseBody::empty();
        assert!(body.chunk().await.is_none());
    }
}
