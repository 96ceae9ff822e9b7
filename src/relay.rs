//! Stream relay: backend chunks in, SSE frames out.
//!
//! The relay owns the inbound stream. Whatever way it returns, the inbound
//! stream is dropped, which releases the backend connection. That is how a
//! client disconnect (a failed write) propagates back to the backend.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::codec::{encode_delta, NdjsonDecoder, DONE_FRAME};
use crate::error::BridgeError;

/// Destination for outbound SSE frames. Awaiting `send_frame` is the
/// backpressure point.
pub trait FrameSink {
    fn send_frame<'a>(&'a mut self, frame: &'a [u8])
        -> impl Future<Output = io::Result<()>> + Send + 'a;

    /// Clean end of the outbound stream. Not called on error paths.
    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_;
}

/// Writes each frame as one HTTP/1.1 chunk. A body that ends without the
/// terminating zero-length chunk is seen by the client as a broken stream.
pub struct ChunkedSink<W> {
    inner: W,
}

impl<W> ChunkedSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for ChunkedSink<W> {
    fn send_frame<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            // An empty chunk would terminate the body.
            if frame.is_empty() {
                return Ok(());
            }
            let mut buf = Vec::with_capacity(frame.len() + 12);
            buf.extend_from_slice(format!("{:x}\r\n", frame.len()).as_bytes());
            buf.extend_from_slice(frame);
            buf.extend_from_slice(b"\r\n");
            self.inner.write_all(&buf).await?;
            self.inner.flush().await
        }
    }

    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        async move {
            self.inner.write_all(b"0\r\n\r\n").await?;
            self.inner.flush().await
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub frames: usize,
    pub bytes_in: usize,
    pub dropped_lines: usize,
}

/// Pump `inbound` through the codec into `sink`.
///
/// - clean end: every content frame, then exactly one `[DONE]`, then `finish`
/// - inbound error or idle timeout: returns the error, no `[DONE]`, no `finish`
/// - write failure, or a write stalled longer than `idle`: returns
///   [`BridgeError::ClientGone`]
pub async fn relay<S, K>(
    mut inbound: S,
    sink: &mut K,
    idle: Duration,
) -> Result<RelayStats, BridgeError>
where
    S: Stream<Item = Result<Vec<u8>, BridgeError>> + Unpin,
    K: FrameSink,
{
    let mut decoder = NdjsonDecoder::new();
    let mut stats = RelayStats::default();

    loop {
        let next = tokio::time::timeout(idle, inbound.next())
            .await
            .map_err(|_| BridgeError::IdleTimeout(idle))?;
        match next {
            Some(Ok(chunk)) => {
                stats.bytes_in += chunk.len();
                for content in decoder.push(&chunk) {
                    forward(sink, &content, &mut stats, idle).await?;
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    if let Some(content) = decoder.finish() {
        forward(sink, &content, &mut stats, idle).await?;
    }
    stats.dropped_lines = decoder.dropped();

    bounded_write(sink.send_frame(DONE_FRAME.as_bytes()), idle).await?;
    bounded_write(sink.finish(), idle).await?;
    debug!(frames = stats.frames, bytes_in = stats.bytes_in, "relay finished");
    Ok(stats)
}

async fn forward<K: FrameSink>(
    sink: &mut K,
    content: &str,
    stats: &mut RelayStats,
    idle: Duration,
) -> Result<(), BridgeError> {
    let frame = encode_delta(content);
    bounded_write(sink.send_frame(frame.as_bytes()), idle).await?;
    stats.frames += 1;
    Ok(())
}

/// A client that stops reading counts as gone once a write stalls for `idle`.
async fn bounded_write<F>(write: F, idle: Duration) -> Result<(), BridgeError>
where
    F: Future<Output = io::Result<()>>,
{
    match tokio::time::timeout(idle, write).await {
        Ok(result) => result.map_err(BridgeError::ClientGone),
        Err(_) => Err(BridgeError::ClientGone(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("client stopped reading for {idle:?}"),
        ))),
    }
}
