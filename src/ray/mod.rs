//! Ray - the bidirectional in-memory byte channel between an inbound-side
//! task and an outbound-side task.
//!
//! A Ray is a pair of one-directional pipes:
//!
//! ```text
//! InboundRay.input  ──upstream──▶  OutboundRay.output
//! InboundRay.output ◀─downstream── OutboundRay.input
//! ```
//!
//! Each pipe is a lazy byte sequence with two endpoints. Closing the write
//! end signals end-of-stream on the read end after buffered bytes drain;
//! releasing (dropping) the read end makes further writes fail. Bytes are
//! delivered in order with no duplication. Writes park when the buffer is
//! full; there is no synchronous rendezvous between the two sides.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Per-pipe buffer limit before writers park.
const PIPE_BUFFER_SIZE: usize = 32 * 1024;

struct PipeInner {
    buffer: BytesMut,
    /// Write end has shut down; readers see EOF once the buffer drains.
    closed: bool,
    /// Read end is gone; writers fail immediately.
    released: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

struct PipeShared {
    inner: Mutex<PipeInner>,
    capacity: usize,
}

impl PipeShared {
    fn wake_reader(inner: &mut PipeInner) {
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(inner: &mut PipeInner) {
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
    }
}

/// Create a one-directional byte pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    pipe_with_capacity(PIPE_BUFFER_SIZE)
}

fn pipe_with_capacity(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(PipeShared {
        inner: Mutex::new(PipeInner {
            buffer: BytesMut::new(),
            closed: false,
            released: false,
            read_waker: None,
            write_waker: None,
        }),
        capacity,
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

/// Write endpoint of a pipe. Single producer.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

/// Read endpoint of a pipe. Single consumer.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Close the write end. Idempotent; the reader observes EOF once
    /// buffered bytes drain.
    pub fn close(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.closed = true;
        PipeShared::wake_reader(&mut inner);
    }
}

impl PipeReader {
    /// Release the read end. Idempotent; further writes fail.
    pub fn release(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.released = true;
        inner.buffer.clear();
        PipeShared::wake_writer(&mut inner);
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.shared.inner.lock();
        if inner.released {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader released",
            )));
        }
        if inner.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe writer closed",
            )));
        }
        let room = self.shared.capacity.saturating_sub(inner.buffer.len());
        if room == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = room.min(buf.len());
        inner.buffer.extend_from_slice(&buf[..n]);
        PipeShared::wake_reader(&mut inner);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.shared.inner.lock();
        inner.closed = true;
        PipeShared::wake_reader(&mut inner);
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.shared.inner.lock();
        if !inner.buffer.is_empty() {
            let n = inner.buffer.len().min(buf.remaining());
            buf.put_slice(&inner.buffer[..n]);
            inner.buffer.advance(n);
            PipeShared::wake_writer(&mut inner);
            return Poll::Ready(Ok(()));
        }
        if inner.closed || inner.released {
            // EOF after drain
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// Endpoints of a Ray as seen from the inbound handler.
pub struct InboundRay {
    /// Client-to-remote bytes go in here
    pub input: PipeWriter,
    /// Remote-to-client bytes come out here
    pub output: PipeReader,
}

/// Endpoints of a Ray as seen from the outbound handler. The same two
/// pipes as [`InboundRay`], from the other angle.
pub struct OutboundRay {
    /// Remote-to-client bytes go in here
    pub input: PipeWriter,
    /// Client-to-remote bytes come out here
    pub output: PipeReader,
}

/// Create a fresh Ray and hand one side to each party.
pub fn new_ray() -> (InboundRay, OutboundRay) {
    let (up_writer, up_reader) = pipe();
    let (down_writer, down_reader) = pipe();
    (
        InboundRay {
            input: up_writer,
            output: down_reader,
        },
        OutboundRay {
            input: down_writer,
            output: up_reader,
        },
    )
}

impl InboundRay {
    /// A Ray whose far side is already gone: reads return EOF, writes
    /// fail. Used when dispatch cannot find a handler.
    pub fn closed() -> Self {
        let (inbound, outbound) = new_ray();
        drop(outbound);
        inbound
    }

    pub fn split(self) -> (PipeWriter, PipeReader) {
        (self.input, self.output)
    }
}

impl OutboundRay {
    pub fn split(self) -> (PipeWriter, PipeReader) {
        (self.input, self.output)
    }
}

/// Copy bytes from `reader` to `writer` until EOF or error, then shut the
/// writer down. Returns the number of bytes moved. The copy pump used on
/// both halves of every session.
pub async fn pump<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_in_order_delivery() {
        let (mut writer, mut reader) = pipe();

        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_pipe_eof_after_close_drains_buffer() {
        let (mut writer, mut reader) = pipe();
        writer.write_all(b"tail").await.unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
    }

    #[tokio::test]
    async fn test_pipe_write_fails_after_release() {
        let (mut writer, reader) = pipe();
        drop(reader);
        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_pipe_backpressure() {
        let (mut writer, mut reader) = pipe_with_capacity(8);

        // Fill the buffer, then keep writing from a task; it must park
        // until the reader drains.
        writer.write_all(b"01234567").await.unwrap();
        let handle = tokio::spawn(async move {
            writer.write_all(b"89abcdef").await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        handle.await.unwrap();
        assert_eq!(out, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_pipe_double_close_is_idempotent() {
        let (mut writer, mut reader) = pipe();
        writer.close();
        writer.close();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_ray_crosswise_wiring() {
        let (inbound, outbound) = new_ray();
        let (mut in_input, mut in_output) = inbound.split();
        let (mut out_input, mut out_output) = outbound.split();

        in_input.write_all(b"up").await.unwrap();
        in_input.shutdown().await.unwrap();
        out_input.write_all(b"down").await.unwrap();
        out_input.shutdown().await.unwrap();

        let mut up = Vec::new();
        out_output.read_to_end(&mut up).await.unwrap();
        let mut down = Vec::new();
        in_output.read_to_end(&mut down).await.unwrap();

        assert_eq!(up, b"up");
        assert_eq!(down, b"down");
    }

    #[tokio::test]
    async fn test_closed_ray() {
        let ray = InboundRay::closed();
        let (mut input, mut output) = ray.split();

        let mut out = Vec::new();
        output.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert!(input.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_large_transfer_is_identity() {
        let (writer, mut reader) = pipe();
        let payload: Vec<u8> = (0..1024 * 256).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let send = tokio::spawn(async move {
            let mut writer = writer;
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        send.await.unwrap();
        assert_eq!(received, expected);
    }
}
