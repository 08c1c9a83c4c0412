//! Connection - uniform byte-stream abstraction over every transport.
//!
//! A `Connection` wraps a transport stream with peer addresses, read and
//! write deadlines, and a reuse flag. Handlers only ever see this type;
//! whether the bytes ride raw TCP, TLS, WebSocket frames, or KCP datagrams
//! is decided by the transport that produced it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

use crate::common::{Destination, Stream};

/// Sink that accepts a still-usable stream back at close time.
/// Implemented by listeners and pools that support connection reuse.
pub trait Recycler: Send + Sync {
    fn recycle(&self, dest: &str, stream: Stream);
}

/// A live transport connection.
pub struct Connection {
    stream: Option<Stream>,
    local_addr: Destination,
    remote_addr: Destination,
    read_deadline: Option<Pin<Box<Sleep>>>,
    /// When set, the read deadline re-arms after every successful read.
    idle_read_timeout: Option<Duration>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    /// Reuse is only honored when the transport enabled it.
    reuse_enabled: bool,
    reusable: bool,
    recycler: Option<(String, Arc<dyn Recycler>)>,
}

impl Connection {
    pub fn new(stream: Stream, local_addr: Destination, remote_addr: Destination) -> Self {
        Self {
            stream: Some(stream),
            local_addr,
            remote_addr,
            read_deadline: None,
            idle_read_timeout: None,
            write_deadline: None,
            reuse_enabled: false,
            reusable: false,
            recycler: None,
        }
    }

    /// Builder: enable reuse and register the recycler that takes the
    /// stream back on close. `dest` keys the recycled connection.
    pub fn with_recycler(
        mut self,
        dest: impl Into<String>,
        recycler: Arc<dyn Recycler>,
    ) -> Self {
        self.reuse_enabled = true;
        self.reusable = true;
        self.recycler = Some((dest.into(), recycler));
        self
    }

    pub fn local_addr(&self) -> &Destination {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Destination {
        &self.remote_addr
    }

    /// Arm the read deadline. A read pending past this instant fails with
    /// `TimedOut`. `None` disarms and stops idle re-arming.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(sleep_until(d)));
        if deadline.is_none() {
            self.idle_read_timeout = None;
        }
    }

    /// Idle read timeout: the deadline re-arms `timeout` from now after
    /// every successful read, so only a silent peer trips it.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.idle_read_timeout = Some(timeout);
        self.read_deadline = Some(Box::pin(sleep_until(Instant::now() + timeout)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(sleep_until(d)));
    }

    pub fn reusable(&self) -> bool {
        self.reuse_enabled && self.reusable && self.stream.is_some()
    }

    /// Mark the connection non-reusable (or reusable again). Ignored when
    /// the transport did not enable reuse.
    pub fn set_reusable(&mut self, reusable: bool) {
        if self.reuse_enabled {
            self.reusable = reusable;
        }
    }

    /// Close the connection. Idempotent in observable effect: after the
    /// first close, reads return end-of-stream and writes fail.
    ///
    /// A reusable connection is handed back to its recycler instead of
    /// being shut down; the recycler decides whether to keep it.
    pub async fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if self.reuse_enabled && self.reusable {
            if let Some((dest, recycler)) = &self.recycler {
                recycler.recycle(dest, stream);
                return;
            }
        }
        let _ = stream.shutdown().await;
    }

    fn poll_deadline(
        deadline: &mut Option<Pin<Box<Sleep>>>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(sleep) = deadline {
            if sleep.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "deadline exceeded",
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let Some(stream) = this.stream.as_mut() else {
            // closed: end-of-stream
            return Poll::Ready(Ok(()));
        };
        match Pin::new(stream).poll_read(cx, buf) {
            Poll::Pending => match Self::poll_deadline(&mut this.read_deadline, cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                _ => Poll::Pending,
            },
            Poll::Ready(Ok(())) => {
                if let Some(idle) = this.idle_read_timeout {
                    this.read_deadline = Some(Box::pin(sleep_until(Instant::now() + idle)));
                }
                Poll::Ready(Ok(()))
            }
            ready => ready,
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )));
        };
        match Pin::new(stream).poll_write(cx, buf) {
            Poll::Pending => match Self::poll_deadline(&mut this.write_deadline, cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                _ => Poll::Pending,
            },
            ready => ready,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(stream) => {
                let result = Pin::new(stream).poll_shutdown(cx);
                if result.is_ready() {
                    self.stream = None;
                }
                result
            }
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Destination, IntoStream};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_dest(port: u16) -> Destination {
        Destination::tcp(Address::localhost(), port)
    }

    fn test_conn() -> (Connection, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        (
            Connection::new(near.into_stream(), test_dest(1), test_dest(2)),
            far,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_fires() {
        let (mut conn, _far) = test_conn();
        conn.set_read_timeout(Duration::from_millis(100));

        let mut buf = [0u8; 16];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_read_before_deadline_succeeds() {
        let (mut conn, mut far) = test_conn();
        conn.set_read_timeout(Duration::from_secs(5));
        far.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, _far) = test_conn();
        conn.close().await;
        conn.close().await;

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.write_all(b"x").await.is_err());
    }

    struct CollectingRecycler {
        recycled: Mutex<Vec<String>>,
    }

    impl Recycler for CollectingRecycler {
        fn recycle(&self, dest: &str, _stream: Stream) {
            self.recycled.lock().push(dest.to_string());
        }
    }

    #[tokio::test]
    async fn test_reusable_connection_is_recycled() {
        let recycler = Arc::new(CollectingRecycler {
            recycled: Mutex::new(Vec::new()),
        });
        let (near, _far) = tokio::io::duplex(64);
        let mut conn = Connection::new(near.into_stream(), test_dest(1), test_dest(2))
            .with_recycler("example.com:80", recycler.clone());

        assert!(conn.reusable());
        conn.close().await;
        assert_eq!(recycler.recycled.lock().as_slice(), ["example.com:80"]);
    }

    #[tokio::test]
    async fn test_unreusable_marked_connection_is_dropped() {
        let recycler = Arc::new(CollectingRecycler {
            recycled: Mutex::new(Vec::new()),
        });
        let (near, _far) = tokio::io::duplex(64);
        let mut conn = Connection::new(near.into_stream(), test_dest(1), test_dest(2))
            .with_recycler("example.com:80", recycler.clone());

        conn.set_reusable(false);
        conn.close().await;
        assert!(recycler.recycled.lock().is_empty());
    }
}
