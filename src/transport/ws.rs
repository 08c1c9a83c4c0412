//! WebSocket transport: tunnels byte streams through binary frames.
//!
//! The client dials `ws://host:port/<path>` (or `wss://` under TLS); the
//! server accepts on a matching path. When `connection_reuse` is on,
//! finished connections go back to a per-destination pool (dialer side)
//! or the listener's recycle queue (server side) instead of closing.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Sink, Stream as FuturesStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    accept_hdr_async, client_async,
    tungstenite::handshake::client::{generate_key, Request},
    tungstenite::handshake::server::{Request as ServerRequest, Response},
    tungstenite::http,
    tungstenite::protocol::Message,
    WebSocketStream,
};
use tracing::{debug, trace};

use crate::common::{Address, Destination, IntoStream, Port, Stream};
use crate::error::{Error, Result};

use super::connection::Connection;
use super::pool::ConnectionPool;
use super::tcp::{self, Accepted, TcpHub};
use super::tls;
use super::{
    Dialer, ListenOptions, Listener, NetworkSettings, StreamSettings, TransportFactory,
    TransportKind, WsSettings,
};

/// Dialer with an optional per-destination reuse pool.
pub struct WsDialer {
    pool: Arc<ConnectionPool>,
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        stream_settings: &StreamSettings,
    ) -> Result<Connection> {
        let NetworkSettings::WebSocket(settings) = stream_settings.effective_network_settings()
        else {
            return Err(Error::UnsupportedStreamType);
        };
        let dest_key = dest.net_addr();

        if settings.connection_reuse {
            if let Some(stream) = self.pool.get(&dest_key) {
                let conn = Connection::new(
                    stream,
                    Destination::tcp(Address::any(), 0),
                    dest.clone(),
                )
                .with_recycler(&dest_key, Arc::clone(&self.pool) as Arc<dyn super::Recycler>);
                return Ok(conn);
            }
        }

        let tcp_stream = tcp::dial_tcp_stream(src.as_ref(), dest).await?;
        let local = tcp_stream.local_addr()?;

        let security = stream_settings.effective_security_settings();
        let (scheme, inner): (&str, Stream) = match &security {
            Some(tls_settings) => (
                "wss",
                tls::wrap_client(tcp_stream, dest, tls_settings).await?,
            ),
            None => ("ws", tcp_stream.into_stream()),
        };

        let host = match &security {
            Some(tls_settings) => tls_settings
                .server_name
                .clone()
                .unwrap_or_else(|| dest.address.to_string()),
            None => dest.address.to_string(),
        };
        let uri = format!("{}://{}:{}{}", scheme, host, dest.port, settings.path);
        let request = Request::builder()
            .uri(&uri)
            .header("Host", format!("{}:{}", host, dest.port))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|e| Error::Protocol(format!("invalid WebSocket request: {}", e)))?;

        let (ws_stream, _response) = client_async(request, inner)
            .await
            .map_err(|e| Error::Transport(format!("WebSocket handshake failed: {}", e)))?;
        debug!("WebSocket connected to {}", uri);

        let stream = WsStream::new(ws_stream).into_stream();
        let mut conn = Connection::new(stream, Destination::from(local), dest.clone());
        if settings.connection_reuse {
            conn = conn.with_recycler(&dest_key, Arc::clone(&self.pool) as Arc<dyn super::Recycler>);
        }
        Ok(conn)
    }
}

/// Listener: TCP hub accept, then a path-checked WebSocket handshake.
pub struct WsListener {
    hub: TcpHub,
    settings: WsSettings,
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&self) -> Result<Connection> {
        loop {
            match self.hub.accept_stream().await? {
                Accepted::Fresh {
                    stream,
                    local,
                    peer,
                } => {
                    let path = self.settings.path.clone();
                    let check_path = move |req: &ServerRequest, resp: Response| {
                        if req.uri().path() == path {
                            Ok(resp)
                        } else {
                            let not_found = http::Response::builder()
                                .status(http::StatusCode::NOT_FOUND)
                                .body(Some("not found".to_string()))
                                .expect("static response");
                            Err(not_found)
                        }
                    };
                    let ws_stream = match accept_hdr_async(stream, check_path).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            // Bad handshake drops this client only.
                            debug!("WebSocket handshake from {} failed: {}", peer, e);
                            continue;
                        }
                    };
                    let dest_key = peer.to_string();
                    let mut conn = Connection::new(
                        WsStream::new(ws_stream).into_stream(),
                        Destination::from(local),
                        Destination::from(peer),
                    );
                    if self.settings.connection_reuse {
                        conn = conn.with_recycler(&dest_key, self.hub.recycler());
                    }
                    return Ok(conn);
                }
                Accepted::Recycled { dest, stream } => {
                    trace!("WebSocket listener handing out recycled connection");
                    let remote =
                        Destination::parse_tcp(&dest).unwrap_or_else(|| Destination::tcp(Address::any(), 0));
                    let mut conn =
                        Connection::new(stream, self.local_addr(), remote);
                    if self.settings.connection_reuse {
                        conn = conn.with_recycler(&dest, self.hub.recycler());
                    }
                    return Ok(conn);
                }
            }
        }
    }

    fn local_addr(&self) -> Destination {
        Destination::from(self.hub.local_addr())
    }

    async fn close(&self) -> Result<()> {
        self.hub.close();
        Ok(())
    }
}

pub struct WsTransportFactory {
    pool: Arc<ConnectionPool>,
}

impl WsTransportFactory {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new()),
        }
    }
}

impl Default for WsTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(WsDialer {
            pool: Arc::clone(&self.pool),
        })
    }

    async fn listen(
        &self,
        address: Address,
        port: Port,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>> {
        let NetworkSettings::WebSocket(settings) = options.stream.effective_network_settings()
        else {
            return Err(Error::UnsupportedStreamType);
        };
        let hub = TcpHub::listen(address, port, &options).await?;
        Ok(Box::new(WsListener { hub, settings }))
    }

    fn default_settings(&self) -> NetworkSettings {
        NetworkSettings::WebSocket(WsSettings::default())
    }
}

/// Byte-stream adapter over a WebSocket: reads drain binary frames,
/// writes emit one binary frame each.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    closed: bool,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            closed: false,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_pos < self.read_buf.len() {
            let remaining = self.read_buf.len() - self.read_pos;
            let to_copy = remaining.min(buf.remaining());
            let start = self.read_pos;
            buf.put_slice(&self.read_buf[start..start + to_copy]);
            self.read_pos += to_copy;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            self.closed = true;
                            return Poll::Ready(Ok(()));
                        }
                        Message::Frame(_) => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "unexpected raw frame",
                            )));
                        }
                    };
                    if data.is_empty() {
                        continue;
                    }
                    let to_copy = data.len().min(buf.remaining());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        self.read_buf = data;
                        self.read_pos = to_copy;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )));
                }
                Poll::Ready(None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "WebSocket connection closed",
            )));
        }

        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.closed = true;
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )));
            }
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.closed = true;
                Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // No half-close in WebSocket; flush and let drop close the socket.
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SecurityKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ws_stream_settings(reuse: bool) -> StreamSettings {
        StreamSettings {
            network: TransportKind::WebSocket,
            security: SecurityKind::None,
            ws_settings: Some(WsSettings {
                path: "/tunnel".to_string(),
                connection_reuse: reuse,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ws_dial_and_accept_round_trip() {
        let factory = WsTransportFactory::new();
        let listener = factory
            .listen(
                Address::localhost(),
                0,
                ListenOptions {
                    stream: ws_stream_settings(false),
                },
            )
            .await
            .unwrap();
        let port = listener.local_addr().port;

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
            conn.flush().await.unwrap();
            // hold the connection open until the client has read the echo
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let dest = Destination::tcp(Address::localhost(), port);
        let mut conn = factory
            .dialer()
            .dial(None, &dest, &ws_stream_settings(false))
            .await
            .unwrap();

        conn.write_all(b"through the frames").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through the frames");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_dialer_reuses_pooled_connection() {
        let factory = WsTransportFactory::new();
        let listener = factory
            .listen(
                Address::localhost(),
                0,
                ListenOptions {
                    stream: ws_stream_settings(true),
                },
            )
            .await
            .unwrap();
        let port = listener.local_addr().port;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        // keep server ends alive for the test duration
                        tokio::spawn(async move {
                            let mut conn = conn;
                            let mut buf = [0u8; 16];
                            let _ = conn.read(&mut buf).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        let dest = Destination::tcp(Address::localhost(), port);
        let settings = ws_stream_settings(true);
        let dest_key = dest.net_addr();

        let mut conn = factory.dialer().dial(None, &dest, &settings).await.unwrap();
        assert!(conn.reusable());
        conn.close().await;
        assert_eq!(factory.pool.idle_count(&dest_key), 1);

        // Second dial must come from the pool, not a new handshake.
        let _conn = factory.dialer().dial(None, &dest, &settings).await.unwrap();
        assert_eq!(factory.pool.idle_count(&dest_key), 0);
    }
}
