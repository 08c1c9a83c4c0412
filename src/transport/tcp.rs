//! TCP transport: the accept hub, the plain dialer, and the raw variant.
//!
//! The hub owns a bounded queue of accepted sockets. The accept loop
//! favors responsiveness over buffering: when the queue is full the new
//! arrival is closed immediately. `accept` polls the queue with a short
//! wake interval so a concurrent `close` is observed promptly.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::common::{Address, Destination, IntoStream, Port, Stream};
use crate::error::{Error, Result};

use super::connection::{Connection, Recycler};
use super::tls;
use super::{
    Dialer, ListenOptions, Listener, NetworkSettings, SecurityKind, StreamSettings, TcpSettings,
    TransportFactory, TransportKind,
};

/// Pending-connection queue capacity.
const ACCEPT_QUEUE_SIZE: usize = 32;

/// Wake interval of the accept poll loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// An accepted stream, either freshly handshaken or recycled from a
/// previous session on a reusable transport.
pub enum Accepted {
    Fresh {
        stream: Stream,
        local: SocketAddr,
        peer: SocketAddr,
    },
    Recycled {
        dest: String,
        stream: Stream,
    },
}

struct HubInner {
    accepting: bool,
    queue: VecDeque<io::Result<TcpStream>>,
    recycled: VecDeque<(String, Stream)>,
}

struct HubShared {
    inner: Mutex<HubInner>,
    notify: Notify,
}

/// TCP accept hub: binds a socket, runs the accept loop, and hands out
/// accepted (optionally TLS-wrapped) streams.
pub struct TcpHub {
    local_addr: SocketAddr,
    shared: Arc<HubShared>,
    tls: Option<tokio_rustls::TlsAcceptor>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpHub {
    /// Bind at `(address, port)` and start the accept loop. When the
    /// stream settings ask for TLS, accepted sockets are wrapped in a
    /// server-side handshake before being returned.
    pub async fn listen(address: Address, port: Port, options: &ListenOptions) -> Result<TcpHub> {
        let ip = address
            .as_ip()
            .ok_or_else(|| Error::Config(format!("cannot listen on domain address: {}", address)))?;
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        let tls = match options.stream.effective_security_settings() {
            Some(settings) => Some(tls::acceptor(&settings)?),
            None => None,
        };

        let shared = Arc::new(HubShared {
            inner: Mutex::new(HubInner {
                accepting: true,
                queue: VecDeque::with_capacity(ACCEPT_QUEUE_SIZE),
                recycled: VecDeque::new(),
            }),
            notify: Notify::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                let result = listener.accept().await.map(|(conn, _)| conn);
                let mut inner = loop_shared.inner.lock();
                if !inner.accepting {
                    break;
                }
                if inner.queue.len() >= ACCEPT_QUEUE_SIZE {
                    // Admission policy: drop the new arrival.
                    debug!("TCP hub: accept queue full, dropping connection");
                    continue;
                }
                inner.queue.push_back(result);
                drop(inner);
                loop_shared.notify.notify_waiters();
            }
        });

        Ok(TcpHub {
            local_addr,
            shared,
            tls,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the next accepted stream, preferring recycled connections.
    /// Returns [`Error::ListenerClosed`] once the hub is closed.
    pub async fn accept_stream(&self) -> Result<Accepted> {
        loop {
            let pending = {
                let mut inner = self.shared.inner.lock();
                if !inner.accepting {
                    return Err(Error::ListenerClosed);
                }
                if let Some((dest, stream)) = inner.recycled.pop_front() {
                    return Ok(Accepted::Recycled { dest, stream });
                }
                inner.queue.pop_front()
            };

            match pending {
                Some(Ok(conn)) => {
                    let _ = conn.set_nodelay(true);
                    let peer = conn.peer_addr()?;
                    let local = conn.local_addr()?;
                    let stream: Stream = match &self.tls {
                        Some(acceptor) => acceptor
                            .accept(conn)
                            .await
                            .map_err(|e| {
                                Error::Transport(format!("TLS accept failed: {}", e))
                            })?
                            .into_stream(),
                        None => conn.into_stream(),
                    };
                    return Ok(Accepted::Fresh {
                        stream,
                        local,
                        peer,
                    });
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    tokio::select! {
                        _ = self.shared.notify.notified() => {}
                        _ = tokio::time::sleep(ACCEPT_POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }

    /// Stop accepting. Queued sockets are closed best-effort; connections
    /// already handed out are unaffected.
    pub fn close(&self) {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let mut inner = self.shared.inner.lock();
        inner.accepting = false;
        inner.queue.clear();
        inner.recycled.clear();
        drop(inner);
        self.shared.notify.notify_waiters();
    }

    /// Handle to the recycle queue, for reusable transports built on this
    /// hub.
    pub fn recycler(&self) -> Arc<dyn Recycler> {
        Arc::new(HubRecycler {
            shared: Arc::clone(&self.shared),
        })
    }
}

struct HubRecycler {
    shared: Arc<HubShared>,
}

impl Recycler for HubRecycler {
    fn recycle(&self, dest: &str, stream: Stream) {
        let mut inner = self.shared.inner.lock();
        if !inner.accepting || inner.recycled.len() >= ACCEPT_QUEUE_SIZE {
            // No longer accepting (or queue full): let the stream drop.
            return;
        }
        inner.recycled.push_back((dest.to_string(), stream));
        drop(inner);
        self.shared.notify.notify_waiters();
    }
}

/// Listener for plain (optionally TLS) TCP streams.
pub struct TcpListener {
    hub: TcpHub,
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Connection> {
        match self.hub.accept_stream().await? {
            Accepted::Fresh {
                stream,
                local,
                peer,
            } => Ok(Connection::new(
                stream,
                Destination::from(local),
                Destination::from(peer),
            )),
            Accepted::Recycled { .. } => {
                // TCP does not recycle; nothing feeds this queue.
                Err(Error::Transport("unexpected recycled TCP stream".into()))
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

/// Dial a TCP socket to `dest`, optionally binding the source address.
pub(crate) async fn dial_tcp_stream(src: Option<&Address>, dest: &Destination) -> Result<TcpStream> {
    let target = match dest.as_socket_addr() {
        Some(addr) => addr,
        None => lookup_host(dest.net_addr())
            .await?
            .next()
            .ok_or_else(|| Error::Transport(format!("no address for {}", dest)))?,
    };

    let stream = match src.and_then(|a| a.as_ip()) {
        Some(ip) => {
            let socket = if target.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(target).await?
        }
        None => TcpStream::connect(target).await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dialer for plain TCP, with client-side TLS when configured.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        stream_settings: &StreamSettings,
    ) -> Result<Connection> {
        let conn = dial_tcp_stream(src.as_ref(), dest).await?;
        let local = conn.local_addr()?;

        let stream: Stream = match stream_settings.effective_security_settings() {
            Some(settings) => tls::wrap_client(conn, dest, &settings).await?,
            None => conn.into_stream(),
        };
        Ok(Connection::new(
            stream,
            Destination::from(local),
            dest.clone(),
        ))
    }
}

/// Dialer for raw TCP: thin pass-through, no security wrap.
pub struct RawTcpDialer;

#[async_trait]
impl Dialer for RawTcpDialer {
    async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        _stream_settings: &StreamSettings,
    ) -> Result<Connection> {
        let conn = dial_tcp_stream(src.as_ref(), dest).await?;
        let local = conn.local_addr()?;
        Ok(Connection::new(
            conn.into_stream(),
            Destination::from(local),
            dest.clone(),
        ))
    }
}

pub struct TcpTransportFactory;

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(TcpDialer)
    }

    async fn listen(
        &self,
        address: Address,
        port: Port,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>> {
        let hub = TcpHub::listen(address, port, &options).await?;
        Ok(Box::new(TcpListener { hub }))
    }

    fn default_settings(&self) -> NetworkSettings {
        NetworkSettings::Tcp(TcpSettings::default())
    }
}

pub struct RawTcpTransportFactory;

#[async_trait]
impl TransportFactory for RawTcpTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::RawTcp
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(RawTcpDialer)
    }

    async fn listen(
        &self,
        address: Address,
        port: Port,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>> {
        // Raw TCP carries no security wrap; the hub still provides the
        // accept queue.
        let mut options = options;
        options.stream.security = SecurityKind::None;
        let hub = TcpHub::listen(address, port, &options).await?;
        Ok(Box::new(TcpListener { hub }))
    }

    fn default_settings(&self) -> NetworkSettings {
        NetworkSettings::RawTcp
    }
}
