//! KCP dialer and listener over UDP sockets.
//!
//! The dialer owns a connected socket per connection and assigns a random
//! conversation id. The listener demultiplexes datagrams arriving on one
//! socket by `(peer, conv)` into per-session connections.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::common::{Address, Destination, Port};
use crate::error::{Error, Result};

use super::connection::{DatagramOutput, KcpConnection, State};
use super::segment::Segment;
use super::{default_authenticator_chain, KcpSettings};
use crate::transport::connection::Connection;
use crate::transport::{
    Dialer, ListenOptions, Listener, NetworkSettings, StreamSettings, TransportFactory,
    TransportKind,
};

/// Queue capacity for sessions awaiting accept.
const ACCEPT_QUEUE_SIZE: usize = 32;

/// Wake interval of the accept poll loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn kcp_settings(stream: &StreamSettings) -> KcpSettings {
    match stream.effective_network_settings() {
        NetworkSettings::Kcp(settings) => settings,
        _ => KcpSettings::default(),
    }
}

/// Output over a connected UDP socket. Best effort: a full send buffer
/// drops the datagram and retransmission recovers.
struct ConnectedOutput {
    socket: Arc<UdpSocket>,
}

impl DatagramOutput for ConnectedOutput {
    fn send(&self, datagram: Bytes) {
        let _ = self.socket.try_send(&datagram);
    }
}

/// Output over a shared, unconnected socket toward one peer.
struct PeerOutput {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramOutput for PeerOutput {
    fn send(&self, datagram: Bytes) {
        let _ = self.socket.try_send_to(&datagram, self.peer);
    }
}

pub struct KcpDialer;

#[async_trait]
impl Dialer for KcpDialer {
    async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        stream: &StreamSettings,
    ) -> Result<Connection> {
        let settings = kcp_settings(stream);
        let bind_addr = match src.and_then(|a| a.as_ip()) {
            Some(ip) => SocketAddr::new(ip, 0),
            None => "0.0.0.0:0".parse().expect("valid any-addr"),
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        match dest.as_socket_addr() {
            Some(addr) => socket.connect(addr).await?,
            None => socket.connect(dest.net_addr()).await?,
        }
        let local = socket.local_addr()?;

        let conv: u32 = rand::thread_rng().gen();
        let conn = KcpConnection::new(
            conv,
            Arc::new(ConnectedOutput {
                socket: Arc::clone(&socket),
            }),
            default_authenticator_chain(),
            settings,
        );
        debug!("KCP dial {} conv {}", dest, conv);

        // Feed incoming datagrams until the connection dies.
        let core = Arc::downgrade(&conn.core());
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let Some(core) = core.upgrade() else { break };
                if core.state() == State::Terminated {
                    break;
                }
                tokio::select! {
                    received = socket.recv(&mut buf) => match received {
                        Ok(n) => {
                            let _ = core.input(&buf[..n]);
                        }
                        Err(_) => break,
                    },
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        });

        Ok(Connection::new(
            Box::new(conn),
            Destination::from(local),
            dest.clone(),
        ))
    }
}

struct KcpHubInner {
    accepting: bool,
    pending: VecDeque<(KcpConnection, SocketAddr)>,
    sessions: HashMap<(SocketAddr, u32), Arc<super::connection::KcpCore>>,
}

struct KcpHubShared {
    inner: Mutex<KcpHubInner>,
    notify: Notify,
}

/// KCP listener: one UDP socket, many conversations.
pub struct KcpHub {
    local_addr: SocketAddr,
    shared: Arc<KcpHubShared>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl KcpHub {
    pub async fn listen(address: Address, port: Port, options: &ListenOptions) -> Result<KcpHub> {
        let ip = address
            .as_ip()
            .ok_or_else(|| Error::Config(format!("cannot listen on domain address: {}", address)))?;
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(ip, port)).await?);
        let local_addr = socket.local_addr()?;
        let settings = kcp_settings(&options.stream);

        let shared = Arc::new(KcpHubShared {
            inner: Mutex::new(KcpHubInner {
                accepting: true,
                pending: VecDeque::new(),
                sessions: HashMap::new(),
            }),
            notify: Notify::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let recv_task = tokio::spawn(async move {
            // Chain used only to peel datagrams for routing; each session
            // opens its own copy again.
            let route_chain = default_authenticator_chain();
            let mut buf = vec![0u8; 65535];
            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buf) => received,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        sweep_terminated(&loop_shared);
                        continue;
                    }
                };
                let (n, peer) = match received {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let datagram = &buf[..n];
                let conv = match route_chain
                    .open(Bytes::copy_from_slice(datagram))
                    .and_then(Segment::decode)
                {
                    Ok(seg) => seg.conv,
                    Err(e) => {
                        trace!("KCP hub: discarding datagram from {}: {}", peer, e);
                        continue;
                    }
                };

                let core = {
                    let mut inner = loop_shared.inner.lock();
                    if !inner.accepting {
                        break;
                    }
                    match inner.sessions.get(&(peer, conv)) {
                        Some(core) => Arc::clone(core),
                        None => {
                            if inner.pending.len() >= ACCEPT_QUEUE_SIZE {
                                debug!("KCP hub: accept queue full, dropping conversation");
                                continue;
                            }
                            let conn = KcpConnection::new(
                                conv,
                                Arc::new(PeerOutput {
                                    socket: Arc::clone(&socket),
                                    peer,
                                }),
                                default_authenticator_chain(),
                                settings.clone(),
                            );
                            let core = conn.core();
                            inner.sessions.insert((peer, conv), Arc::clone(&core));
                            inner.pending.push_back((conn, peer));
                            loop_shared.notify.notify_waiters();
                            core
                        }
                    }
                };
                let _ = core.input(datagram);
            }
        });

        Ok(KcpHub {
            local_addr,
            shared,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }
}

fn sweep_terminated(shared: &KcpHubShared) {
    let mut inner = shared.inner.lock();
    inner
        .sessions
        .retain(|_, core| core.state() != State::Terminated);
}

#[async_trait]
impl Listener for KcpHub {
    async fn accept(&self) -> Result<Connection> {
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if !inner.accepting {
                    return Err(Error::ListenerClosed);
                }
                if let Some((conn, peer)) = inner.pending.pop_front() {
                    return Ok(Connection::new(
                        Box::new(conn),
                        Destination::from(self.local_addr),
                        Destination::from(peer),
                    ));
                }
            }
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(ACCEPT_POLL_INTERVAL) => {}
            }
        }
    }

    fn local_addr(&self) -> Destination {
        Destination::from(self.local_addr)
    }

    async fn close(&self) -> Result<()> {
        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let mut inner = self.shared.inner.lock();
        inner.accepting = false;
        inner.pending.clear();
        inner.sessions.clear();
        drop(inner);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

pub struct KcpTransportFactory;

#[async_trait]
impl TransportFactory for KcpTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Kcp
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(KcpDialer)
    }

    async fn listen(
        &self,
        address: Address,
        port: Port,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>> {
        Ok(Box::new(KcpHub::listen(address, port, &options).await?))
    }

    fn default_settings(&self) -> NetworkSettings {
        NetworkSettings::Kcp(KcpSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn kcp_stream_settings() -> StreamSettings {
        StreamSettings {
            network: TransportKind::Kcp,
            kcp_settings: Some(KcpSettings {
                tti: 10,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_kcp_dial_and_accept_echo() {
        let options = ListenOptions {
            stream: kcp_stream_settings(),
        };
        let hub = KcpHub::listen(Address::localhost(), 0, &options)
            .await
            .unwrap();
        let port = hub.local_addr().port;

        let server = tokio::spawn(async move {
            let mut conn = hub.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
            // keep the session alive until the peer has read the echo
            tokio::time::sleep(Duration::from_millis(500)).await;
            hub.close().await.unwrap();
        });

        let dest = Destination::tcp(Address::localhost(), port);
        let mut conn = KcpDialer
            .dial(None, &dest, &kcp_stream_settings())
            .await
            .unwrap();

        conn.write_all(b"kcp says hello").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"kcp says hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_fails_after_close() {
        let options = ListenOptions {
            stream: kcp_stream_settings(),
        };
        let hub = KcpHub::listen(Address::localhost(), 0, &options)
            .await
            .unwrap();
        hub.close().await.unwrap();
        assert!(matches!(hub.accept().await, Err(Error::ListenerClosed)));
    }
}
