//! KCP connection: the ARQ state machine behind the byte-stream contract.
//!
//! Writes segment application bytes into PUSH segments bounded by the send
//! window; a tick task retransmits unacknowledged segments with backoff.
//! Reads reassemble segments in sequence order. Close sends a BYE segment
//! through the same reliable path.
//!
//! State machine: `Active → ActiveClosed → Terminated` when we close
//! first, `Active → PeerClosed → Terminated` when the peer does.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{Error, Result};

use super::authenticator::AuthenticatorChain;
use super::segment::{Command, Segment};
use super::KcpSettings;

/// Base retransmission timeout; doubles per attempt.
const BASE_RTO: Duration = Duration::from_millis(100);

/// Retransmission timeout cap.
const MAX_RTO: Duration = Duration::from_millis(1600);

/// Keepalive interval while the connection is idle.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// How long a closing side waits for the peer before terminating anyway.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Initial guess for the peer's receive window, in segments.
const INITIAL_REMOTE_WND: u16 = 32;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Both sides open
    Active,
    /// We sent BYE, peer still open
    ActiveClosed,
    /// Peer sent BYE, we are still open
    PeerClosed,
    /// Both directions finished; the connection is dead
    Terminated,
}

/// Best-effort datagram sink. Implementations may drop datagrams; the ARQ
/// layer recovers.
pub trait DatagramOutput: Send + Sync {
    fn send(&self, datagram: Bytes);
}

struct SentSegment {
    sn: u32,
    cmd: Command,
    payload: Bytes,
    last_sent: Instant,
    xmit: u32,
}

struct RecvSegment {
    payload: Bytes,
    fin: bool,
}

struct CoreInner {
    state: State,
    // send side
    snd_buf: VecDeque<SentSegment>,
    snd_nxt: u32,
    remote_wnd: u16,
    // receive side
    rcv_nxt: u32,
    rcv_buf: BTreeMap<u32, RecvSegment>,
    rcv_queue: BytesMut,
    peer_closed: bool,
    // close progress
    bye_sent: bool,
    close_started: Option<Instant>,
    last_incoming: Instant,
    last_ping: Instant,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// Shared ARQ state, driven by the connection handle, the input feed, and
/// the tick task.
pub struct KcpCore {
    conv: u32,
    settings: KcpSettings,
    mss: usize,
    auth: AuthenticatorChain,
    output: Arc<dyn DatagramOutput>,
    inner: Mutex<CoreInner>,
    state_changed: Notify,
}

impl KcpCore {
    fn new(
        conv: u32,
        output: Arc<dyn DatagramOutput>,
        auth: AuthenticatorChain,
        settings: KcpSettings,
    ) -> Arc<Self> {
        let mss = settings.mss(auth.overhead());
        Arc::new(Self {
            conv,
            settings,
            mss,
            auth,
            output,
            inner: Mutex::new(CoreInner {
                state: State::Active,
                snd_buf: VecDeque::new(),
                snd_nxt: 0,
                remote_wnd: INITIAL_REMOTE_WND,
                rcv_nxt: 0,
                rcv_buf: BTreeMap::new(),
                rcv_queue: BytesMut::new(),
                peer_closed: false,
                bye_sent: false,
                close_started: None,
                last_incoming: Instant::now(),
                last_ping: Instant::now(),
                read_waker: None,
                write_waker: None,
            }),
            state_changed: Notify::new(),
        })
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Wait until the connection reaches `Terminated`.
    pub async fn wait_terminated(&self) {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == State::Terminated {
                return;
            }
            notified.await;
        }
    }

    fn advertised_wnd(&self, inner: &CoreInner) -> u16 {
        self.settings
            .rcv_wnd
            .saturating_sub(inner.rcv_buf.len() as u16)
    }

    fn transmit(&self, inner: &CoreInner, cmd: Command, sn: u32, payload: Bytes) {
        let seg = Segment {
            conv: self.conv,
            cmd,
            wnd: self.advertised_wnd(inner),
            sn,
            una: inner.rcv_nxt,
            payload,
        };
        self.output.send(self.auth.seal(seg.encode()));
    }

    /// Feed one datagram received from the link. Authentication or decode
    /// failures reject the datagram without touching connection state.
    pub fn input(&self, datagram: &[u8]) -> Result<()> {
        let data = self.auth.open(Bytes::copy_from_slice(datagram))?;
        let seg = Segment::decode(data)?;
        if seg.conv != self.conv {
            return Err(Error::Protocol("conversation id mismatch".into()));
        }

        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return Ok(());
        }
        inner.last_incoming = Instant::now();
        inner.remote_wnd = seg.wnd;

        // cumulative acknowledgement
        while inner
            .snd_buf
            .front()
            .map_or(false, |s| s.sn < seg.una)
        {
            inner.snd_buf.pop_front();
        }

        match seg.cmd {
            Command::Push | Command::Bye => {
                let fin = seg.cmd == Command::Bye;
                // Ack even duplicates; the peer retransmits until it hears us.
                self.transmit(&inner, Command::Ack, seg.sn, Bytes::new());

                let in_window = seg.sn >= inner.rcv_nxt
                    && seg.sn - inner.rcv_nxt < self.settings.rcv_wnd as u32;
                if in_window {
                    inner.rcv_buf.insert(
                        seg.sn,
                        RecvSegment {
                            payload: seg.payload,
                            fin,
                        },
                    );
                    while let Some(ready) = {
                        let next = inner.rcv_nxt;
                        inner.rcv_buf.remove(&next)
                    } {
                        inner.rcv_nxt += 1;
                        if ready.fin {
                            inner.peer_closed = true;
                            if inner.state == State::Active {
                                inner.state = State::PeerClosed;
                                self.state_changed.notify_waiters();
                            }
                        } else {
                            inner.rcv_queue.extend_from_slice(&ready.payload);
                        }
                    }
                    if let Some(waker) = inner.read_waker.take() {
                        waker.wake();
                    }
                }
            }
            Command::Ack => {
                inner.snd_buf.retain(|s| s.sn != seg.sn);
            }
            Command::Ping => {
                trace!("kcp conv {}: ping", self.conv);
            }
        }

        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
        self.check_termination(&mut inner);
        Ok(())
    }

    fn check_termination(&self, inner: &mut CoreInner) {
        if inner.state == State::Terminated {
            return;
        }
        if inner.bye_sent && inner.snd_buf.is_empty() && inner.peer_closed {
            self.terminate(inner);
        }
    }

    fn terminate(&self, inner: &mut CoreInner) {
        inner.state = State::Terminated;
        inner.snd_buf.clear();
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
        self.state_changed.notify_waiters();
    }

    /// One pass of the update loop: retransmissions, keepalive, and close
    /// progress. Returns `false` once the connection is terminated.
    fn tick(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return false;
        }
        let now = Instant::now();

        let mut resend = Vec::new();
        for seg in inner.snd_buf.iter_mut() {
            let rto = rto_for(seg.xmit);
            if now.duration_since(seg.last_sent) >= rto {
                seg.last_sent = now;
                seg.xmit += 1;
                resend.push((seg.cmd, seg.sn, seg.payload.clone()));
            }
        }
        for (cmd, sn, payload) in resend {
            self.transmit(&inner, cmd, sn, payload);
        }

        if inner.snd_buf.is_empty() && now.duration_since(inner.last_ping) >= PING_INTERVAL {
            inner.last_ping = now;
            self.transmit(&inner, Command::Ping, 0, Bytes::new());
        }

        if let Some(started) = inner.close_started {
            let done = inner.bye_sent && inner.snd_buf.is_empty() && inner.peer_closed;
            // Linger only expires on a silent link, so a peer still
            // draining its own transfer is not cut off.
            let silent = now.duration_since(inner.last_incoming) >= CLOSE_LINGER;
            if done || (now.duration_since(started) >= CLOSE_LINGER && silent) {
                self.terminate(&mut inner);
                return false;
            }
        }

        true
    }

    fn begin_close(&self, inner: &mut CoreInner) {
        if inner.bye_sent || inner.state == State::Terminated {
            return;
        }
        let sn = inner.snd_nxt;
        inner.snd_nxt += 1;
        self.transmit(inner, Command::Bye, sn, Bytes::new());
        inner.snd_buf.push_back(SentSegment {
            sn,
            cmd: Command::Bye,
            payload: Bytes::new(),
            last_sent: Instant::now(),
            xmit: 1,
        });
        inner.bye_sent = true;
        inner.close_started = Some(Instant::now());
        if inner.state == State::Active {
            inner.state = State::ActiveClosed;
        }
        self.state_changed.notify_waiters();
    }
}

fn rto_for(xmit: u32) -> Duration {
    let shift = xmit.saturating_sub(1).min(4);
    (BASE_RTO * 2u32.pow(shift)).min(MAX_RTO)
}

/// A KCP connection handle implementing the byte-stream contract.
pub struct KcpConnection {
    core: Arc<KcpCore>,
}

impl KcpConnection {
    /// Create a connection with the caller-assigned conversation id,
    /// writing sealed datagrams to `output`. Starts the tick task.
    pub fn new(
        conv: u32,
        output: Arc<dyn DatagramOutput>,
        auth: AuthenticatorChain,
        settings: KcpSettings,
    ) -> Self {
        let core = KcpCore::new(conv, output, auth, settings);
        spawn_tick_task(&core);
        Self { core }
    }

    /// Shared core, used by the datagram feed and by tests.
    pub fn core(&self) -> Arc<KcpCore> {
        Arc::clone(&self.core)
    }

    pub fn state(&self) -> State {
        self.core.state()
    }
}

pub(crate) fn spawn_tick_task(core: &Arc<KcpCore>) {
    let weak = Arc::downgrade(core);
    let tti = core.settings.tti;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tti.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(core) = weak.upgrade() else {
                break;
            };
            if !core.tick() {
                break;
            }
        }
    });
}

impl AsyncRead for KcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.core.inner.lock();
        if !inner.rcv_queue.is_empty() {
            let n = inner.rcv_queue.len().min(buf.remaining());
            buf.put_slice(&inner.rcv_queue[..n]);
            inner.rcv_queue.advance(n);
            return Poll::Ready(Ok(()));
        }
        if inner.peer_closed || inner.state == State::Terminated {
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for KcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let core = &self.core;
        let mut inner = core.inner.lock();
        // Writes stay legal while only the peer has closed; its read side
        // still drains what we send.
        if inner.bye_sent || inner.state == State::Terminated {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection is closing",
            )));
        }
        let cwnd = core.settings.snd_wnd.min(inner.remote_wnd.max(1)) as usize;
        if inner.snd_buf.len() >= cwnd {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(core.mss);
        let sn = inner.snd_nxt;
        inner.snd_nxt += 1;
        let payload = Bytes::copy_from_slice(&buf[..n]);
        core.transmit(&inner, Command::Push, sn, payload.clone());
        inner.snd_buf.push_back(SentSegment {
            sn,
            cmd: Command::Push,
            payload,
            last_sent: Instant::now(),
            xmit: 1,
        });
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.core.inner.lock();
        self.core.begin_close(&mut inner);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::kcp::default_authenticator_chain;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct NullOutput;

    impl DatagramOutput for NullOutput {
        fn send(&self, _datagram: Bytes) {}
    }

    /// In-memory link that drops every `loss_period`-th datagram.
    struct LossyLink {
        tx: mpsc::UnboundedSender<Bytes>,
        counter: AtomicUsize,
        loss_period: usize,
    }

    impl LossyLink {
        fn new(tx: mpsc::UnboundedSender<Bytes>, loss_period: usize) -> Arc<Self> {
            Arc::new(Self {
                tx,
                counter: AtomicUsize::new(0),
                loss_period,
            })
        }
    }

    impl DatagramOutput for LossyLink {
        fn send(&self, datagram: Bytes) {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            if self.loss_period > 0 && n % self.loss_period == self.loss_period - 1 {
                return; // dropped on the floor
            }
            let _ = self.tx.send(datagram);
        }
    }

    fn test_settings() -> KcpSettings {
        KcpSettings {
            tti: 10,
            ..Default::default()
        }
    }

    fn feed(core: Arc<KcpCore>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                let _ = core.input(&datagram);
                if core.state() == State::Terminated {
                    break;
                }
            }
        });
    }

    fn lossy_pair(loss_period: usize) -> (KcpConnection, KcpConnection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let client = KcpConnection::new(
            1,
            LossyLink::new(a_tx, loss_period),
            default_authenticator_chain(),
            test_settings(),
        );
        let server = KcpConnection::new(
            1,
            LossyLink::new(b_tx, loss_period),
            default_authenticator_chain(),
            test_settings(),
        );

        feed(server.core(), a_rx);
        feed(client.core(), b_rx);
        (client, server)
    }

    #[tokio::test]
    async fn test_one_way_transfer_over_lossless_link() {
        let (mut client, mut server) = lossy_pair(0);

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 255) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplex_transfer_over_lossy_link_terminates() {
        let (client, server) = lossy_pair(7);
        let client_core = client.core();
        let server_core = server.core();

        let client_payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let server_payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 241) as u8).collect();
        let client_expected = server_payload.clone();
        let server_expected = client_payload.clone();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let tasks = vec![
            tokio::spawn(async move {
                client_write.write_all(&client_payload).await.unwrap();
                client_write.shutdown().await.unwrap();
            }),
            tokio::spawn(async move {
                server_write.write_all(&server_payload).await.unwrap();
                server_write.shutdown().await.unwrap();
            }),
            tokio::spawn(async move {
                let mut received = Vec::new();
                client_read.read_to_end(&mut received).await.unwrap();
                assert_eq!(received, client_expected);
            }),
            tokio::spawn(async move {
                let mut received = Vec::new();
                server_read.read_to_end(&mut received).await.unwrap();
                assert_eq!(received, server_expected);
            }),
        ];
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(60), task)
                .await
                .expect("transfer stalled")
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(30), async {
            client_core.wait_terminated().await;
            server_core.wait_terminated().await;
        })
        .await
        .expect("connections failed to terminate");

        assert_eq!(client_core.state(), State::Terminated);
        assert_eq!(server_core.state(), State::Terminated);
    }

    #[tokio::test]
    async fn test_write_fails_after_shutdown() {
        let mut conn = KcpConnection::new(
            9,
            Arc::new(NullOutput),
            default_authenticator_chain(),
            test_settings(),
        );
        conn.shutdown().await.unwrap();
        assert_eq!(conn.state(), State::ActiveClosed);
        assert!(conn.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_lingers_then_terminates_without_peer() {
        let mut conn = KcpConnection::new(
            9,
            Arc::new(NullOutput),
            default_authenticator_chain(),
            test_settings(),
        );
        let core = conn.core();
        conn.shutdown().await.unwrap();
        tokio::time::timeout(CLOSE_LINGER + Duration::from_secs(2), core.wait_terminated())
            .await
            .expect("linger should terminate the connection");
    }
}
