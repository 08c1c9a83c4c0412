//! UDP dialer: a connected datagram socket behind the byte-stream
//! Connection contract. Each read yields one datagram; each write sends
//! one.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use crate::common::{Address, Destination, IntoStream};
use crate::error::Result;

use super::connection::Connection;
use super::{Dialer, StreamSettings};

/// Dialer used for every UDP destination, regardless of the configured
/// stream carrier.
pub struct UdpDialer;

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        _stream: &StreamSettings,
    ) -> Result<Connection> {
        let bind_addr = match src.and_then(|a| a.as_ip()) {
            Some(ip) => SocketAddr::new(ip, 0),
            None => "0.0.0.0:0".parse().expect("valid any-addr"),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        match dest.as_socket_addr() {
            Some(addr) => socket.connect(addr).await?,
            None => socket.connect(dest.net_addr()).await?,
        }
        let local = socket.local_addr()?;
        Ok(Connection::new(
            UdpStream::new(socket).into_stream(),
            Destination::from(local),
            dest.clone(),
        ))
    }
}

/// Byte-stream adapter over a connected UDP socket.
pub struct UdpStream {
    socket: UdpSocket,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
}

impl UdpStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            read_buf: vec![0u8; 65535],
            read_pos: 0,
            read_len: 0,
        }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.read_pos < this.read_len {
            let to_copy = (this.read_len - this.read_pos).min(buf.remaining());
            buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + to_copy]);
            this.read_pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        let mut recv_buf = ReadBuf::new(&mut this.read_buf);
        match this.socket.poll_recv(cx, &mut recv_buf) {
            Poll::Ready(Ok(())) => {
                this.read_len = recv_buf.filled().len();
                let to_copy = this.read_len.min(buf.remaining());
                buf.put_slice(&this.read_buf[..to_copy]);
                this.read_pos = to_copy;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_udp_dial_echo() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let dest = Destination::udp(Address::localhost(), server_addr.port());
        let mut conn = UdpDialer
            .dial(None, &dest, &StreamSettings::default())
            .await
            .unwrap();

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
