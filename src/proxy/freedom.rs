//! Freedom: the direct outbound handler. Dials the session destination
//! through the transport registry and pumps the Ray to the connection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::app::{Space, TRANSPORT_APP_ID};
use crate::common::SessionInfo;
use crate::error::{Error, Result};
use crate::ray::{pump, OutboundRay};
use crate::transport::TransportRegistry;

use super::{OutboundHandler, OutboundHandlerFactory, OutboundHandlerMeta};

pub struct FreedomHandler {
    meta: OutboundHandlerMeta,
    transports: Arc<TransportRegistry>,
}

impl FreedomHandler {
    pub fn new(meta: OutboundHandlerMeta, transports: Arc<TransportRegistry>) -> Self {
        Self { meta, transports }
    }
}

#[async_trait]
impl OutboundHandler for FreedomHandler {
    async fn dispatch(&self, session: SessionInfo, ray: OutboundRay) {
        let conn = match self
            .transports
            .dial(
                self.meta.send_through.clone(),
                &session.destination,
                &self.meta.stream_settings,
            )
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                // Dropping the ray closes both ends; the inbound side
                // observes the failure as a dead session.
                warn!(
                    "[{}] failed to dial {}: {}",
                    self.meta.tag, session.destination, e
                );
                return;
            }
        };
        debug!("[{}] connected to {}", self.meta.tag, session.destination);

        let (conn_read, conn_write) = tokio::io::split(conn);
        let (ray_input, ray_output) = ray.split();

        let (up, down) = tokio::join!(pump(ray_output, conn_write), pump(conn_read, ray_input));
        debug!(
            "[{}] session to {} closed (up {}B, down {}B)",
            self.meta.tag, session.destination, up, down
        );
    }
}

pub struct FreedomFactory;

impl OutboundHandlerFactory for FreedomFactory {
    fn create(
        &self,
        space: &Arc<Space>,
        _raw_settings: &serde_json::Value,
        meta: OutboundHandlerMeta,
    ) -> Result<Arc<dyn OutboundHandler>> {
        let transports = space
            .get_app::<TransportRegistry>(TRANSPORT_APP_ID)
            .ok_or_else(|| Error::Config("transport registry not bound".into()))?;
        Ok(Arc::new(FreedomHandler::new(meta, transports)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Destination};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_handler() -> FreedomHandler {
        FreedomHandler::new(
            OutboundHandlerMeta {
                tag: "direct".into(),
                send_through: None,
                stream_settings: Default::default(),
            },
            Arc::new(TransportRegistry::with_builtins()),
        )
    }

    async fn spawn_echo_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_dispatch_pumps_both_directions() {
        let port = spawn_echo_server().await;
        let handler = test_handler();

        let (inbound, outbound) = crate::ray::new_ray();
        let session = SessionInfo::new(
            Destination::tcp(Address::localhost(), 50000),
            Destination::tcp(Address::localhost(), port),
        );
        tokio::spawn(async move { handler.dispatch(session, outbound).await });

        let (mut input, mut output) = inbound.split();
        input.write_all(b"echo me").await.unwrap();
        input.shutdown().await.unwrap();

        let mut reply = Vec::new();
        output.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"echo me");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_ray() {
        let handler = test_handler();
        let (inbound, outbound) = crate::ray::new_ray();
        // A port that nothing listens on; connect is refused quickly.
        let session = SessionInfo::new(
            Destination::tcp(Address::localhost(), 50001),
            Destination::tcp(Address::localhost(), 1),
        );
        tokio::spawn(async move { handler.dispatch(session, outbound).await });

        let (_input, mut output) = inbound.split();
        let mut reply = Vec::new();
        output.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }
}
