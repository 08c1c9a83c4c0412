//! Point - a running proxy instance: one inbound handler, one outbound
//! handler, and any number of detours.
//!
//! Construction is a DAG: transport and proxy registries first, then the
//! Space with the outbound manager and dispatcher, then the handlers.
//! Nothing looks anything up after `Space::initialize`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::{
    DefaultDispatcher, OutboundManager, Router, Space, DISPATCHER_APP_ID, OUTBOUND_MANAGER_APP_ID,
    TRANSPORT_APP_ID,
};
use crate::common::retry::retry_timed;
use crate::common::Port;
use crate::config::{AllocationStrategy, InboundDetourConfig, PointConfig};
use crate::error::{Error, Result};
use crate::proxy::{InboundHandler, InboundHandlerMeta, OutboundHandlerMeta, ProxyRegistry};
use crate::transport::TransportRegistry;

/// Bind retry schedule of `Point::start`.
const START_RETRY_ATTEMPTS: usize = 100;
const START_RETRY_DELAY_MS: u64 = 100;

/// A Point server, built from configuration. Not yet listening until
/// [`Point::start`].
pub struct Point {
    port: Port,
    inbound: Arc<dyn InboundHandler>,
    inbound_detours: Vec<Arc<dyn InboundDetourHandler>>,
    space: Arc<Space>,
}

impl Point {
    pub fn new(
        config: &PointConfig,
        transports: Arc<TransportRegistry>,
        proxies: Arc<ProxyRegistry>,
        router: Option<Arc<dyn Router>>,
    ) -> Result<Point> {
        let space = Space::new();
        space.bind_app(TRANSPORT_APP_ID, Arc::clone(&transports))?;

        let outbounds = Arc::new(OutboundManager::new());
        space.bind_app(OUTBOUND_MANAGER_APP_ID, Arc::clone(&outbounds))?;

        let dispatcher = Arc::new(DefaultDispatcher::new(Arc::clone(&outbounds), router));
        space.bind_app(DISPATCHER_APP_ID, dispatcher)?;

        // The default outbound must exist before any dispatch can happen.
        let och = proxies.create_outbound_handler(
            &config.outbound.protocol,
            &space,
            &config.outbound.settings,
            OutboundHandlerMeta {
                tag: "system.outbound".to_string(),
                send_through: config.outbound.send_through.clone(),
                stream_settings: config.outbound.stream_settings.clone(),
            },
        )?;
        outbounds.set_default_handler(och);

        for detour in &config.outbound_detours {
            let handler = proxies.create_outbound_handler(
                &detour.protocol,
                &space,
                &detour.settings,
                OutboundHandlerMeta {
                    tag: detour.tag.clone(),
                    send_through: detour.send_through.clone(),
                    stream_settings: detour.stream_settings.clone(),
                },
            )?;
            outbounds.set_handler(detour.tag.clone(), handler);
        }

        let inbound = proxies.create_inbound_handler(
            &config.inbound.protocol,
            &space,
            &config.inbound.settings,
            InboundHandlerMeta {
                tag: "system.inbound".to_string(),
                address: config.inbound.listen_on(),
                port: config.effective_port(),
                stream_settings: config.inbound.stream_settings.clone(),
                allow_passive_connection: config.inbound.allow_passive,
            },
        )?;

        let mut inbound_detours: Vec<Arc<dyn InboundDetourHandler>> = Vec::new();
        for detour in &config.inbound_detours {
            let handler: Arc<dyn InboundDetourHandler> = match detour.allocation.strategy {
                AllocationStrategy::Always => Arc::new(AlwaysDetourHandler::new(
                    &space,
                    Arc::clone(&proxies),
                    detour,
                )?),
                AllocationStrategy::Random => Arc::new(DynamicDetourHandler::new(
                    Arc::clone(&space),
                    Arc::clone(&proxies),
                    detour.clone(),
                )),
            };
            inbound_detours.push(handler);
        }

        space.initialize()?;

        Ok(Point {
            port: config.effective_port(),
            inbound,
            inbound_detours,
            space,
        })
    }

    pub fn space(&self) -> &Arc<Space> {
        &self.space
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// Start the Point server. The inbound bind is retried up to 100
    /// times with 100 ms spacing; a non-positive port fails immediately.
    pub async fn start(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config(format!("invalid port: {}", self.port)));
        }
        retry_timed(START_RETRY_ATTEMPTS, START_RETRY_DELAY_MS, || {
            self.inbound.start()
        })
        .await?;
        info!("point started on port {}", self.port);

        for detour in &self.inbound_detours {
            detour.start().await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.inbound.close().await;
        for detour in &self.inbound_detours {
            detour.close().await;
        }
    }
}

/// A secondary inbound spanning a port range.
#[async_trait::async_trait]
pub trait InboundDetourHandler: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn close(&self);
}

fn detour_meta(detour: &InboundDetourConfig, port: Port) -> InboundHandlerMeta {
    InboundHandlerMeta {
        tag: detour.tag.clone(),
        address: detour.listen_on(),
        port,
        stream_settings: detour.stream_settings.clone(),
        allow_passive_connection: detour.allow_passive,
    }
}

/// `always` allocation: one handler per port in the range, bound for the
/// lifetime of the Point.
pub struct AlwaysDetourHandler {
    handlers: Vec<Arc<dyn InboundHandler>>,
}

impl AlwaysDetourHandler {
    pub fn new(
        space: &Arc<Space>,
        proxies: Arc<ProxyRegistry>,
        detour: &InboundDetourConfig,
    ) -> Result<Self> {
        let mut handlers = Vec::new();
        for port in detour.port_range.ports() {
            let handler = proxies.create_inbound_handler(
                &detour.protocol,
                space,
                &detour.settings,
                detour_meta(detour, port),
            )?;
            handlers.push(handler);
        }
        Ok(Self { handlers })
    }
}

#[async_trait::async_trait]
impl InboundDetourHandler for AlwaysDetourHandler {
    async fn start(&self) -> Result<()> {
        for handler in &self.handlers {
            retry_timed(START_RETRY_ATTEMPTS, START_RETRY_DELAY_MS, || handler.start()).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        for handler in &self.handlers {
            handler.close().await;
        }
    }
}

/// `random` allocation: `concurrency` handlers on random ports of the
/// range, re-allocated every `refresh` minutes.
pub struct DynamicDetourHandler {
    space: Arc<Space>,
    proxies: Arc<ProxyRegistry>,
    detour: InboundDetourConfig,
    active: Arc<Mutex<Vec<Arc<dyn InboundHandler>>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicDetourHandler {
    pub fn new(space: Arc<Space>, proxies: Arc<ProxyRegistry>, detour: InboundDetourConfig) -> Self {
        Self {
            space,
            proxies,
            detour,
            active: Arc::new(Mutex::new(Vec::new())),
            refresh_task: Mutex::new(None),
        }
    }

    fn pick_ports(&self) -> Vec<Port> {
        let mut ports: Vec<Port> = self.detour.port_range.ports().collect();
        ports.shuffle(&mut rand::thread_rng());
        ports.truncate(self.detour.allocation.concurrency as usize);
        ports
    }

    async fn allocate(&self) -> Result<Vec<Arc<dyn InboundHandler>>> {
        let mut handlers = Vec::new();
        for port in self.pick_ports() {
            let handler = self.proxies.create_inbound_handler(
                &self.detour.protocol,
                &self.space,
                &self.detour.settings,
                detour_meta(&self.detour, port),
            )?;
            handler.start().await?;
            handlers.push(handler);
        }
        Ok(handlers)
    }
}

#[async_trait::async_trait]
impl InboundDetourHandler for DynamicDetourHandler {
    async fn start(&self) -> Result<()> {
        let handlers = self.allocate().await?;
        *self.active.lock() = handlers;

        let space = Arc::clone(&self.space);
        let proxies = Arc::clone(&self.proxies);
        let detour = self.detour.clone();
        let active = Arc::clone(&self.active);
        let refresh = Duration::from_secs(self.detour.allocation.refresh as u64 * 60);
        let task = tokio::spawn(async move {
            let shadow = DynamicDetourHandler::new(space, proxies, detour);
            loop {
                tokio::time::sleep(refresh).await;
                let previous: Vec<_> = active.lock().drain(..).collect();
                for handler in previous {
                    handler.close().await;
                }
                match shadow.allocate().await {
                    Ok(handlers) => *active.lock() = handlers,
                    Err(e) => warn!("detour re-allocation failed: {}", e),
                }
            }
        });
        *self.refresh_task.lock() = Some(task);
        Ok(())
    }

    async fn close(&self) {
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let handlers: Vec<_> = self.active.lock().drain(..).collect();
        for handler in handlers {
            handler.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn registries() -> (Arc<TransportRegistry>, Arc<ProxyRegistry>) {
        (
            Arc::new(TransportRegistry::with_builtins()),
            Arc::new(ProxyRegistry::with_builtins()),
        )
    }

    async fn free_port() -> Port {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn http_point_config(port: Port) -> PointConfig {
        PointConfig::from_json(&format!(
            r#"{{
                "port": {},
                "inbound": {{"protocol": "http", "listen": "127.0.0.1"}},
                "outbound": {{"protocol": "freedom"}}
            }}"#,
            port
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_port_fails_immediately() {
        let (transports, proxies) = registries();
        let config = http_point_config(0);
        let point = Point::new(&config, transports, proxies, None).unwrap();
        assert!(matches!(point.start().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_protocol_fails_construction() {
        let (transports, proxies) = registries();
        let config = PointConfig::from_json(
            r#"{
                "port": 1080,
                "inbound": {"protocol": "smtp"},
                "outbound": {"protocol": "freedom"}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            Point::new(&config, transports, proxies, None),
            Err(Error::Config(_))
        ));
    }

    /// Plain HTTP GET through a whole Point: http inbound, dispatcher,
    /// freedom outbound, a local origin server.
    #[tokio::test]
    async fn test_get_through_point() {
        // origin server answering one request
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = conn.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("GET /hello HTTP/1.1\r\n"));
            assert!(request.contains("Connection: close\r\n"));
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nworld")
                .await
                .unwrap();
        });

        let port = free_port().await;
        let (transports, proxies) = registries();
        let config = http_point_config(port);
        let point = Point::new(&config, transports, proxies, None).unwrap();
        point.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{}/hello HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
                    origin_port, origin_port
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("world"));
        point.close().await;
    }

    /// CONNECT to a host nobody answers: the client gets the 200 and then
    /// a dropped connection, never a 5xx.
    #[tokio::test]
    async fn test_connect_to_dead_host_drops_connection() {
        let port = free_port().await;
        let (transports, proxies) = registries();
        let config = http_point_config(port);
        let point = Point::new(&config, transports, proxies, None).unwrap();
        point.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\n");
        point.close().await;
    }

    #[tokio::test]
    async fn test_always_detour_binds_every_port() {
        let base = free_port().await;
        let main_port = free_port().await;
        let (transports, proxies) = registries();
        let mut config = http_point_config(main_port);
        config.inbound_detours = vec![serde_json::from_value(serde_json::json!({
            "protocol": "http",
            "port": base,
            "listen": "127.0.0.1",
            "tag": "detour-http"
        }))
        .unwrap()];

        let point = Point::new(&config, transports, proxies, None).unwrap();
        point.start().await.unwrap();

        // The detour port accepts connections too.
        let conn = TcpStream::connect(("127.0.0.1", base)).await;
        assert!(conn.is_ok());
        point.close().await;
    }
}
