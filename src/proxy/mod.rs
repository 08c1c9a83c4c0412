//! Proxy layer: inbound and outbound handler traits, handler metadata,
//! and the protocol-name registry that creates handlers.

pub mod freedom;
pub mod http;

pub use freedom::FreedomHandler;
pub use http::HttpServer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::Space;
use crate::common::{Address, Port, SessionInfo};
use crate::error::{Error, Result};
use crate::ray::OutboundRay;
use crate::transport::StreamSettings;

/// Immutable facts about an inbound handler.
#[derive(Debug, Clone)]
pub struct InboundHandlerMeta {
    pub tag: String,
    pub address: Address,
    pub port: Port,
    pub stream_settings: StreamSettings,
    pub allow_passive_connection: bool,
}

/// Immutable facts about an outbound handler.
#[derive(Debug, Clone)]
pub struct OutboundHandlerMeta {
    pub tag: String,
    /// Source address to bind outgoing sockets to
    pub send_through: Option<Address>,
    pub stream_settings: StreamSettings,
}

/// An inbound handler accepts client connections and feeds sessions into
/// the dispatcher.
///
/// Lifecycle: `created → started → accepting → closed`; `close` is
/// terminal.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Bind the listener and start accepting. Idempotent while accepting.
    async fn start(&self) -> Result<()>;

    fn port(&self) -> Port;

    async fn close(&self);
}

/// An outbound handler services the far side of a Ray, moving bytes
/// between the Ray and a remote peer.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn dispatch(&self, session: SessionInfo, ray: OutboundRay);
}

/// Creates inbound handlers for one protocol name.
pub trait InboundHandlerFactory: Send + Sync {
    fn create(
        &self,
        space: &Arc<Space>,
        raw_settings: &serde_json::Value,
        meta: InboundHandlerMeta,
    ) -> Result<Arc<dyn InboundHandler>>;
}

/// Creates outbound handlers for one protocol name.
pub trait OutboundHandlerFactory: Send + Sync {
    fn create(
        &self,
        space: &Arc<Space>,
        raw_settings: &serde_json::Value,
        meta: OutboundHandlerMeta,
    ) -> Result<Arc<dyn OutboundHandler>>;
}

/// Catalog of handler factories keyed by protocol name. Assembled at
/// program start, immutable afterwards.
pub struct ProxyRegistry {
    inbound: HashMap<String, Arc<dyn InboundHandlerFactory>>,
    outbound: HashMap<String, Arc<dyn OutboundHandlerFactory>>,
}

impl ProxyRegistry {
    /// Registry with the built-in handlers: the HTTP inbound and the
    /// freedom (direct) outbound.
    pub fn with_builtins() -> Self {
        let mut inbound: HashMap<String, Arc<dyn InboundHandlerFactory>> = HashMap::new();
        inbound.insert("http".to_string(), Arc::new(http::HttpServerFactory));
        let mut outbound: HashMap<String, Arc<dyn OutboundHandlerFactory>> = HashMap::new();
        outbound.insert("freedom".to_string(), Arc::new(freedom::FreedomFactory));
        Self { inbound, outbound }
    }

    pub fn create_inbound_handler(
        &self,
        protocol: &str,
        space: &Arc<Space>,
        raw_settings: &serde_json::Value,
        meta: InboundHandlerMeta,
    ) -> Result<Arc<dyn InboundHandler>> {
        let factory = self
            .inbound
            .get(protocol)
            .ok_or_else(|| Error::Config(format!("unknown inbound protocol: {}", protocol)))?;
        factory.create(space, raw_settings, meta)
    }

    pub fn create_outbound_handler(
        &self,
        protocol: &str,
        space: &Arc<Space>,
        raw_settings: &serde_json::Value,
        meta: OutboundHandlerMeta,
    ) -> Result<Arc<dyn OutboundHandler>> {
        let factory = self
            .outbound
            .get(protocol)
            .ok_or_else(|| Error::Config(format!("unknown outbound protocol: {}", protocol)))?;
        factory.create(space, raw_settings, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_protocol_is_config_error() {
        let registry = ProxyRegistry::with_builtins();
        let space = Space::new();
        let result = registry.create_inbound_handler(
            "carrier-pigeon",
            &space,
            &serde_json::Value::Null,
            InboundHandlerMeta {
                tag: "in".into(),
                address: Address::localhost(),
                port: 1080,
                stream_settings: Default::default(),
                allow_passive_connection: false,
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
