//! Transport Layer
//!
//! Establishes raw byte connections over pluggable carriers: plain TCP,
//! TLS over TCP, WebSocket frames, and KCP over UDP. Every adapter
//! produces the same [`Connection`] type; handlers never see the carrier.
//!
//! Adapters are collected in a [`TransportRegistry`] assembled once at
//! program start and passed to the Point constructor; nothing mutates the
//! registry afterwards.

pub mod connection;
pub mod kcp;
pub mod pool;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

pub use connection::{Connection, Recycler};
pub use pool::ConnectionPool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{Address, Destination, Network, Port};
use crate::error::{Error, Result};

/// Carrier selectable in stream settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Kcp,
    #[serde(rename = "ws")]
    WebSocket,
    #[default]
    #[serde(rename = "rawtcp")]
    RawTcp,
}

/// Security layer applied on top of the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    #[default]
    None,
    Tls,
}

/// Per-carrier settings of a stream.
#[derive(Debug, Clone)]
pub enum NetworkSettings {
    Tcp(TcpSettings),
    Kcp(kcp::KcpSettings),
    WebSocket(WsSettings),
    RawTcp,
}

/// TCP carrier settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpSettings {}

/// WebSocket carrier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsSettings {
    /// URL path the tunnel lives on
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// Return idle connections to a per-destination pool instead of
    /// closing them
    #[serde(default)]
    pub connection_reuse: bool,
}

fn default_ws_path() -> String {
    "/".to_string()
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            connection_reuse: false,
        }
    }
}

/// TLS security settings, client and server side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Server name for SNI (client mode); defaults to the destination host
    pub server_name: Option<String>,
    /// Skip certificate verification (client mode)
    #[serde(default)]
    pub allow_insecure: bool,
    /// Certificate file path, PEM (server mode)
    pub certificate_file: Option<String>,
    /// Private key file path, PEM (server mode)
    pub key_file: Option<String>,
}

/// Stream configuration carried by handler metadata: which carrier, which
/// security layer, and their settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default)]
    pub network: TransportKind,
    #[serde(default)]
    pub security: SecurityKind,
    /// Idle read timeout in seconds applied by protocol handlers; 0 means
    /// no timeout
    #[serde(default)]
    pub timeout: u32,
    pub tcp_settings: Option<TcpSettings>,
    pub kcp_settings: Option<kcp::KcpSettings>,
    pub ws_settings: Option<WsSettings>,
    pub tls_settings: Option<TlsSettings>,
}

impl StreamSettings {
    /// Settings for the configured carrier, falling back to the carrier's
    /// defaults when the section is absent.
    pub fn effective_network_settings(&self) -> NetworkSettings {
        match self.network {
            TransportKind::Tcp => {
                NetworkSettings::Tcp(self.tcp_settings.clone().unwrap_or_default())
            }
            TransportKind::Kcp => {
                NetworkSettings::Kcp(self.kcp_settings.clone().unwrap_or_default())
            }
            TransportKind::WebSocket => {
                NetworkSettings::WebSocket(self.ws_settings.clone().unwrap_or_default())
            }
            TransportKind::RawTcp => NetworkSettings::RawTcp,
        }
    }

    /// Effective TLS settings; `None` unless security is TLS.
    pub fn effective_security_settings(&self) -> Option<TlsSettings> {
        match self.security {
            SecurityKind::Tls => Some(self.tls_settings.clone().unwrap_or_default()),
            SecurityKind::None => None,
        }
    }
}

/// Options for binding a listener.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub stream: StreamSettings,
}

/// Establishes outgoing connections for one carrier.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        stream: &StreamSettings,
    ) -> Result<Connection>;
}

/// Accepts incoming connections for one carrier.
///
/// Lifecycle: `accepting → closed`. After `close`, pending and future
/// `accept` calls fail with [`Error::ListenerClosed`]; connections already
/// handed out are unaffected.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> Result<Connection>;

    fn local_addr(&self) -> Destination;

    async fn close(&self) -> Result<()>;
}

/// One carrier's full capability set: dialing, listening, and default
/// settings for its network kind.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn dialer(&self) -> Arc<dyn Dialer>;

    async fn listen(
        &self,
        address: Address,
        port: Port,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>>;

    /// Default per-network settings when the stream config has no section
    /// for this carrier.
    fn default_settings(&self) -> NetworkSettings;
}

/// Immutable catalog of transport adapters, keyed by carrier kind.
/// Assembled before any handler is constructed.
pub struct TransportRegistry {
    factories: HashMap<TransportKind, Arc<dyn TransportFactory>>,
    udp_dialer: Arc<dyn Dialer>,
}

impl TransportRegistry {
    /// Registry with all built-in adapters: TCP, RawTCP, WebSocket, KCP,
    /// and the UDP dialer.
    pub fn with_builtins() -> Self {
        let mut factories: HashMap<TransportKind, Arc<dyn TransportFactory>> = HashMap::new();
        factories.insert(TransportKind::Tcp, Arc::new(tcp::TcpTransportFactory));
        factories.insert(TransportKind::RawTcp, Arc::new(tcp::RawTcpTransportFactory));
        factories.insert(
            TransportKind::WebSocket,
            Arc::new(ws::WsTransportFactory::new()),
        );
        factories.insert(TransportKind::Kcp, Arc::new(kcp::KcpTransportFactory));
        Self {
            factories,
            udp_dialer: Arc::new(udp::UdpDialer),
        }
    }

    fn factory(&self, kind: TransportKind) -> Result<&Arc<dyn TransportFactory>> {
        self.factories
            .get(&kind)
            .ok_or(Error::UnsupportedStreamType)
    }

    /// Dial `dest`. TCP destinations dispatch on the configured carrier;
    /// UDP destinations always use the UDP dialer.
    pub async fn dial(
        &self,
        src: Option<Address>,
        dest: &Destination,
        stream: &StreamSettings,
    ) -> Result<Connection> {
        match dest.network {
            Network::Tcp => {
                self.factory(stream.network)?
                    .dialer()
                    .dial(src, dest, stream)
                    .await
            }
            Network::Udp => self.udp_dialer.dial(src, dest, stream).await,
        }
    }

    /// Bind a listener for the carrier configured in `options.stream`.
    pub async fn listen(
        &self,
        address: Address,
        port: Port,
        options: ListenOptions,
    ) -> Result<Box<dyn Listener>> {
        self.factory(options.stream.network)?
            .listen(address, port, options)
            .await
    }
}

impl crate::app::Application for TransportRegistry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_settings_fall_back_to_defaults() {
        let stream = StreamSettings {
            network: TransportKind::WebSocket,
            ..Default::default()
        };
        match stream.effective_network_settings() {
            NetworkSettings::WebSocket(ws) => {
                assert_eq!(ws.path, "/");
                assert!(!ws.connection_reuse);
            }
            other => panic!("unexpected settings: {:?}", other),
        }
    }

    #[test]
    fn test_security_settings_require_tls() {
        let mut stream = StreamSettings::default();
        assert!(stream.effective_security_settings().is_none());
        stream.security = SecurityKind::Tls;
        assert!(stream.effective_security_settings().is_some());
    }
}
