//! Configuration consumed by a Point.
//!
//! How the objects arrive is the caller's concern; this module only
//! decodes JSON into typed structs and imposes the defaults the core
//! guarantees: allocation strategy `always`, random-allocation
//! concurrency 3 / refresh 5 minutes, refresh 9999 minutes otherwise, a
//! localhost DNS nameserver when none is configured, and an any-IP listen
//! address. Domain listen and send-through addresses are rejected.

use serde::{Deserialize, Serialize};

use crate::common::{Address, Network, Port};
use crate::error::{Error, Result};
use crate::transport::StreamSettings;

/// Refresh period meaning "effectively never", in minutes.
const DEFAULT_REFRESH_MINUTES: u32 = 9999;

/// Top-level configuration of one Point server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    /// Port of this Point server; used when the inbound section does not
    /// carry its own.
    #[serde(default)]
    pub port: Port,

    #[serde(default)]
    pub log: LogConfig,

    pub inbound: InboundConnectionConfig,

    pub outbound: OutboundConnectionConfig,

    #[serde(default, rename = "inboundDetour")]
    pub inbound_detours: Vec<InboundDetourConfig>,

    #[serde(default, rename = "outboundDetour")]
    pub outbound_detours: Vec<OutboundDetourConfig>,

    #[serde(default)]
    pub dns: Option<DnsConfig>,
}

impl PointConfig {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: PointConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.normalize()?;
        Ok(config)
    }

    /// Validate and fill in the guaranteed defaults.
    fn normalize(&mut self) -> Result<()> {
        if let Some(listen) = &self.inbound.listen {
            if listen.is_domain() {
                return Err(Error::Config(format!(
                    "unable to listen on domain address: {}",
                    listen
                )));
            }
        }
        if let Some(addr) = &self.outbound.send_through {
            if addr.is_domain() {
                return Err(Error::Config(format!("unable to send through: {}", addr)));
            }
        }
        for detour in &mut self.inbound_detours {
            if let Some(listen) = &detour.listen {
                if listen.is_domain() {
                    return Err(Error::Config(format!(
                        "unable to listen on domain address: {}",
                        listen
                    )));
                }
            }
            detour.allocation.normalize();
        }
        for detour in &self.outbound_detours {
            if let Some(addr) = &detour.send_through {
                if addr.is_domain() {
                    return Err(Error::Config(format!("unable to send through: {}", addr)));
                }
            }
        }
        if self.dns.is_none() {
            self.dns = Some(DnsConfig::default());
        }
        Ok(())
    }

    /// Effective port of the main inbound.
    pub fn effective_port(&self) -> Port {
        if self.inbound.port != 0 {
            self.inbound.port
        } else {
            self.port
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Error log file path
    pub error: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            error: None,
        }
    }
}

/// Main inbound configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConnectionConfig {
    #[serde(default)]
    pub port: Port,

    /// Listen address; any-IP when absent. Domain addresses are invalid.
    pub listen: Option<Address>,

    pub protocol: String,

    #[serde(default, rename = "streamSettings")]
    pub stream_settings: StreamSettings,

    /// Protocol-specific settings, decoded by the handler factory
    #[serde(default)]
    pub settings: serde_json::Value,

    #[serde(default, rename = "allowPassive")]
    pub allow_passive: bool,
}

impl InboundConnectionConfig {
    pub fn listen_on(&self) -> Address {
        self.listen.clone().unwrap_or_else(Address::any)
    }
}

/// Main outbound configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConnectionConfig {
    pub protocol: String,

    #[serde(rename = "sendThrough")]
    pub send_through: Option<Address>,

    #[serde(default, rename = "streamSettings")]
    pub stream_settings: StreamSettings,

    #[serde(default)]
    pub settings: serde_json::Value,
}

/// A range of ports, inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRange {
    Single(Port),
    Range { from: Port, to: Port },
}

impl PortRange {
    pub fn from_port(&self) -> Port {
        match self {
            PortRange::Single(port) => *port,
            PortRange::Range { from, .. } => *from,
        }
    }

    pub fn to_port(&self) -> Port {
        match self {
            PortRange::Single(port) => *port,
            PortRange::Range { to, .. } => *to,
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = Port> {
        self.from_port()..=self.to_port()
    }

    pub fn len(&self) -> usize {
        (self.to_port() as usize + 1).saturating_sub(self.from_port() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How an inbound detour allocates listeners across its port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Bind every port in the range at startup
    #[default]
    Always,
    /// Re-allocate a few random ports periodically
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default)]
    pub strategy: AllocationStrategy,
    /// Listeners kept open at once (random strategy); 0 means default
    #[serde(default)]
    pub concurrency: u32,
    /// Minutes between re-allocations; 0 means default
    #[serde(default, rename = "refresh")]
    pub refresh: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        let mut config = Self {
            strategy: AllocationStrategy::Always,
            concurrency: 0,
            refresh: 0,
        };
        config.normalize();
        config
    }
}

impl AllocationConfig {
    fn normalize(&mut self) {
        if self.strategy == AllocationStrategy::Random {
            if self.refresh == 0 {
                self.refresh = 5;
            }
            if self.concurrency == 0 {
                self.concurrency = 3;
            }
        }
        if self.refresh == 0 {
            self.refresh = DEFAULT_REFRESH_MINUTES;
        }
    }
}

/// A secondary inbound, listening on a port range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundDetourConfig {
    pub protocol: String,

    #[serde(rename = "port")]
    pub port_range: PortRange,

    pub listen: Option<Address>,

    #[serde(default)]
    pub settings: serde_json::Value,

    #[serde(default)]
    pub tag: String,

    #[serde(default, rename = "allocate")]
    pub allocation: AllocationConfig,

    #[serde(default, rename = "streamSettings")]
    pub stream_settings: StreamSettings,

    #[serde(default, rename = "allowPassive")]
    pub allow_passive: bool,
}

impl InboundDetourConfig {
    pub fn listen_on(&self) -> Address {
        self.listen.clone().unwrap_or_else(Address::any)
    }
}

/// A secondary outbound, reachable by tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundDetourConfig {
    pub protocol: String,

    pub tag: String,

    #[serde(rename = "sendThrough")]
    pub send_through: Option<Address>,

    #[serde(default, rename = "streamSettings")]
    pub stream_settings: StreamSettings,

    #[serde(default)]
    pub settings: serde_json::Value,
}

/// One DNS nameserver endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServerConfig {
    pub network: Network,
    pub address: Address,
    pub port: Port,
}

/// DNS configuration consumed by the resolver outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(rename = "servers")]
    pub name_servers: Vec<NameServerConfig>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        // single nameserver, UDP 127.0.0.1:53, reached via the domain
        // name "localhost"
        Self {
            name_servers: vec![NameServerConfig {
                network: Network::Udp,
                address: Address::domain("localhost"),
                port: 53,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = PointConfig::from_json(
            r#"{
                "port": 1080,
                "inbound": {"protocol": "http"},
                "outbound": {"protocol": "freedom"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.effective_port(), 1080);
        assert_eq!(config.inbound.listen_on(), Address::any());
        assert!(config.dns.is_some());
    }

    #[test]
    fn test_inbound_port_overrides_top_level() {
        let config = PointConfig::from_json(
            r#"{
                "port": 1080,
                "inbound": {"port": 2080, "protocol": "http"},
                "outbound": {"protocol": "freedom"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.effective_port(), 2080);
    }

    #[test]
    fn test_random_allocation_defaults() {
        let config = PointConfig::from_json(
            r#"{
                "inbound": {"port": 80, "protocol": "http"},
                "outbound": {"protocol": "freedom"},
                "inboundDetour": [{
                    "protocol": "http",
                    "port": {"from": 2000, "to": 2010},
                    "allocate": {"strategy": "random"}
                }]
            }"#,
        )
        .unwrap();
        let allocation = &config.inbound_detours[0].allocation;
        assert_eq!(allocation.concurrency, 3);
        assert_eq!(allocation.refresh, 5);
    }

    #[test]
    fn test_always_allocation_refresh_default() {
        let allocation = AllocationConfig::default();
        assert_eq!(allocation.strategy, AllocationStrategy::Always);
        assert_eq!(allocation.refresh, DEFAULT_REFRESH_MINUTES);
    }

    #[test]
    fn test_unknown_allocation_strategy_is_rejected() {
        let result = PointConfig::from_json(
            r#"{
                "inbound": {"port": 80, "protocol": "http"},
                "outbound": {"protocol": "freedom"},
                "inboundDetour": [{
                    "protocol": "http",
                    "port": 2000,
                    "allocate": {"strategy": "round-robin"}
                }]
            }"#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_dns_default_nameserver() {
        let config = PointConfig::from_json(
            r#"{
                "inbound": {"port": 80, "protocol": "http"},
                "outbound": {"protocol": "freedom"}
            }"#,
        )
        .unwrap();
        let dns = config.dns.unwrap();
        assert_eq!(dns.name_servers.len(), 1);
        let ns = &dns.name_servers[0];
        assert_eq!(ns.network, Network::Udp);
        assert_eq!(ns.address, Address::domain("localhost"));
        assert_eq!(ns.port, 53);
    }

    #[test]
    fn test_domain_listen_address_is_rejected() {
        let result = PointConfig::from_json(
            r#"{
                "inbound": {"port": 80, "protocol": "http", "listen": "proxy.example.com"},
                "outbound": {"protocol": "freedom"}
            }"#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_port_range_forms() {
        let single: PortRange = serde_json::from_str("8080").unwrap();
        assert_eq!(single.from_port(), 8080);
        assert_eq!(single.to_port(), 8080);

        let range: PortRange = serde_json::from_str(r#"{"from": 10, "to": 20}"#).unwrap();
        assert_eq!(range.len(), 11);
        assert_eq!(range.ports().count(), 11);
    }
}
