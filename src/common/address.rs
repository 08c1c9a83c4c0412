//! Address and destination types for network connections

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Network address representation: a literal IP or a domain name.
///
/// The port is carried separately in [`Destination`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// The any-IP address (0.0.0.0), the default listen address.
    pub fn any() -> Self {
        Address::Ipv4(Ipv4Addr::UNSPECIFIED)
    }

    /// Loopback address (127.0.0.1).
    pub fn localhost() -> Self {
        Address::Ipv4(Ipv4Addr::LOCALHOST)
    }

    pub fn domain(domain: impl Into<String>) -> Self {
        Address::Domain(domain.into())
    }

    /// Parse a host string: a literal IP yields an IP address, anything
    /// else is treated as a domain name.
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::from(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Ipv6(ip) => write!(f, "{}", ip),
            Address::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::Ipv4(ip),
            IpAddr::V6(ip) => Address::Ipv6(ip),
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        Address::parse(host)
    }
}

/// Network type of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Port number.
pub type Port = u16;

/// A fully qualified connection target: network, address, and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: Port,
}

impl Destination {
    pub fn tcp(address: Address, port: Port) -> Self {
        Self {
            network: Network::Tcp,
            address,
            port,
        }
    }

    pub fn udp(address: Address, port: Port) -> Self {
        Self {
            network: Network::Udp,
            address,
            port,
        }
    }

    /// Parse a `host:port` string into a TCP destination. IPv6 literals
    /// may be bracketed. A missing or invalid port yields `None`.
    pub fn parse_tcp(s: &str) -> Option<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(Destination::tcp(Address::from(addr.ip()), addr.port()));
        }
        let (host, port) = s.rsplit_once(':')?;
        let port: Port = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Some(Destination::tcp(Address::parse(host), port))
    }

    /// Resolve to a socket address without DNS. Domain destinations yield
    /// `None`.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        self.address.as_ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The `host:port` form used as a pooling and dialing key.
    pub fn net_addr(&self) -> String {
        match &self.address {
            Address::Ipv6(ip) => format!("[{}]:{}", ip, self.port),
            other => format!("{}:{}", other, self.port),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.net_addr())
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::tcp(Address::from(addr.ip()), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_host() {
        let dest = Destination::parse_tcp("10.0.0.1:443").unwrap();
        assert_eq!(dest.address, Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(dest.port, 443);
    }

    #[test]
    fn test_parse_domain_host() {
        let dest = Destination::parse_tcp("example.com:8080").unwrap();
        assert_eq!(dest.address, Address::domain("example.com"));
        assert_eq!(dest.port, 8080);
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let dest = Destination::parse_tcp("[::1]:80").unwrap();
        assert_eq!(dest.address, Address::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(dest.port, 80);
    }

    #[test]
    fn test_net_addr_round_trip() {
        for raw in ["1.2.3.4:80", "example.com:443", "[2001:db8::1]:53"] {
            let dest = Destination::parse_tcp(raw).unwrap();
            let reparsed = Destination::parse_tcp(&dest.net_addr()).unwrap();
            assert_eq!(dest, reparsed);
        }
    }

    #[test]
    fn test_missing_port_is_rejected() {
        assert!(Destination::parse_tcp("example.com").is_none());
    }
}
