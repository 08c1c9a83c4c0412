//! KCP transport: a reliable, ordered, connection-oriented byte stream
//! over UDP datagrams.
//!
//! Every datagram passes through an authenticator chain before
//! transmission and the inverse on receipt. The conversation id is a
//! 32-bit integer assigned by the caller (the dialer picks a random one;
//! the listener learns it from the first datagram).

pub mod authenticator;
pub mod connection;
pub mod hub;
mod segment;

pub use authenticator::{Authenticator, AuthenticatorChain, SimpleAuthenticator, SrtpObfuscator};
pub use connection::{KcpConnection, State};
pub use hub::KcpTransportFactory;

use serde::{Deserialize, Serialize};

/// KCP tunables: datagram size, windows, and the update tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KcpSettings {
    /// Maximum transmission unit of a sealed datagram, bytes
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Update tick interval, milliseconds
    #[serde(default = "default_tti")]
    pub tti: u64,
    /// Send window, segments
    #[serde(default = "default_window")]
    pub snd_wnd: u16,
    /// Receive window, segments
    #[serde(default = "default_window")]
    pub rcv_wnd: u16,
}

fn default_mtu() -> usize {
    1350
}

fn default_tti() -> u64 {
    20
}

fn default_window() -> u16 {
    128
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            tti: default_tti(),
            snd_wnd: default_window(),
            rcv_wnd: default_window(),
        }
    }
}

impl KcpSettings {
    /// Payload capacity of one PUSH segment after the segment header and
    /// the authenticator overhead.
    pub fn mss(&self, auth_overhead: usize) -> usize {
        self.mtu
            .saturating_sub(segment::HEADER_SIZE + auth_overhead)
            .max(1)
    }
}

/// The default authenticator chain: integrity check sealed first, then
/// SRTP-like obfuscation outermost.
pub fn default_authenticator_chain() -> AuthenticatorChain {
    AuthenticatorChain::new(vec![
        Box::new(SimpleAuthenticator),
        Box::new(SrtpObfuscator::new()),
    ])
}
