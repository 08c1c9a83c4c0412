//! Error types for raynet

use thiserror::Error;

/// Main error type for raynet.
///
/// Variants map to how failures are handled: `Config` is fatal at
/// construction time, `Io`/`Transport` are transient and drop the affected
/// session, `Protocol` terminates the session with a response when
/// possible, `ListenerClosed`/`PipeClosed` are expected during shutdown.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unsupported stream type")]
    UnsupportedStreamType,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Listener is closed")]
    ListenerClosed,

    #[error("Pipe is closed")]
    PipeClosed,

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Whether this failure is expected during shutdown and should not be
    /// logged as an error.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Error::ListenerClosed | Error::PipeClosed)
    }
}

/// Result type alias for raynet
pub type Result<T> = std::result::Result<T, Error>;
