//! Session context passed from an inbound handler to the dispatcher.
//!
//! The dispatcher and router ONLY depend on this context, never on IO.

use super::Destination;

/// Context of one proxied session. Created per client connection and
/// dropped when the session ends.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Where the client connected from
    pub source: Destination,
    /// Where the client wants to go
    pub destination: Destination,
    /// Tag of the inbound handler that accepted the connection
    pub inbound_tag: Option<String>,
}

impl SessionInfo {
    pub fn new(source: Destination, destination: Destination) -> Self {
        Self {
            source,
            destination,
            inbound_tag: None,
        }
    }

    /// Builder: set the inbound tag
    pub fn with_inbound_tag(mut self, tag: impl Into<String>) -> Self {
        self.inbound_tag = Some(tag.into());
        self
    }
}
