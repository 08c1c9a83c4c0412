//! Router interface consumed by the dispatcher.
//!
//! Routing policy itself lives outside the core; the dispatcher only asks
//! for an outbound tag per session.

use crate::common::SessionInfo;

use super::space::Application;

/// Picks an outbound tag for a session, or `None` to use the default
/// outbound.
pub trait Router: Send + Sync {
    fn pick_route(&self, session: &SessionInfo) -> Option<String>;
}

/// Router that always picks the same tag. Used for detour wiring and in
/// tests.
pub struct StaticRouter {
    tag: String,
}

impl StaticRouter {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Router for StaticRouter {
    fn pick_route(&self, _session: &SessionInfo) -> Option<String> {
        Some(self.tag.clone())
    }
}

impl Application for StaticRouter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Destination};

    #[test]
    fn test_static_router_picks_its_tag() {
        let router = StaticRouter::new("proxy-out");
        let session = SessionInfo::new(
            Destination::tcp(Address::localhost(), 1000),
            Destination::tcp(Address::domain("example.com"), 80),
        );
        assert_eq!(router.pick_route(&session).as_deref(), Some("proxy-out"));
    }
}
