//! Packet dispatcher: turns a session into a Ray bound to an outbound.
//!
//! Selection rule: ask the router for a tag if one is configured, look the
//! handler up by tag, fall back to the default outbound. A missing default
//! is a configuration error caught at startup, never here. The dispatcher
//! only wires the Ray and hands off; it never blocks on network I/O.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::SessionInfo;
use crate::proxy::{InboundHandlerMeta, OutboundHandler};
use crate::ray::{new_ray, InboundRay};

use super::proxyman::OutboundManager;
use super::router::Router;
use super::space::Application;

/// Application id of the dispatcher inside a Space.
pub const DISPATCHER_APP_ID: &str = "dispatcher";

/// Produces a Ray serviced by an outbound handler on its far side.
pub trait PacketDispatcher: Send + Sync {
    fn dispatch_to_outbound(&self, meta: &InboundHandlerMeta, session: SessionInfo) -> InboundRay;
}

pub struct DefaultDispatcher {
    outbounds: Arc<OutboundManager>,
    router: Option<Arc<dyn Router>>,
}

impl DefaultDispatcher {
    pub fn new(outbounds: Arc<OutboundManager>, router: Option<Arc<dyn Router>>) -> Self {
        Self { outbounds, router }
    }

    fn select_handler(&self, session: &SessionInfo) -> Option<Arc<dyn OutboundHandler>> {
        if let Some(router) = &self.router {
            if let Some(tag) = router.pick_route(session) {
                if let Some(handler) = self.outbounds.handler(&tag) {
                    debug!("routing {} via [{}]", session.destination, tag);
                    return Some(handler);
                }
                warn!("no outbound handler with tag [{}], using default", tag);
            }
        }
        self.outbounds.default_handler()
    }
}

impl PacketDispatcher for DefaultDispatcher {
    fn dispatch_to_outbound(&self, meta: &InboundHandlerMeta, session: SessionInfo) -> InboundRay {
        let Some(handler) = self.select_handler(&session) else {
            // Startup validation guarantees a default outbound; reaching
            // this is a wiring bug, surfaced as a dead Ray.
            warn!(
                "[{}] no outbound handler for {}, closing session",
                meta.tag, session.destination
            );
            return InboundRay::closed();
        };

        let (inbound_ray, outbound_ray) = new_ray();
        tokio::spawn(async move {
            handler.dispatch(session, outbound_ray).await;
        });
        inbound_ray
    }
}

impl Application for DefaultDispatcher {}
