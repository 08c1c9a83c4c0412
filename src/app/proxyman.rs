//! Outbound handler manager: the default handler plus tagged detours.
//!
//! Written once while the Point is constructed; read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::proxy::OutboundHandler;

use super::space::Application;

/// Application id of the outbound manager inside a Space.
pub const OUTBOUND_MANAGER_APP_ID: &str = "proxyman.outbound";

#[derive(Default)]
pub struct OutboundManager {
    default_handler: RwLock<Option<Arc<dyn OutboundHandler>>>,
    handlers: RwLock<HashMap<String, Arc<dyn OutboundHandler>>>,
}

impl OutboundManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_handler(&self, handler: Arc<dyn OutboundHandler>) {
        *self.default_handler.write() = Some(handler);
    }

    pub fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        self.default_handler.read().clone()
    }

    pub fn set_handler(&self, tag: impl Into<String>, handler: Arc<dyn OutboundHandler>) {
        self.handlers.write().insert(tag.into(), handler);
    }

    pub fn handler(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        self.handlers.read().get(tag).cloned()
    }
}

impl Application for OutboundManager {}
