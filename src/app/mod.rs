//! Application layer: the Space service locator, the packet dispatcher,
//! the outbound manager, and the router seam.

pub mod dispatcher;
pub mod proxyman;
pub mod router;
pub mod space;

pub use dispatcher::{DefaultDispatcher, PacketDispatcher, DISPATCHER_APP_ID};
pub use proxyman::{OutboundManager, OUTBOUND_MANAGER_APP_ID};
pub use router::{Router, StaticRouter};
pub use space::{Application, Space};

/// Application id of the transport registry inside a Space.
pub const TRANSPORT_APP_ID: &str = "transport";
