//! Core types shared by every layer: addresses, session context, streams.

pub mod address;
pub mod retry;
pub mod session;
pub mod stream;

pub use address::{Address, Destination, Network, Port};
pub use session::SessionInfo;
pub use stream::{AsyncReadWrite, IntoStream, Stream};

pub use crate::error::Result;
