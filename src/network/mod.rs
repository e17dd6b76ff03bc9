//! Transport layer
//!
//! - `overlay`: the external overlay-network boundary (traits)
//! - `wire`: length-delimited framing over raw byte transports
//! - `messenger`: direct per-peer request/response messaging
//! - `dispatcher`: message-type routing shared by all inbound paths
//! - `banlist`: peers whose traffic is dropped
//! - `relay`: websocket relay fallback channel

pub mod banlist;
pub mod dispatcher;
pub mod messenger;
pub mod overlay;
pub mod relay;
pub mod wire;

pub use banlist::BanList;
pub use dispatcher::{DispatchError, Dispatcher, Handler, HandlerError};
pub use messenger::{Messenger, MessengerConfig, MessengerError};
pub use overlay::{MessageStream, Overlay, OverlayError, StreamError};
pub use relay::{RelayConfig, RelayManager};
pub use wire::FramedStream;
