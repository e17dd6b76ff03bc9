//! Public interface of the messaging node
//!
//! - `core.rs`: `Node` struct, start/stop, send paths
//! - `config.rs`: `NodeConfig` builder
//! - `error.rs`: `NodeError`
//! - `types.rs`: wire types (messages, envelopes, pointers)
//!
//! # Example
//!
//! ```ignore
//! use bazaar_core::{Node, NodeConfig};
//!
//! let node = Node::start(NodeConfig::default(), overlay).await?;
//! node.register_handler(MessageType::Chat, chat_handler);
//! node.send(&peer, TypedMessage::new(MessageType::Chat, b"hi".to_vec())).await?;
//! node.stop().await;
//! ```

mod config;
pub(crate) mod core;
mod error;
pub mod types;

pub use config::NodeConfig;
pub use core::Node;
pub use error::NodeError;
pub use types::{
    pointer_prefix, MessageEnvelope, MessageType, NodeId, Pointer, PointerPurpose, TypedMessage,
    WireError, DEFAULT_POINTER_PREFIX_BITS,
};
