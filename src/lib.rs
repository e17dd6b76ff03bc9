//! Bazaar Core
//!
//! Messaging transport for a peer-to-peer marketplace node: typed, versioned
//! protocol messages between peers that may or may not be online at the same
//! time.
//!
//! This crate provides:
//! - A hybrid-encryption envelope codec for messages addressed to offline
//!   peers
//! - A direct messenger multiplexing request/response pairs over reusable
//!   streams
//! - A protocol dispatcher shared by every inbound path
//! - A mailbox retriever that discovers, fetches, unseals and acknowledges
//!   offline messages
//! - A pointer republisher keeping mailbox entries alive in the overlay
//! - A websocket relay fallback for constrained networks
//!
//! The overlay network itself (identity transport, DHT, content-addressed
//! storage) is an external collaborator behind the [`network::Overlay`]
//! trait; `testing::TestNetwork` provides an in-memory implementation.
//!
//! # Module Structure
//!
//! - `protocol/`: Public interface (Node, config, errors, wire types)
//! - `security/`: Cryptography (envelope codec, RSA identity)
//! - `network/`: Transport (messenger, dispatcher, relay, ban list, framing)
//! - `tasks/`: Background loops (mailbox retrieval, pointer republish)
//! - `handlers/`: Built-in transport-level message handlers
//! - `data/`: SQLite persistence (seen entries, pointers, followers)
//! - `testing/`: In-memory overlay network for tests
//!
//! # Quick Start
//!
//! ```ignore
//! use bazaar_core::{Node, NodeConfig, MessageType, TypedMessage};
//!
//! // Start the node over a host-provided overlay implementation
//! let node = Node::start(NodeConfig::default(), overlay).await?;
//!
//! // Wait for the first mailbox pass before dependent startup steps
//! node.wait_until_idle().await;
//!
//! // Talk to a peer, online or not
//! node.send_message(&peer, &peer_key, TypedMessage::new(
//!     MessageType::Chat,
//!     b"hello".to_vec(),
//! )).await?;
//! ```

// Public interface
pub mod protocol;

// Infrastructure modules
pub mod data;
pub mod handlers;
pub mod network;
pub mod security;
pub mod tasks;
pub mod testing;

// Re-export main API types for convenience
pub use protocol::{
    MessageEnvelope, MessageType, Node, NodeConfig, NodeError, NodeId, Pointer, PointerPurpose,
    TypedMessage, WireError,
};

pub use network::{
    BanList, DispatchError, Dispatcher, FramedStream, Handler, HandlerError, MessageStream,
    Messenger, MessengerError, Overlay, OverlayError, RelayManager, StreamError,
};

pub use security::{EnvelopeError, Identity};
