//! Protocol dispatcher
//!
//! Pure routing from message type to a registered handler. All three inbound
//! paths (live streams, mailbox retrieval, relayed frames) converge here, so
//! each message-type handler is written once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::protocol::types::{MessageType, NodeId, TypedMessage};

/// Error type handlers may return; logged by the dispatch path, never fatal.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A message-type handler.
///
/// May have side effects and may return a reply message; `None` means
/// fire-and-forget.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        sender: NodeId,
        message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, HandlerError>;
}

/// Errors when dispatching an inbound message.
#[derive(Debug)]
pub enum DispatchError {
    /// The registered handler failed
    Handler(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Handler(e) => write!(f, "handler failed: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Routing table from message type to handler.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<MessageType, Arc<dyn Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a message type, replacing any existing one.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn Handler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(message_type, handler);
        }
    }

    /// Route an inbound message to its handler.
    ///
    /// A message type without a handler is dropped and logged, not an error:
    /// unknown types from newer peers must not crash older nodes.
    pub async fn handle_inbound(
        &self,
        sender: NodeId,
        message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, DispatchError> {
        let handler = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&message.message_type).cloned());

        let Some(handler) = handler else {
            debug!(
                peer = %hex::encode(&sender.as_bytes()[..8]),
                message_type = %message.message_type,
                "no handler registered, dropping message"
            );
            return Ok(None);
        };

        handler
            .handle(sender, message)
            .await
            .map_err(|e| DispatchError::Handler(e.to_string()))
    }
}
