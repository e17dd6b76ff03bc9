//! Built-in transport-level handlers
//!
//! Registered at node startup. Marketplace-level handlers (orders, disputes,
//! chat persistence) are registered by the host application through
//! `Dispatcher::register_handler`; what lives here is the plumbing the
//! messaging layer itself needs: liveness, follow state, mailbox receipts
//! and relayed-frame unwrapping.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::data;
use crate::network::banlist::BanList;
use crate::network::dispatcher::{Dispatcher, Handler, HandlerError};
use crate::network::overlay::Overlay;
use crate::protocol::types::{MessageEnvelope, MessageType, NodeId, TypedMessage};
use crate::security::{envelope, Identity};

/// Answers pings by echoing the message back.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(
        &self,
        sender: NodeId,
        message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, HandlerError> {
        debug!(peer = %hex::encode(&sender.as_bytes()[..8]), "received ping");
        Ok(Some(TypedMessage::new(
            MessageType::Ping,
            message.payload.clone(),
        )))
    }
}

/// Records the sender as a follower.
pub struct FollowHandler {
    db: Arc<Mutex<Connection>>,
}

impl FollowHandler {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Handler for FollowHandler {
    async fn handle(
        &self,
        sender: NodeId,
        _message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, HandlerError> {
        debug!(peer = %hex::encode(&sender.as_bytes()[..8]), "received follow");
        let db = self.db.lock().await;
        data::add_follower(&db, &sender)?;
        Ok(None)
    }
}

/// Removes the sender from the follower set.
pub struct UnfollowHandler {
    db: Arc<Mutex<Connection>>,
}

impl UnfollowHandler {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Handler for UnfollowHandler {
    async fn handle(
        &self,
        sender: NodeId,
        _message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, HandlerError> {
        debug!(peer = %hex::encode(&sender.as_bytes()[..8]), "received unfollow");
        let db = self.db.lock().await;
        data::remove_follower(&db, &sender)?;
        Ok(None)
    }
}

/// Handles mailbox receipts: the recipient confirms it fetched a pointer, so
/// the pointer can stop being republished.
pub struct OfflineAckHandler {
    db: Arc<Mutex<Connection>>,
    overlay: Arc<dyn Overlay>,
}

impl OfflineAckHandler {
    pub fn new(db: Arc<Mutex<Connection>>, overlay: Arc<dyn Overlay>) -> Self {
        Self { db, overlay }
    }
}

#[async_trait]
impl Handler for OfflineAckHandler {
    async fn handle(
        &self,
        sender: NodeId,
        message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, HandlerError> {
        let content_address = String::from_utf8(message.payload.clone())
            .map_err(|e| format!("ack payload is not utf-8: {}", e))?;

        let pointer = {
            let db = self.db.lock().await;
            data::get_pointer(&db, &content_address)?
        };

        let Some(pointer) = pointer else {
            debug!(address = %content_address, "ack for unknown pointer, ignoring");
            return Ok(None);
        };

        // Only the intended recipient may cancel a pointer.
        if pointer.cancel_id != Some(sender) {
            warn!(
                address = %content_address,
                peer = %hex::encode(&sender.as_bytes()[..8]),
                "ack sender doesn't match pointer cancel id - ignoring"
            );
            return Ok(None);
        }

        {
            let db = self.db.lock().await;
            data::delete_pointer(&db, &content_address)?;
        }
        if let Err(e) = self.overlay.delete_pointer(&content_address).await {
            debug!(address = %content_address, error = %e, "overlay pointer delete failed");
        }
        debug!(address = %content_address, "pointer acknowledged and deleted");
        Ok(None)
    }
}

/// Unwraps frames delivered through a relay server.
///
/// The frame carries a sealed envelope for the local identity; unseal it,
/// verify the inner sender, and re-dispatch the inner message. Malformed or
/// undecryptable frames are dropped silently: relays forward by a hashed
/// subscription key, so frames for other identities are expected here.
pub struct OfflineRelayHandler {
    identity: Arc<Identity>,
    dispatcher: Weak<Dispatcher>,
    bans: Arc<BanList>,
}

impl OfflineRelayHandler {
    pub fn new(identity: Arc<Identity>, dispatcher: Weak<Dispatcher>, bans: Arc<BanList>) -> Self {
        Self {
            identity,
            dispatcher,
            bans,
        }
    }

    /// Extract the sealed ciphertext from a relay frame: JSON with a base64
    /// `message` field, a bare base64 body, or raw envelope bytes.
    fn ciphertext_from_frame(frame: &[u8]) -> Vec<u8> {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(frame) {
            if let Some(encoded) = value.get("message").and_then(|m| m.as_str()) {
                if let Ok(decoded) = BASE64.decode(encoded) {
                    return decoded;
                }
            }
        }
        if let Ok(text) = std::str::from_utf8(frame) {
            if let Ok(decoded) = BASE64.decode(text.trim()) {
                return decoded;
            }
        }
        frame.to_vec()
    }
}

#[async_trait]
impl Handler for OfflineRelayHandler {
    async fn handle(
        &self,
        _sender: NodeId,
        message: &TypedMessage,
    ) -> Result<Option<TypedMessage>, HandlerError> {
        let ciphertext = Self::ciphertext_from_frame(&message.payload);

        let plaintext = match envelope::unseal(self.identity.private_key(), &ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(error = %e, "relayed frame not unsealable, dropping");
                return Ok(None);
            }
        };

        let inner = match MessageEnvelope::from_bytes(&plaintext) {
            Ok(inner) => inner,
            Err(e) => {
                debug!(error = %e, "relayed plaintext not an envelope, dropping");
                return Ok(None);
            }
        };

        let peer = match inner.verify() {
            Ok(peer) => peer,
            Err(e) => {
                debug!(error = %e, "relayed envelope signature invalid, dropping");
                return Ok(None);
            }
        };

        if self.bans.is_banned(&peer) {
            warn!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                "dropping relayed message from banned peer"
            );
            return Ok(None);
        }

        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return Ok(None);
        };
        match dispatcher.handle_inbound(peer, &inner.message).await {
            Ok(Some(_reply)) => {
                // No return path through a relay frame.
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    "discarding reply to relayed message"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    error = %e,
                    "relayed message handler failed"
                );
            }
        }
        Ok(None)
    }
}
