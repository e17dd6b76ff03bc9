//! Relay channel manager
//!
//! Server-mediated websocket fallback for nodes that cannot participate in
//! the overlay directly. Each configured relay gets its own persistent
//! socket with an unbounded reconnect loop; inbound frames are wrapped as
//! relay-typed messages and fed to the dispatcher, which unseals and
//! re-dispatches them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base58::ToBase58;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::network::dispatcher::Dispatcher;
use crate::protocol::types::{MessageType, NodeId, TypedMessage};

/// Configuration for the relay manager.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay server websocket URLs.
    pub servers: Vec<String>,
    /// Delay before reconnecting after a failure (default: 10 seconds)
    pub reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            reconnect_delay: Duration::from_secs(10),
        }
    }
}

/// Derive the relay subscription key for an identity.
///
/// SHA-256 of the identity, truncated to its first 8 bytes and hashed again,
/// so the relay can route to subscribers without learning full identities.
pub fn subscription_key(node_id: &NodeId) -> String {
    let digest = Sha256::digest(node_id.as_bytes());
    let rehashed: [u8; 32] = Sha256::digest(&digest[..8]).into();
    rehashed.to_base58()
}

fn subscribe_frame(node_id: &NodeId) -> String {
    serde_json::json!({
        "userID": node_id.to_string(),
        "subscriptionKey": subscription_key(node_id),
    })
    .to_string()
}

fn is_subscribe_confirmation(frame: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(frame)
        .ok()
        .and_then(|v| v.get("subscribe").and_then(|s| s.as_bool()))
        == Some(true)
}

/// Always-reconnect background channel to one or more relay servers.
pub struct RelayManager {
    local_id: NodeId,
    dispatcher: Arc<Dispatcher>,
    config: RelayConfig,
    running: Arc<RwLock<bool>>,
    /// Write halves of the open relay sockets, keyed by server URL.
    sinks: Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>,
}

impl RelayManager {
    pub fn new(
        local_id: NodeId,
        dispatcher: Arc<Dispatcher>,
        config: RelayConfig,
        running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            local_id,
            dispatcher,
            config,
            running,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn one connection loop per configured relay server.
    pub fn connect_all(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.config
            .servers
            .iter()
            .cloned()
            .map(|url| {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.run_relay_loop(url).await;
                })
            })
            .collect()
    }

    async fn run_relay_loop(self: Arc<Self>, url: String) {
        loop {
            if !*self.running.read().await {
                break;
            }

            match connect_async(url.as_str()).await {
                Ok((socket, _response)) => {
                    info!(relay = %url, "connected to relay");
                    self.run_session(&url, socket).await;
                    self.sinks.lock().await.remove(&url);
                }
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay connect failed");
                }
            }

            if !*self.running.read().await {
                break;
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
        debug!(relay = %url, "relay loop stopped");
    }

    async fn run_session(
        &self,
        url: &str,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = socket.split();

        if let Err(e) = sink
            .send(WsMessage::Text(subscribe_frame(&self.local_id)))
            .await
        {
            warn!(relay = %url, error = %e, "failed to send subscribe frame");
            return;
        }

        // Outbound writes go through a channel so senders never hold the
        // socket across await points.
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.sinks.lock().await.insert(url.to_string(), tx);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.handle_relay_frame(url, text.into_bytes()).await,
                Ok(WsMessage::Binary(data)) => self.handle_relay_frame(url, data).await,
                Ok(WsMessage::Close(_)) => {
                    debug!(relay = %url, "relay closed the session");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay read failed");
                    break;
                }
            }
        }

        writer.abort();
    }

    /// Handle one frame from a relay session.
    ///
    /// The subscribe confirmation is consumed here; anything else is an
    /// opaque relayed ciphertext for the local identity.
    async fn handle_relay_frame(&self, url: &str, frame: Vec<u8>) {
        if is_subscribe_confirmation(&frame) {
            info!(relay = %url, "relay subscription confirmed");
            return;
        }

        let message = TypedMessage::new(MessageType::OfflineRelay, frame);
        if let Err(e) = self.dispatcher.handle_inbound(self.local_id, &message).await {
            debug!(relay = %url, error = %e, "relayed message dispatch failed");
        }
    }

    /// Send an outbound sealed ciphertext to all open relay sockets.
    ///
    /// Having no open socket is logged, not an error: relays are a
    /// best-effort side channel.
    pub async fn send_relay_message(&self, ciphertext: &[u8], recipient: &NodeId) {
        let frame = serde_json::json!({
            "recipient": recipient.to_string(),
            "message": BASE64.encode(ciphertext),
        })
        .to_string();

        let sinks = self.sinks.lock().await;
        if sinks.is_empty() {
            debug!(
                recipient = %hex::encode(&recipient.as_bytes()[..8]),
                "no open relay connections, dropping relay message"
            );
            return;
        }
        for (url, tx) in sinks.iter() {
            if tx.send(WsMessage::Text(frame.clone())).is_err() {
                debug!(relay = %url, "relay writer gone, message dropped");
            }
        }
    }

    /// Drop all open relay sockets. The connection loops exit once the
    /// shared running flag is cleared.
    pub async fn stop(&self) {
        self.sinks.lock().await.clear();
    }
}
