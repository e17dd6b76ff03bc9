//! Main node implementation
//!
//! The `Node` struct wires the messaging components together: database,
//! identity, ban list, dispatcher, direct messenger, mailbox retriever,
//! pointer republisher and relay manager. Implementation of the individual
//! pieces lives in `network/`, `tasks/`, `handlers/` and `data/`.

use std::sync::Arc;

use rsa::RsaPublicKey;
use rusqlite::Connection;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::data;
use crate::handlers::{
    FollowHandler, OfflineAckHandler, OfflineRelayHandler, PingHandler, UnfollowHandler,
};
use crate::network::banlist::BanList;
use crate::network::dispatcher::{Dispatcher, Handler};
use crate::network::messenger::{Messenger, MessengerError};
use crate::network::overlay::Overlay;
use crate::network::relay::RelayManager;
use crate::protocol::config::NodeConfig;
use crate::protocol::error::NodeError;
use crate::protocol::types::{
    pointer_prefix, MessageEnvelope, MessageType, NodeId, Pointer, PointerPurpose, TypedMessage,
};
use crate::security::{envelope, Identity};
use crate::tasks::republisher::PointerRepublisher;
use crate::tasks::retriever::MessageRetriever;

/// A peer-to-peer marketplace messaging node.
///
/// This is the main entry point: start it with a config and an overlay
/// implementation, register marketplace handlers, and send messages. The
/// offline mailbox, pointer upkeep and relay fallback run in the background
/// until [`Node::stop`].
pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) identity: Arc<Identity>,
    pub(crate) db: Arc<Mutex<Connection>>,
    pub(crate) overlay: Arc<dyn Overlay>,
    pub(crate) bans: Arc<BanList>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) messenger: Arc<Messenger>,
    pub(crate) retriever: Arc<MessageRetriever>,
    pub(crate) republisher: Arc<PointerRepublisher>,
    pub(crate) relay: Arc<RelayManager>,
    pub(crate) running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Node {
    /// Start the node: open the database, load or create the identity, wire
    /// the components, register the built-in handlers and spawn the
    /// background loops.
    pub async fn start(config: NodeConfig, overlay: Arc<dyn Overlay>) -> Result<Self, NodeError> {
        let conn = data::open_database(config.db_path.as_deref())
            .map_err(|e| NodeError::StartFailed(format!("database open failed: {}", e)))?;

        let identity = match config.identity.clone() {
            Some(identity) => identity,
            None => data::get_or_create_identity(&conn)
                .map_err(|e| NodeError::StartFailed(format!("identity load failed: {}", e)))?,
        };
        let identity = Arc::new(identity);
        info!(node_id = %identity.node_id(), "loaded node identity");

        let db = Arc::new(Mutex::new(conn));
        let running = Arc::new(RwLock::new(true));
        let bans = Arc::new(BanList::default());
        let dispatcher = Arc::new(Dispatcher::new());

        let messenger = Arc::new(Messenger::new(
            overlay.clone(),
            dispatcher.clone(),
            bans.clone(),
            config.messenger_config(),
        ));

        let retriever = Arc::new(MessageRetriever::new(
            db.clone(),
            overlay.clone(),
            dispatcher.clone(),
            messenger.clone(),
            bans.clone(),
            identity.clone(),
            config.retriever_config(),
            running.clone(),
        ));

        let republisher = Arc::new(PointerRepublisher::new(
            db.clone(),
            overlay.clone(),
            config.republisher_config(),
            running.clone(),
        ));

        let relay = Arc::new(RelayManager::new(
            identity.node_id(),
            dispatcher.clone(),
            config.relay_config(),
            running.clone(),
        ));

        let node = Self {
            config,
            identity,
            db,
            overlay,
            bans,
            dispatcher,
            messenger,
            retriever,
            republisher,
            relay,
            running,
            tasks: Mutex::new(Vec::new()),
        };

        node.register_builtin_handlers();
        node.start_background_tasks().await;
        Ok(node)
    }

    fn register_builtin_handlers(&self) {
        self.dispatcher
            .register_handler(MessageType::Ping, Arc::new(PingHandler));
        self.dispatcher.register_handler(
            MessageType::Follow,
            Arc::new(FollowHandler::new(self.db.clone())),
        );
        self.dispatcher.register_handler(
            MessageType::Unfollow,
            Arc::new(UnfollowHandler::new(self.db.clone())),
        );
        self.dispatcher.register_handler(
            MessageType::OfflineAck,
            Arc::new(OfflineAckHandler::new(
                self.db.clone(),
                self.overlay.clone(),
            )),
        );
        self.dispatcher.register_handler(
            MessageType::OfflineRelay,
            Arc::new(OfflineRelayHandler::new(
                self.identity.clone(),
                Arc::downgrade(&self.dispatcher),
                self.bans.clone(),
            )),
        );
    }

    async fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock().await;

        // 1. Inbound stream acceptor: each live stream gets its own task.
        let overlay = self.overlay.clone();
        let messenger = self.messenger.clone();
        let running = self.running.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }
                match overlay.accept().await {
                    Some((peer, stream)) => {
                        let messenger = messenger.clone();
                        tokio::spawn(async move {
                            messenger.handle_inbound_stream(peer, stream).await;
                        });
                    }
                    None => break,
                }
            }
            debug!("inbound accept loop stopped");
        }));

        // 2. Mailbox retrieval loop.
        let retriever = self.retriever.clone();
        tasks.push(tokio::spawn(async move {
            retriever.run().await;
        }));

        // 3. Pointer republish loop.
        let republisher = self.republisher.clone();
        tasks.push(tokio::spawn(async move {
            republisher.run().await;
        }));

        // 4. Relay connection loops, one per configured server.
        tasks.extend(self.relay.clone().connect_all());

        info!("background tasks started");
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Register a handler for a message type. Handlers serve all three
    /// inbound paths: live streams, mailbox retrieval and relayed frames.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn Handler>) {
        self.dispatcher.register_handler(message_type, handler);
    }

    /// Send a fire-and-forget message over a direct stream.
    pub async fn send(&self, peer: &NodeId, message: TypedMessage) -> Result<(), MessengerError> {
        self.messenger.send(peer, message).await
    }

    /// Send a request over a direct stream and wait for the reply.
    pub async fn send_request(
        &self,
        peer: &NodeId,
        message: TypedMessage,
    ) -> Result<TypedMessage, MessengerError> {
        self.messenger.send_request(peer, message).await
    }

    /// Send a message by any available path: a best-effort relay copy, the
    /// direct stream, and on direct failure the offline mailbox.
    pub async fn send_message(
        &self,
        peer: &NodeId,
        recipient_key: &RsaPublicKey,
        message: TypedMessage,
    ) -> Result<(), NodeError> {
        match self.seal_for(recipient_key, message.clone()) {
            Ok(sealed) => self.relay.send_relay_message(&sealed, peer).await,
            Err(e) => debug!(error = %e, "relay copy not sealed"),
        }

        match self.messenger.send(peer, message.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    error = %e,
                    "direct send failed, storing offline"
                );
                self.send_offline_message(peer, recipient_key, message).await
            }
        }
    }

    /// Seal a message for a recipient: sign, wrap and hybrid-encrypt.
    fn seal_for(
        &self,
        recipient_key: &RsaPublicKey,
        message: TypedMessage,
    ) -> Result<Vec<u8>, NodeError> {
        let inner = MessageEnvelope::new(&self.identity, message)
            .map_err(|e| NodeError::Encode(e.to_string()))?;
        let serialized = inner.to_bytes().map_err(|e| NodeError::Encode(e.to_string()))?;
        envelope::seal(recipient_key, &serialized).map_err(|e| NodeError::Crypto(e.to_string()))
    }

    /// Store a message in the recipient's offline mailbox: seal it, put the
    /// ciphertext in content-addressed storage, and publish a pointer the
    /// recipient can discover.
    pub async fn send_offline_message(
        &self,
        peer: &NodeId,
        recipient_key: &RsaPublicKey,
        message: TypedMessage,
    ) -> Result<(), NodeError> {
        let message_type = message.message_type;
        let sealed = self.seal_for(recipient_key, message)?;

        let address = self
            .overlay
            .store_blob(&sealed)
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;

        let pointer = Pointer {
            content_address: address.clone(),
            recipient_prefix: pointer_prefix(peer, self.config.pointer_prefix_bits),
            delivery_addresses: vec![address.clone()],
            purpose: PointerPurpose::Message,
            timestamp: data::current_timestamp(),
            cancel_id: Some(*peer),
        };

        // Acks are not worth keeping alive; everything else is republished
        // until the recipient cancels it.
        if message_type != MessageType::OfflineAck {
            let db = self.db.lock().await;
            data::put_pointer(&db, &pointer)?;
        }

        self.overlay
            .publish_pointer(&pointer)
            .await
            .map_err(|e| NodeError::Network(e.to_string()))?;

        debug!(
            peer = %hex::encode(&peer.as_bytes()[..8]),
            message_type = %message_type,
            address = %address,
            "stored offline message"
        );
        Ok(())
    }

    pub fn ban(&self, peer: NodeId) {
        self.bans.add(peer);
    }

    pub fn unban(&self, peer: &NodeId) {
        self.bans.remove(peer);
    }

    /// Peers currently following this node.
    pub async fn followers(&self) -> Result<Vec<NodeId>, NodeError> {
        let db = self.db.lock().await;
        Ok(data::get_followers(&db)?)
    }

    /// Wait for the current (or first) mailbox retrieval pass to complete.
    pub async fn wait_until_idle(&self) {
        self.retriever.wait_until_idle().await;
    }

    /// Stop background tasks and close connections.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        self.retriever.stop();
        self.republisher.stop();
        self.relay.stop().await;
        self.messenger.shutdown().await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("node stopped");
    }
}
