//! Direct peer-to-peer messenger
//!
//! Owns one logical connection per remote peer, multiplexing request/response
//! pairs over a reusable stream. All traffic to one peer is serialized behind
//! a per-peer lock; different peers proceed fully in parallel. The peer table
//! itself is locked only for lookup/insert, never across I/O.
//!
//! A transport failure tears the stream down and triggers exactly one retry
//! on a freshly opened stream; a second failure is surfaced to the caller.
//! Streams are also recycled after a configurable number of reuses to bound
//! resource growth on long-lived sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::network::banlist::BanList;
use crate::network::dispatcher::Dispatcher;
use crate::network::overlay::{MessageStream, Overlay};
use crate::protocol::types::{NodeId, TypedMessage};

/// Configuration for the direct messenger.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Timeout for opening a fresh stream (default: 3 seconds)
    pub connect_timeout: Duration,
    /// Timeout for writing one framed message (default: 10 seconds)
    pub write_timeout: Duration,
    /// How long a request waits for its reply (default: 5 minutes)
    pub read_timeout: Duration,
    /// Writes before a stream is recycled even on success (default: 3)
    pub max_stream_reuses: u32,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            max_stream_reuses: 3,
        }
    }
}

/// Errors surfaced to messenger callers.
#[derive(Debug)]
pub enum MessengerError {
    /// Opening a stream did not complete within the connect timeout
    ConnectTimeout,
    /// Opening a stream failed
    Connect(String),
    /// Writing a message did not complete within the write timeout
    WriteTimeout,
    /// Waiting for a reply did not complete within the read timeout
    ReadTimeout,
    /// Stream-level failure
    Stream(String),
    /// The messenger shut down while a request was outstanding
    Closed,
    /// Message could not be encoded
    Encode(String),
}

impl std::fmt::Display for MessengerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessengerError::ConnectTimeout => write!(f, "connect timed out"),
            MessengerError::Connect(e) => write!(f, "connect failed: {}", e),
            MessengerError::WriteTimeout => write!(f, "write timed out"),
            MessengerError::ReadTimeout => write!(f, "read timed out"),
            MessengerError::Stream(e) => write!(f, "stream error: {}", e),
            MessengerError::Closed => write!(f, "messenger closed"),
            MessengerError::Encode(e) => write!(f, "encode failed: {}", e),
        }
    }
}

impl std::error::Error for MessengerError {}

/// The outbound stream slot for one peer. `None` means the next write opens
/// a fresh stream.
#[derive(Default)]
struct StreamSlot {
    stream: Option<Box<dyn MessageStream>>,
    uses: u32,
}

struct PeerEntry {
    slot: Mutex<StreamSlot>,
}

/// Direct messenger over the overlay's stream transport.
pub struct Messenger {
    overlay: Arc<dyn Overlay>,
    dispatcher: Arc<Dispatcher>,
    bans: Arc<BanList>,
    config: MessengerConfig,
    /// Per-peer entries; the map lock is held only for lookup/insert.
    peers: Mutex<HashMap<NodeId, Arc<PeerEntry>>>,
    /// Outstanding requests awaiting replies, keyed by (peer, request id).
    pending: std::sync::Mutex<HashMap<(NodeId, i32), oneshot::Sender<TypedMessage>>>,
}

impl Messenger {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        dispatcher: Arc<Dispatcher>,
        bans: Arc<BanList>,
        config: MessengerConfig,
    ) -> Self {
        Self {
            overlay,
            dispatcher,
            bans,
            config,
            peers: Mutex::new(HashMap::new()),
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn peer_entry(&self, peer: &NodeId) -> Arc<PeerEntry> {
        let mut peers = self.peers.lock().await;
        peers
            .entry(*peer)
            .or_insert_with(|| {
                Arc::new(PeerEntry {
                    slot: Mutex::new(StreamSlot::default()),
                })
            })
            .clone()
    }

    /// Write one framed message under the per-peer lock, retrying once on a
    /// fresh stream after any transport failure.
    async fn write_message(&self, peer: &NodeId, bytes: &[u8]) -> Result<(), MessengerError> {
        let entry = self.peer_entry(peer).await;
        let mut slot = entry.slot.lock().await;

        let mut last_err = MessengerError::Closed;
        for attempt in 0..2u32 {
            if slot.stream.is_none() {
                match timeout(self.config.connect_timeout, self.overlay.open_stream(peer)).await {
                    Ok(Ok(stream)) => {
                        trace!(peer = %hex::encode(&peer.as_bytes()[..8]), "opened fresh stream");
                        slot.stream = Some(stream);
                        slot.uses = 0;
                    }
                    Ok(Err(e)) => {
                        last_err = MessengerError::Connect(e.to_string());
                        continue;
                    }
                    Err(_) => {
                        last_err = MessengerError::ConnectTimeout;
                        continue;
                    }
                }
            }

            let Some(stream) = slot.stream.as_mut() else {
                continue;
            };

            match timeout(self.config.write_timeout, stream.send(bytes)).await {
                Ok(Ok(())) => {
                    slot.uses += 1;
                    if slot.uses >= self.config.max_stream_reuses {
                        // Recycle even on success to bound resource growth.
                        if let Some(mut stream) = slot.stream.take() {
                            stream.close().await;
                        }
                        slot.uses = 0;
                    }
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        attempt,
                        error = %e,
                        "stream write failed, tearing down"
                    );
                    slot.stream = None;
                    last_err = MessengerError::Stream(e.to_string());
                }
                Err(_) => {
                    debug!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        attempt,
                        "stream write timed out, tearing down"
                    );
                    slot.stream = None;
                    last_err = MessengerError::WriteTimeout;
                }
            }
        }

        Err(last_err)
    }

    /// Send a fire-and-forget message.
    pub async fn send(&self, peer: &NodeId, message: TypedMessage) -> Result<(), MessengerError> {
        let bytes = message
            .to_bytes()
            .map_err(|e| MessengerError::Encode(e.to_string()))?;
        self.write_message(peer, &bytes).await
    }

    /// Send a request and wait for the correlated reply.
    pub async fn send_request(
        &self,
        peer: &NodeId,
        mut message: TypedMessage,
    ) -> Result<TypedMessage, MessengerError> {
        let request_id = rand::thread_rng().gen_range(1..=i32::MAX);
        message.request_id = request_id;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert((*peer, request_id), tx);
        }

        let bytes = match message.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                self.remove_pending(peer, request_id);
                return Err(MessengerError::Encode(e.to_string()));
            }
        };

        if let Err(e) = self.write_message(peer, &bytes).await {
            self.remove_pending(peer, request_id);
            return Err(e);
        }

        match timeout(self.config.read_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MessengerError::Closed),
            Err(_) => {
                self.remove_pending(peer, request_id);
                Err(MessengerError::ReadTimeout)
            }
        }
    }

    fn remove_pending(&self, peer: &NodeId, request_id: i32) -> Option<oneshot::Sender<TypedMessage>> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&(*peer, request_id)))
    }

    /// Drive one inbound stream until it closes.
    ///
    /// Each frame either resolves a pending request or is dispatched; a
    /// handler reply goes back through the normal outbound path with the
    /// request id it answers.
    pub async fn handle_inbound_stream(
        self: Arc<Self>,
        peer: NodeId,
        mut stream: Box<dyn MessageStream>,
    ) {
        loop {
            let frame = match stream.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    trace!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        error = %e,
                        "inbound stream closed"
                    );
                    break;
                }
            };

            if self.bans.is_banned(&peer) {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    "dropping stream from banned peer"
                );
                stream.close().await;
                break;
            }

            let message = match TypedMessage::from_bytes(&frame) {
                Ok(message) => message,
                Err(e) => {
                    debug!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        error = %e,
                        "undecodable frame, skipping"
                    );
                    continue;
                }
            };

            // A frame carrying an id we are waiting on is the reply to our
            // own request; everything else is peer-initiated traffic.
            if message.request_id != 0 {
                if let Some(tx) = self.remove_pending(&peer, message.request_id) {
                    let _ = tx.send(message);
                    continue;
                }
            }

            let request_id = message.request_id;
            match self.dispatcher.handle_inbound(peer, &message).await {
                Ok(Some(mut reply)) => {
                    reply.request_id = request_id;
                    if let Err(e) = self.send(&peer, reply).await {
                        warn!(
                            peer = %hex::encode(&peer.as_bytes()[..8]),
                            error = %e,
                            "failed to send reply"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        peer = %hex::encode(&peer.as_bytes()[..8]),
                        message_type = %message.message_type,
                        error = %e,
                        "inbound handler failed"
                    );
                }
            }
        }
    }

    /// Close all cached streams and fail every outstanding request.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<PeerEntry>> = {
            let mut peers = self.peers.lock().await;
            peers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let mut slot = entry.slot.lock().await;
            if let Some(mut stream) = slot.stream.take() {
                stream.close().await;
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::network::dispatcher::{Handler, HandlerError};
    use crate::network::overlay::{OverlayError, StreamError};
    use crate::protocol::types::{MessageType, Pointer};
    use crate::testing::TestNetwork;

    fn test_config() -> MessengerConfig {
        MessengerConfig {
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
            max_stream_reuses: 3,
        }
    }

    fn new_messenger(overlay: Arc<dyn Overlay>, dispatcher: Arc<Dispatcher>) -> Arc<Messenger> {
        Arc::new(Messenger::new(
            overlay,
            dispatcher,
            Arc::new(BanList::default()),
            test_config(),
        ))
    }

    /// Spawn a responder node: every accepted stream is driven through its
    /// own messenger, so registered handlers answer requests.
    fn spawn_responder(overlay: Arc<dyn Overlay>, messenger: Arc<Messenger>) {
        tokio::spawn(async move {
            while let Some((peer, stream)) = overlay.accept().await {
                let messenger = messenger.clone();
                tokio::spawn(async move {
                    messenger.handle_inbound_stream(peer, stream).await;
                });
            }
        });
    }

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(
            &self,
            _sender: NodeId,
            message: &TypedMessage,
        ) -> Result<Option<TypedMessage>, HandlerError> {
            let mut payload = b"echo:".to_vec();
            payload.extend_from_slice(&message.payload);
            Ok(Some(TypedMessage::new(MessageType::Chat, payload)))
        }
    }

    #[tokio::test]
    async fn test_send_request_receives_reply() {
        let net = TestNetwork::new();
        let a = NodeId([1u8; 32]);
        let b = NodeId([2u8; 32]);
        let overlay_a = net.register(a);
        let overlay_b = net.register(b);

        let dispatcher_b = Arc::new(Dispatcher::new());
        dispatcher_b.register_handler(MessageType::Chat, Arc::new(EchoHandler));
        let messenger_b = new_messenger(overlay_b.clone(), dispatcher_b);
        spawn_responder(overlay_b, messenger_b);

        let dispatcher_a = Arc::new(Dispatcher::new());
        let messenger_a = new_messenger(overlay_a.clone(), dispatcher_a);
        spawn_responder(overlay_a, messenger_a.clone());

        let reply = messenger_a
            .send_request(&b, TypedMessage::new(MessageType::Chat, b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"echo:hello");
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let net = TestNetwork::new();
        let a = NodeId([1u8; 32]);
        let b = NodeId([2u8; 32]);
        let overlay_a = net.register(a);
        let overlay_b = net.register(b);

        let dispatcher_b = Arc::new(Dispatcher::new());
        dispatcher_b.register_handler(MessageType::Chat, Arc::new(EchoHandler));
        let messenger_b = new_messenger(overlay_b.clone(), dispatcher_b);
        spawn_responder(overlay_b, messenger_b);

        let dispatcher_a = Arc::new(Dispatcher::new());
        let messenger_a = new_messenger(overlay_a.clone(), dispatcher_a);
        spawn_responder(overlay_a, messenger_a.clone());

        let first = {
            let messenger = messenger_a.clone();
            tokio::spawn(async move {
                messenger
                    .send_request(&b, TypedMessage::new(MessageType::Chat, b"one".to_vec()))
                    .await
            })
        };
        let second = {
            let messenger = messenger_a.clone();
            tokio::spawn(async move {
                messenger
                    .send_request(&b, TypedMessage::new(MessageType::Chat, b"two".to_vec()))
                    .await
            })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.payload, b"echo:one");
        assert_eq!(second.payload, b"echo:two");
    }

    /// Overlay whose streams fail on the first `fail_sends` writes, then
    /// succeed, recording delivered frames.
    struct FlakyOverlay {
        fail_sends: u32,
        attempts: AtomicU32,
        delivered: mpsc::UnboundedSender<Vec<u8>>,
    }

    struct FlakyStream {
        fails: bool,
        attempt: u32,
        delivered: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl MessageStream for FlakyStream {
        async fn send(&mut self, frame: &[u8]) -> Result<(), StreamError> {
            if self.fails {
                return Err(StreamError::Io(format!("reset on attempt {}", self.attempt)));
            }
            let _ = self.delivered.send(frame.to_vec());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Vec<u8>, StreamError> {
            Err(StreamError::Closed)
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl Overlay for FlakyOverlay {
        async fn open_stream(
            &self,
            _peer: &NodeId,
        ) -> Result<Box<dyn MessageStream>, StreamError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(FlakyStream {
                fails: attempt <= self.fail_sends,
                attempt,
                delivered: self.delivered.clone(),
            }))
        }

        async fn accept(&self) -> Option<(NodeId, Box<dyn MessageStream>)> {
            std::future::pending().await
        }

        async fn find_pointers(
            &self,
            _prefix: &[u8],
        ) -> Result<mpsc::Receiver<Pointer>, OverlayError> {
            Err(OverlayError::NotFound)
        }

        async fn publish_pointer(&self, _pointer: &Pointer) -> Result<(), OverlayError> {
            Ok(())
        }

        async fn delete_pointer(&self, _content_address: &str) -> Result<(), OverlayError> {
            Ok(())
        }

        async fn store_blob(&self, _data: &[u8]) -> Result<String, OverlayError> {
            Err(OverlayError::NotFound)
        }

        async fn fetch_blob(&self, _content_address: &str) -> Result<Vec<u8>, OverlayError> {
            Err(OverlayError::NotFound)
        }
    }

    #[tokio::test]
    async fn test_retry_once_succeeds_after_first_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let overlay = Arc::new(FlakyOverlay {
            fail_sends: 1,
            attempts: AtomicU32::new(0),
            delivered: tx,
        });
        let messenger = new_messenger(overlay, Arc::new(Dispatcher::new()));

        let peer = NodeId([9u8; 32]);
        messenger
            .send(&peer, TypedMessage::new(MessageType::Ping, vec![]))
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_second_failure_surfaces_second_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let overlay = Arc::new(FlakyOverlay {
            fail_sends: u32::MAX,
            attempts: AtomicU32::new(0),
            delivered: tx,
        });
        let messenger = new_messenger(overlay, Arc::new(Dispatcher::new()));

        let peer = NodeId([9u8; 32]);
        let err = messenger
            .send(&peer, TypedMessage::new(MessageType::Ping, vec![]))
            .await
            .unwrap_err();

        // The error from the retried (second) attempt is the one surfaced.
        assert!(err.to_string().contains("attempt 2"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_stream_recycled_after_max_reuses() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let overlay = Arc::new(FlakyOverlay {
            fail_sends: 0,
            attempts: AtomicU32::new(0),
            delivered: tx,
        });
        let messenger = new_messenger(overlay.clone(), Arc::new(Dispatcher::new()));

        let peer = NodeId([9u8; 32]);
        for _ in 0..4 {
            messenger
                .send(&peer, TypedMessage::new(MessageType::Ping, vec![]))
                .await
                .unwrap();
        }

        // 3 writes on the first stream, then a fresh one for the 4th.
        assert_eq!(overlay.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding_requests() {
        let net = TestNetwork::new();
        let a = NodeId([1u8; 32]);
        let b = NodeId([2u8; 32]);
        let overlay_a = net.register(a);
        let _overlay_b = net.register(b);

        // No responder on b: the request would wait for the full read
        // timeout unless shutdown clears it.
        let messenger = new_messenger(overlay_a, Arc::new(Dispatcher::new()));

        let request = {
            let messenger = messenger.clone();
            tokio::spawn(async move {
                messenger
                    .send_request(&b, TypedMessage::new(MessageType::Ping, vec![]))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        messenger.shutdown().await;

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, MessengerError::Closed));
    }
}
