//! In-memory overlay network
//!
//! A process-local hub implementing the [`Overlay`] boundary: framed streams
//! are crossed channel pairs, the DHT is a shared pointer list, and the blob
//! store is a map keyed by content hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};

use crate::network::overlay::{MessageStream, Overlay, OverlayError, StreamError};
use crate::protocol::types::{NodeId, Pointer};

/// A framed stream over a crossed pair of in-process channels.
pub struct ChannelStream {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelStream {
    /// Create the two ends of a connected stream.
    pub fn pair() -> (ChannelStream, ChannelStream) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelStream { tx: a_tx, rx: b_rx },
            ChannelStream { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl MessageStream for ChannelStream {
    async fn send(&mut self, frame: &[u8]) -> Result<(), StreamError> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| StreamError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, StreamError> {
        self.rx.recv().await.ok_or(StreamError::Closed)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

type IncomingTx = mpsc::UnboundedSender<(NodeId, ChannelStream)>;
type IncomingRx = mpsc::UnboundedReceiver<(NodeId, ChannelStream)>;

#[derive(Default)]
struct Hub {
    nodes: StdMutex<HashMap<NodeId, IncomingTx>>,
    pointers: StdMutex<Vec<Pointer>>,
    blobs: StdMutex<HashMap<String, Vec<u8>>>,
}

/// Shared in-memory network; register each test node to get its overlay.
#[derive(Clone, Default)]
pub struct TestNetwork {
    hub: Arc<Hub>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its overlay handle.
    pub fn register(&self, node_id: NodeId) -> Arc<TestOverlay> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut nodes) = self.hub.nodes.lock() {
            nodes.insert(node_id, tx);
        }
        Arc::new(TestOverlay {
            hub: self.hub.clone(),
            local_id: node_id,
            incoming: Mutex::new(rx),
        })
    }

    /// All pointers currently published in the network.
    pub fn published_pointers(&self) -> Vec<Pointer> {
        self.hub
            .pointers
            .lock()
            .map(|pointers| pointers.clone())
            .unwrap_or_default()
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.hub.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }
}

/// One node's view of the [`TestNetwork`].
pub struct TestOverlay {
    hub: Arc<Hub>,
    local_id: NodeId,
    incoming: Mutex<IncomingRx>,
}

#[async_trait]
impl Overlay for TestOverlay {
    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn MessageStream>, StreamError> {
        let remote = self
            .hub
            .nodes
            .lock()
            .ok()
            .and_then(|nodes| nodes.get(peer).cloned())
            .ok_or(StreamError::Closed)?;

        let (local_end, remote_end) = ChannelStream::pair();
        remote
            .send((self.local_id, remote_end))
            .map_err(|_| StreamError::Closed)?;
        Ok(Box::new(local_end))
    }

    async fn accept(&self) -> Option<(NodeId, Box<dyn MessageStream>)> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .map(|(peer, stream)| (peer, Box::new(stream) as Box<dyn MessageStream>))
    }

    async fn find_pointers(&self, prefix: &[u8]) -> Result<mpsc::Receiver<Pointer>, OverlayError> {
        let matches: Vec<Pointer> = self
            .hub
            .pointers
            .lock()
            .map_err(|_| OverlayError::Network("pointer store poisoned".to_string()))?
            .iter()
            .filter(|p| p.recipient_prefix == prefix)
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(matches.len().max(1));
        for pointer in matches {
            let _ = tx.try_send(pointer);
        }
        Ok(rx)
    }

    async fn publish_pointer(&self, pointer: &Pointer) -> Result<(), OverlayError> {
        let mut pointers = self
            .hub
            .pointers
            .lock()
            .map_err(|_| OverlayError::Network("pointer store poisoned".to_string()))?;
        pointers.retain(|p| p.content_address != pointer.content_address);
        pointers.push(pointer.clone());
        Ok(())
    }

    async fn delete_pointer(&self, content_address: &str) -> Result<(), OverlayError> {
        let mut pointers = self
            .hub
            .pointers
            .lock()
            .map_err(|_| OverlayError::Network("pointer store poisoned".to_string()))?;
        pointers.retain(|p| p.content_address != content_address);
        Ok(())
    }

    async fn store_blob(&self, data: &[u8]) -> Result<String, OverlayError> {
        let address = format!("Qm{}", hex::encode(Sha256::digest(data)));
        let mut blobs = self
            .hub
            .blobs
            .lock()
            .map_err(|_| OverlayError::Network("blob store poisoned".to_string()))?;
        blobs.insert(address.clone(), data.to_vec());
        Ok(address)
    }

    async fn fetch_blob(&self, content_address: &str) -> Result<Vec<u8>, OverlayError> {
        self.hub
            .blobs
            .lock()
            .map_err(|_| OverlayError::Network("blob store poisoned".to_string()))?
            .get(content_address)
            .cloned()
            .ok_or(OverlayError::NotFound)
    }
}
