//! Overlay network boundary
//!
//! The peer overlay (identity transport, DHT, content-addressed storage) is
//! an external collaborator. This module defines the traits the messaging
//! core consumes; `testing::TestNetwork` provides an in-memory
//! implementation, a host node wires in the real substrate.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::types::{NodeId, Pointer};

/// Errors on a direct peer stream.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The stream or its peer has gone away
    Closed,
    /// Underlying transport failure
    Io(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Closed => write!(f, "stream closed"),
            StreamError::Io(e) => write!(f, "stream io error: {}", e),
        }
    }
}

impl std::error::Error for StreamError {}

/// Errors from the overlay's lookup, publish and blob operations.
#[derive(Debug, Clone)]
pub enum OverlayError {
    /// Content address or record not found
    NotFound,
    /// Lookup, publish or fetch failed
    Network(String),
}

impl std::fmt::Display for OverlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayError::NotFound => write!(f, "not found"),
            OverlayError::Network(e) => write!(f, "overlay error: {}", e),
        }
    }
}

impl std::error::Error for OverlayError {}

/// A bidirectional, message-framed byte stream to one peer.
///
/// Framing is the transport's concern: one `send` produces exactly one
/// `recv` on the other side.
#[async_trait]
pub trait MessageStream: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), StreamError>;
    async fn recv(&mut self) -> Result<Vec<u8>, StreamError>;
    async fn close(&mut self);
}

/// The overlay network substrate.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Open a fresh framed stream to a peer.
    async fn open_stream(&self, peer: &NodeId) -> Result<Box<dyn MessageStream>, StreamError>;

    /// Wait for the next inbound stream. `None` means the overlay has shut
    /// down and no more streams will arrive.
    async fn accept(&self) -> Option<(NodeId, Box<dyn MessageStream>)>;

    /// Stream all published pointers whose key matches `prefix`.
    async fn find_pointers(&self, prefix: &[u8]) -> Result<mpsc::Receiver<Pointer>, OverlayError>;

    /// Publish (or refresh) a pointer in the overlay.
    async fn publish_pointer(&self, pointer: &Pointer) -> Result<(), OverlayError>;

    /// Remove a published pointer by its content address.
    async fn delete_pointer(&self, content_address: &str) -> Result<(), OverlayError>;

    /// Store a blob in content-addressed storage, returning its address.
    async fn store_blob(&self, data: &[u8]) -> Result<String, OverlayError>;

    /// Fetch a blob by content address.
    async fn fetch_blob(&self, content_address: &str) -> Result<Vec<u8>, OverlayError>;
}
