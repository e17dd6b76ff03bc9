//! Node errors

/// Errors surfaced by the node's public API.
#[derive(Debug)]
pub enum NodeError {
    /// Failed to start the node
    StartFailed(String),
    /// Database error
    Database(String),
    /// Overlay or transport error
    Network(String),
    /// Sealing, unsealing or signing failed
    Crypto(String),
    /// Wire encoding failed
    Encode(String),
    /// The node is not running
    NotRunning,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::StartFailed(e) => write!(f, "failed to start node: {}", e),
            NodeError::Database(e) => write!(f, "database error: {}", e),
            NodeError::Network(e) => write!(f, "network error: {}", e),
            NodeError::Crypto(e) => write!(f, "crypto error: {}", e),
            NodeError::Encode(e) => write!(f, "encode error: {}", e),
            NodeError::NotRunning => write!(f, "node is not running"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<rusqlite::Error> for NodeError {
    fn from(e: rusqlite::Error) -> Self {
        NodeError::Database(e.to_string())
    }
}
