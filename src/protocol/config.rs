//! Node configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::network::messenger::MessengerConfig;
use crate::network::relay::RelayConfig;
use crate::protocol::types::DEFAULT_POINTER_PREFIX_BITS;
use crate::security::Identity;
use crate::tasks::republisher::RepublisherConfig;
use crate::tasks::retriever::RetrieverConfig;

/// Configuration for the messaging node.
#[derive(Clone)]
pub struct NodeConfig {
    /// Path to the database file.
    /// If None, an in-memory database is used (testing only).
    pub db_path: Option<PathBuf>,

    /// Pre-built identity. If None, one is loaded from the database or
    /// generated and stored on first start.
    pub identity: Option<Identity>,

    /// Relay server websocket URLs for the fallback channel.
    pub relay_servers: Vec<String>,

    /// Bits of the hashed identity used as the mailbox discovery prefix.
    /// Default: 14
    pub pointer_prefix_bits: usize,

    /// How often to run the mailbox retrieval pass (seconds).
    /// Default: 3600 (1 hour)
    pub retrieval_interval_secs: u64,

    /// How often to republish outstanding pointers (seconds).
    /// Default: 86400 (1 day)
    pub republish_interval_secs: u64,

    /// Lifetime of a message-purpose pointer (seconds).
    /// Default: 30 days
    pub message_ttl_secs: i64,

    /// Retention for processed delivery addresses (seconds).
    /// Default: 90 days
    pub seen_retention_secs: i64,

    /// Timeout for opening a stream to a peer (seconds).
    /// Default: 3
    pub connect_timeout_secs: u64,

    /// Timeout for writing one framed message (seconds).
    /// Default: 10
    pub write_timeout_secs: u64,

    /// How long a request waits for its reply (seconds).
    /// Default: 300 (5 minutes)
    pub read_timeout_secs: u64,

    /// Writes before an outbound stream is recycled.
    /// Default: 3
    pub max_stream_reuses: u32,

    /// Per-pointer fetch timeout (seconds).
    /// Default: 30
    pub fetch_timeout_secs: u64,

    /// Maximum concurrent pointer fetches.
    /// Default: 5
    pub max_concurrent_fetches: usize,

    /// Delay before reconnecting a failed relay socket (seconds).
    /// Default: 10
    pub relay_reconnect_secs: u64,
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("db_path", &self.db_path)
            .field("identity", &self.identity.as_ref().map(|_| "[PRESET]"))
            .field("relay_servers", &self.relay_servers)
            .field("pointer_prefix_bits", &self.pointer_prefix_bits)
            .field("retrieval_interval_secs", &self.retrieval_interval_secs)
            .field("republish_interval_secs", &self.republish_interval_secs)
            .field("message_ttl_secs", &self.message_ttl_secs)
            .field("seen_retention_secs", &self.seen_retention_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("write_timeout_secs", &self.write_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("max_stream_reuses", &self.max_stream_reuses)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("relay_reconnect_secs", &self.relay_reconnect_secs)
            .finish()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            identity: None,
            relay_servers: Vec::new(),
            pointer_prefix_bits: DEFAULT_POINTER_PREFIX_BITS,
            retrieval_interval_secs: 3600,
            republish_interval_secs: 24 * 60 * 60,
            message_ttl_secs: 30 * 24 * 60 * 60,
            seen_retention_secs: 90 * 24 * 60 * 60,
            connect_timeout_secs: 3,
            write_timeout_secs: 10,
            read_timeout_secs: 300,
            max_stream_reuses: 3,
            fetch_timeout_secs: 30,
            max_concurrent_fetches: 5,
            relay_reconnect_secs: 10,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database path.
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Use a pre-built identity instead of the stored one.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Add a relay server URL.
    pub fn with_relay_server(mut self, url: String) -> Self {
        self.relay_servers.push(url);
        self
    }

    /// Set the mailbox discovery prefix length in bits.
    pub fn with_pointer_prefix_bits(mut self, bits: usize) -> Self {
        self.pointer_prefix_bits = bits;
        self
    }

    /// Set the retrieval interval.
    pub fn with_retrieval_interval(mut self, secs: u64) -> Self {
        self.retrieval_interval_secs = secs;
        self
    }

    /// Set the republish interval.
    pub fn with_republish_interval(mut self, secs: u64) -> Self {
        self.republish_interval_secs = secs;
        self
    }

    /// Set the message pointer TTL.
    pub fn with_message_ttl(mut self, secs: i64) -> Self {
        self.message_ttl_secs = secs;
        self
    }

    /// Configuration for testing (in-memory database, fast intervals,
    /// short timeouts).
    pub fn for_testing() -> Self {
        Self {
            db_path: None,
            identity: None,
            relay_servers: vec![],
            pointer_prefix_bits: DEFAULT_POINTER_PREFIX_BITS,
            retrieval_interval_secs: 1,
            republish_interval_secs: 1,
            message_ttl_secs: 30 * 24 * 60 * 60,
            seen_retention_secs: 90 * 24 * 60 * 60,
            connect_timeout_secs: 1,
            write_timeout_secs: 2,
            read_timeout_secs: 5,
            max_stream_reuses: 3,
            fetch_timeout_secs: 2,
            max_concurrent_fetches: 5,
            relay_reconnect_secs: 1,
        }
    }

    pub(crate) fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_stream_reuses: self.max_stream_reuses,
        }
    }

    pub(crate) fn retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig {
            prefix_bits: self.pointer_prefix_bits,
            interval: Duration::from_secs(self.retrieval_interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_concurrent_fetches: self.max_concurrent_fetches,
        }
    }

    pub(crate) fn republisher_config(&self) -> RepublisherConfig {
        RepublisherConfig {
            interval: Duration::from_secs(self.republish_interval_secs),
            message_ttl_secs: self.message_ttl_secs,
            seen_retention_secs: self.seen_retention_secs,
        }
    }

    pub(crate) fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            servers: self.relay_servers.clone(),
            reconnect_delay: Duration::from_secs(self.relay_reconnect_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.pointer_prefix_bits, 14);
        assert_eq!(config.retrieval_interval_secs, 3600);
        assert_eq!(config.republish_interval_secs, 86_400);
        assert_eq!(config.message_ttl_secs, 30 * 24 * 60 * 60);
        assert_eq!(config.connect_timeout_secs, 3);
        assert_eq!(config.read_timeout_secs, 300);
        assert_eq!(config.max_stream_reuses, 3);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.max_concurrent_fetches, 5);
        assert_eq!(config.relay_reconnect_secs, 10);
        assert!(config.relay_servers.is_empty());
    }

    #[test]
    fn test_builder_pattern() {
        let config = NodeConfig::new()
            .with_db_path(PathBuf::from("/tmp/node.db"))
            .with_relay_server("wss://relay.example.com/ws".to_string())
            .with_pointer_prefix_bits(20)
            .with_retrieval_interval(120)
            .with_message_ttl(60);

        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/node.db")));
        assert_eq!(config.relay_servers.len(), 1);
        assert_eq!(config.pointer_prefix_bits, 20);
        assert_eq!(config.retrieval_interval_secs, 120);
        assert_eq!(config.message_ttl_secs, 60);
    }

    #[test]
    fn test_testing_config_is_fast() {
        let config = NodeConfig::for_testing();
        assert!(config.db_path.is_none());
        assert!(config.retrieval_interval_secs <= 5);
        assert!(config.republish_interval_secs <= 5);
        assert!(config.connect_timeout_secs <= 2);
    }

    #[test]
    fn test_component_config_conversion() {
        let config = NodeConfig::default();

        let messenger = config.messenger_config();
        assert_eq!(messenger.connect_timeout, Duration::from_secs(3));
        assert_eq!(messenger.read_timeout, Duration::from_secs(300));

        let retriever = config.retriever_config();
        assert_eq!(retriever.interval, Duration::from_secs(3600));
        assert_eq!(retriever.max_concurrent_fetches, 5);

        let republisher = config.republisher_config();
        assert_eq!(republisher.message_ttl_secs, 30 * 24 * 60 * 60);
    }
}
