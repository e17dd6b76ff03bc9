//! Peer ban list
//!
//! A concurrency-safe set of banned identities, consulted before any inbound
//! traffic is processed.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::protocol::types::NodeId;

/// Set of peers whose traffic is dropped.
#[derive(Default)]
pub struct BanList {
    banned: RwLock<HashSet<NodeId>>,
}

impl BanList {
    pub fn new(initial: Vec<NodeId>) -> Self {
        Self {
            banned: RwLock::new(initial.into_iter().collect()),
        }
    }

    pub fn is_banned(&self, peer: &NodeId) -> bool {
        self.banned
            .read()
            .map(|set| set.contains(peer))
            .unwrap_or(false)
    }

    pub fn add(&self, peer: NodeId) {
        if let Ok(mut set) = self.banned.write() {
            set.insert(peer);
        }
    }

    pub fn remove(&self, peer: &NodeId) {
        if let Ok(mut set) = self.banned.write() {
            set.remove(peer);
        }
    }

    /// Replace the whole set, e.g. when reloading node settings.
    pub fn set_all(&self, peers: Vec<NodeId>) {
        if let Ok(mut set) = self.banned.write() {
            *set = peers.into_iter().collect();
        }
    }
}
