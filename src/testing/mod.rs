//! Testing utilities
//!
//! An in-process overlay network so nodes can be exercised without a real
//! substrate, plus a pool of pre-generated RSA identities (key generation is
//! slow enough that every test sharing two keys matters).
//!
//! # Example
//!
//! ```ignore
//! let net = TestNetwork::new();
//! let alice = test_identity(0);
//! let overlay = net.register(alice.node_id());
//! let node = Node::start(
//!     NodeConfig::for_testing().with_identity(alice),
//!     overlay,
//! ).await?;
//! ```

pub mod overlay;

use std::sync::OnceLock;

use crate::security::Identity;

pub use overlay::{ChannelStream, TestNetwork, TestOverlay};

const TEST_IDENTITY_POOL: usize = 2;

/// A process-wide test identity. `index` selects from a small fixed pool.
pub fn test_identity(index: usize) -> Identity {
    static POOL: OnceLock<Vec<Identity>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        (0..TEST_IDENTITY_POOL)
            .map(|_| Identity::generate().expect("test identity generation"))
            .collect()
    });
    pool[index % TEST_IDENTITY_POOL].clone()
}
