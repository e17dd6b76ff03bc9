//! Background tasks for the messaging node
//!
//! - Mailbox retrieval loop (discovers and processes offline messages)
//! - Pointer republish loop (keeps published mailbox entries alive)
//!
//! Both run once immediately at startup and then on their configured
//! intervals, and both stop promptly when the node shuts down.

pub mod republisher;
pub mod retriever;

pub use republisher::{PointerRepublisher, RepublisherConfig};
pub use retriever::{MessageRetriever, RetrieverConfig};
