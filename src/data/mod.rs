//! Data layer for the messaging node
//!
//! Provides storage and retrieval for:
//! - Local node identity (RSA key pair)
//! - Seen offline-message delivery addresses (de-duplication)
//! - Published mailbox pointers
//! - Followers
//!
//! All access goes through plain functions over a shared
//! `Arc<Mutex<Connection>>`; every mutation is a single-row insert or delete,
//! so no cross-table transaction is needed.

pub mod followers;
pub mod identity;
pub mod offline_messages;
pub mod pointers;
pub mod schema;

use std::path::Path;

use rusqlite::Connection;

pub use followers::{add_follower, get_followers, is_follower, remove_follower};
pub use identity::{get_or_create_identity, IdentityStoreError};
pub use offline_messages::{cleanup_seen_before, has_seen, mark_seen};
pub use pointers::{delete_pointer, get_all_pointers, get_pointer, put_pointer};
pub use schema::create_all_tables;

/// Current unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Open the node database at `path`, or in memory when `path` is `None`,
/// and create the schema.
pub fn open_database(path: Option<&Path>) -> rusqlite::Result<Connection> {
    let conn = match path {
        Some(p) => Connection::open(p)?,
        None => Connection::open_in_memory()?,
    };
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    create_all_tables(&conn)?;
    Ok(conn)
}
