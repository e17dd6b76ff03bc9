//! Database schema for the messaging node.

use rusqlite::Connection;

/// Creates all required database tables.
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_identity_table(conn)?;
    create_offline_messages_table(conn)?;
    create_pointers_table(conn)?;
    create_followers_table(conn)?;
    Ok(())
}

/// Local identity table: the node's RSA key pair (PKCS#8 DER).
///
/// Only one row should exist.
pub fn create_identity_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS local_identity (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            private_key BLOB NOT NULL,
            node_id BLOB NOT NULL CHECK (length(node_id) = 32),
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

/// Offline messages table: delivery addresses that have already been
/// processed, so a pointer is never fetched or dispatched twice.
pub fn create_offline_messages_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS offline_messages (
            address TEXT PRIMARY KEY NOT NULL,
            timestamp INTEGER NOT NULL
        )",
        [],
    )?;

    // Index for retention cleanup by age
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_offline_messages_timestamp
         ON offline_messages(timestamp)",
        [],
    )?;
    Ok(())
}

/// Pointers table: mailbox entries this node has published and must keep
/// alive in the overlay until acked or expired.
pub fn create_pointers_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pointers (
            content_address TEXT PRIMARY KEY NOT NULL,
            recipient_prefix BLOB NOT NULL,
            delivery_addresses TEXT NOT NULL,
            purpose INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            cancel_id BLOB CHECK (cancel_id IS NULL OR length(cancel_id) = 32)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pointers_timestamp ON pointers(timestamp)",
        [],
    )?;
    Ok(())
}

/// Followers table: peers that follow this node.
pub fn create_followers_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS followers (
            peer_id BLOB PRIMARY KEY NOT NULL CHECK (length(peer_id) = 32),
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}
