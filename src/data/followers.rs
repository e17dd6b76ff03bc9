//! Follower store backing the follow/unfollow handlers.

use rusqlite::Connection;

use crate::protocol::types::NodeId;

pub fn add_follower(conn: &Connection, peer: &NodeId) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO followers (peer_id) VALUES (?1)",
        rusqlite::params![peer.as_bytes().to_vec()],
    )?;
    Ok(())
}

pub fn remove_follower(conn: &Connection, peer: &NodeId) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM followers WHERE peer_id = ?1",
        rusqlite::params![peer.as_bytes().to_vec()],
    )?;
    Ok(())
}

pub fn is_follower(conn: &Connection, peer: &NodeId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM followers WHERE peer_id = ?1",
        rusqlite::params![peer.as_bytes().to_vec()],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

pub fn get_followers(conn: &Connection) -> rusqlite::Result<Vec<NodeId>> {
    let mut stmt = conn.prepare("SELECT peer_id FROM followers ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], |row| {
        let bytes: Vec<u8> = row.get(0)?;
        NodeId::from_bytes(&bytes).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Blob,
                "peer_id is not 32 bytes".into(),
            )
        })
    })?;
    rows.collect()
}
