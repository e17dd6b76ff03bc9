//! Seen-entry store for offline message de-duplication
//!
//! A delivery address is recorded on the first processing attempt, whether or
//! not the fetch succeeds, so a broken or hostile pointer is never retried
//! and a processed one is never dispatched twice. Entries are removed only by
//! the retention cleanup.

use rusqlite::Connection;

use crate::data::current_timestamp;

/// True if this delivery address was already processed.
pub fn has_seen(conn: &Connection, address: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM offline_messages WHERE address = ?1",
        rusqlite::params![address],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

/// Record a delivery address as processed.
pub fn mark_seen(conn: &Connection, address: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO offline_messages (address, timestamp) VALUES (?1, ?2)",
        rusqlite::params![address, current_timestamp()],
    )?;
    Ok(())
}

/// Delete seen entries recorded before `cutoff`. Returns how many were removed.
pub fn cleanup_seen_before(conn: &Connection, cutoff: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM offline_messages WHERE timestamp < ?1",
        rusqlite::params![cutoff],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::create_all_tables;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn test_mark_and_check_seen() {
        let conn = setup_db();

        assert!(!has_seen(&conn, "Qmabc123").unwrap());
        mark_seen(&conn, "Qmabc123").unwrap();
        assert!(has_seen(&conn, "Qmabc123").unwrap());
        assert!(!has_seen(&conn, "Qmother").unwrap());
    }

    #[test]
    fn test_mark_seen_twice_is_harmless() {
        let conn = setup_db();

        mark_seen(&conn, "https://push.example.com/m/1").unwrap();
        mark_seen(&conn, "https://push.example.com/m/1").unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM offline_messages", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_cleanup_removes_only_old_entries() {
        let conn = setup_db();

        conn.execute(
            "INSERT INTO offline_messages (address, timestamp) VALUES ('old', 100), ('new', ?1)",
            rusqlite::params![current_timestamp()],
        )
        .unwrap();

        let removed = cleanup_seen_before(&conn, current_timestamp() - 10).unwrap();
        assert_eq!(removed, 1);
        assert!(!has_seen(&conn, "old").unwrap());
        assert!(has_seen(&conn, "new").unwrap());
    }
}
