//! Pointer store
//!
//! Mailbox entries this node has published. The republisher reads them each
//! cycle; an offline ack from the recipient deletes them.

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::protocol::types::{NodeId, Pointer, PointerPurpose};

fn addresses_to_json(addresses: &[String]) -> rusqlite::Result<String> {
    serde_json::to_string(addresses)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn pointer_from_row(row: &Row<'_>) -> rusqlite::Result<Pointer> {
    let addresses_json: String = row.get(2)?;
    let delivery_addresses: Vec<String> = serde_json::from_str(&addresses_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    let purpose_raw: i32 = row.get(3)?;
    let purpose = PointerPurpose::from_i32(purpose_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Integer,
            format!("unknown pointer purpose {}", purpose_raw).into(),
        )
    })?;

    let cancel_raw: Option<Vec<u8>> = row.get(5)?;
    let cancel_id = match cancel_raw {
        Some(bytes) => Some(NodeId::from_bytes(&bytes).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Blob,
                "cancel_id is not 32 bytes".into(),
            )
        })?),
        None => None,
    };

    Ok(Pointer {
        content_address: row.get(0)?,
        recipient_prefix: row.get(1)?,
        delivery_addresses,
        purpose,
        timestamp: row.get(4)?,
        cancel_id,
    })
}

/// Insert or replace a pointer, keyed by its content address.
pub fn put_pointer(conn: &Connection, pointer: &Pointer) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO pointers
         (content_address, recipient_prefix, delivery_addresses, purpose, timestamp, cancel_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            pointer.content_address,
            pointer.recipient_prefix,
            addresses_to_json(&pointer.delivery_addresses)?,
            pointer.purpose.as_i32(),
            pointer.timestamp,
            pointer.cancel_id.map(|id| id.as_bytes().to_vec()),
        ],
    )?;
    Ok(())
}

pub fn get_pointer(conn: &Connection, content_address: &str) -> rusqlite::Result<Option<Pointer>> {
    conn.query_row(
        "SELECT content_address, recipient_prefix, delivery_addresses, purpose, timestamp, cancel_id
         FROM pointers WHERE content_address = ?1",
        rusqlite::params![content_address],
        pointer_from_row,
    )
    .optional()
}

pub fn get_all_pointers(conn: &Connection) -> rusqlite::Result<Vec<Pointer>> {
    let mut stmt = conn.prepare(
        "SELECT content_address, recipient_prefix, delivery_addresses, purpose, timestamp, cancel_id
         FROM pointers ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map([], pointer_from_row)?;
    rows.collect()
}

pub fn delete_pointer(conn: &Connection, content_address: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM pointers WHERE content_address = ?1",
        rusqlite::params![content_address],
    )?;
    Ok(())
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

    fn test_pointer(address: &str, purpose: PointerPurpose) -> Pointer {
        Pointer {
            content_address: address.to_string(),
            recipient_prefix: vec![0xAB, 0xC0],
            delivery_addresses: vec![address.to_string()],
            purpose,
            timestamp: 1_700_000_000,
            cancel_id: Some(NodeId([9u8; 32])),
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let conn = setup_db();
        let pointer = test_pointer("Qmpointer1", PointerPurpose::Message);

        put_pointer(&conn, &pointer).unwrap();
        let loaded = get_pointer(&conn, "Qmpointer1").unwrap().unwrap();
        assert_eq!(loaded, pointer);
    }

    #[test]
    fn test_get_missing_pointer_is_none() {
        let conn = setup_db();
        assert!(get_pointer(&conn, "Qmmissing").unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_existing() {
        let conn = setup_db();
        let mut pointer = test_pointer("Qmpointer1", PointerPurpose::Message);

        put_pointer(&conn, &pointer).unwrap();
        pointer.timestamp = 1_700_000_999;
        put_pointer(&conn, &pointer).unwrap();

        let all = get_all_pointers(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].timestamp, 1_700_000_999);
    }

    #[test]
    fn test_get_all_orders_by_timestamp() {
        let conn = setup_db();
        let mut newer = test_pointer("Qmnewer", PointerPurpose::Moderator);
        newer.timestamp = 2_000_000_000;
        let older = test_pointer("Qmolder", PointerPurpose::Message);

        put_pointer(&conn, &newer).unwrap();
        put_pointer(&conn, &older).unwrap();

        let all = get_all_pointers(&conn).unwrap();
        assert_eq!(all[0].content_address, "Qmolder");
        assert_eq!(all[1].content_address, "Qmnewer");
    }

    #[test]
    fn test_delete_pointer() {
        let conn = setup_db();
        put_pointer(&conn, &test_pointer("Qmgone", PointerPurpose::Message)).unwrap();

        delete_pointer(&conn, "Qmgone").unwrap();
        assert!(get_pointer(&conn, "Qmgone").unwrap().is_none());
    }

    #[test]
    fn test_pointer_without_cancel_id() {
        let conn = setup_db();
        let mut pointer = test_pointer("Qmanon", PointerPurpose::Moderator);
        pointer.cancel_id = None;

        put_pointer(&conn, &pointer).unwrap();
        let loaded = get_pointer(&conn, "Qmanon").unwrap().unwrap();
        assert_eq!(loaded.cancel_id, None);
    }
}
