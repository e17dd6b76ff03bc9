//! Identity persistence
//!
//! Loads the node's key pair from the database, generating and storing a
//! fresh one on first start.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::security::{Identity, IdentityError};

/// Errors when loading or creating the stored identity.
#[derive(Debug)]
pub enum IdentityStoreError {
    Database(rusqlite::Error),
    Key(IdentityError),
}

impl std::fmt::Display for IdentityStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityStoreError::Database(e) => write!(f, "database error: {}", e),
            IdentityStoreError::Key(e) => write!(f, "identity key error: {}", e),
        }
    }
}

impl std::error::Error for IdentityStoreError {}

impl From<rusqlite::Error> for IdentityStoreError {
    fn from(e: rusqlite::Error) -> Self {
        IdentityStoreError::Database(e)
    }
}

impl From<IdentityError> for IdentityStoreError {
    fn from(e: IdentityError) -> Self {
        IdentityStoreError::Key(e)
    }
}

/// Load the stored identity, or generate and persist a new one.
pub fn get_or_create_identity(conn: &Connection) -> Result<Identity, IdentityStoreError> {
    let stored: Option<Vec<u8>> = conn
        .query_row(
            "SELECT private_key FROM local_identity WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(der) = stored {
        return Ok(Identity::from_pkcs8_der(&der)?);
    }

    info!("no stored identity, generating a new key pair");
    let identity = Identity::generate()?;
    let der = identity.to_pkcs8_der()?;
    conn.execute(
        "INSERT INTO local_identity (id, private_key, node_id) VALUES (1, ?1, ?2)",
        rusqlite::params![der, identity.node_id().as_bytes().to_vec()],
    )?;
    Ok(identity)
}
