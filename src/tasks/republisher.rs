//! Pointer republish loop
//!
//! Keeps this node's outstanding mailbox entries alive in the overlay.
//! Message-purpose pointers expire after a fixed TTL and are deleted instead
//! of republished; everything else is republished indefinitely. Runs once at
//! startup and then on a fixed interval; cycles never overlap.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::data;
use crate::network::overlay::Overlay;
use crate::protocol::types::PointerPurpose;

/// Configuration for the republish loop.
#[derive(Debug, Clone)]
pub struct RepublisherConfig {
    /// Interval between republish cycles (default: 1 day)
    pub interval: Duration,
    /// Lifetime of a message-purpose pointer (default: 30 days)
    pub message_ttl_secs: i64,
    /// Retention for seen offline-message addresses (default: 90 days)
    pub seen_retention_secs: i64,
}

impl Default for RepublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            message_ttl_secs: 30 * 24 * 60 * 60,
            seen_retention_secs: 90 * 24 * 60 * 60,
        }
    }
}

/// Keeps published pointers alive in the overlay until acked or expired.
pub struct PointerRepublisher {
    db: Arc<Mutex<Connection>>,
    overlay: Arc<dyn Overlay>,
    config: RepublisherConfig,
    running: Arc<RwLock<bool>>,
    shutdown: Notify,
}

impl PointerRepublisher {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        overlay: Arc<dyn Overlay>,
        config: RepublisherConfig,
        running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            db,
            overlay,
            config,
            running,
            shutdown: Notify::new(),
        }
    }

    /// Run the republish loop until stopped. The cycle runs inline between
    /// sleeps, so a slow cycle delays the next tick rather than overlapping
    /// with it.
    pub async fn run(self: Arc<Self>) {
        loop {
            if !*self.running.read().await {
                break;
            }

            self.republish_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        info!("pointer republish loop stopped");
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// One republish cycle: expire old message pointers, refresh the rest,
    /// then run seen-entry retention cleanup.
    pub(crate) async fn republish_cycle(&self) {
        let pointers = {
            let db = self.db.lock().await;
            match data::get_all_pointers(&db) {
                Ok(pointers) => pointers,
                Err(e) => {
                    warn!(error = %e, "failed to load pointers");
                    return;
                }
            }
        };

        let now = data::current_timestamp();
        for pointer in pointers {
            let expired = pointer.purpose == PointerPurpose::Message
                && now - pointer.timestamp > self.config.message_ttl_secs;
            if expired {
                // The recipient is assumed unreachable or already served;
                // the mailbox entry is gone for good.
                let result = {
                    let db = self.db.lock().await;
                    data::delete_pointer(&db, &pointer.content_address)
                };
                match result {
                    Ok(()) => debug!(
                        address = %pointer.content_address,
                        age_secs = now - pointer.timestamp,
                        "expired message pointer deleted"
                    ),
                    Err(e) => warn!(
                        address = %pointer.content_address,
                        error = %e,
                        "failed to delete expired pointer"
                    ),
                }
                continue;
            }

            if let Err(e) = self.overlay.publish_pointer(&pointer).await {
                warn!(
                    address = %pointer.content_address,
                    error = %e,
                    "pointer republish failed"
                );
            } else {
                debug!(address = %pointer.content_address, "pointer republished");
            }
        }

        let cutoff = now - self.config.seen_retention_secs;
        let cleaned = {
            let db = self.db.lock().await;
            data::cleanup_seen_before(&db, cutoff)
        };
        match cleaned {
            Ok(0) => {}
            Ok(count) => debug!(count, "cleaned up old seen entries"),
            Err(e) => warn!(error = %e, "seen entry cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::types::{NodeId, Pointer};
    use crate::testing::TestNetwork;

    fn setup_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        data::create_all_tables(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn pointer_aged(address: &str, purpose: PointerPurpose, age_secs: i64) -> Pointer {
        Pointer {
            content_address: address.to_string(),
            recipient_prefix: vec![0xAB],
            delivery_addresses: vec![address.to_string()],
            purpose,
            timestamp: data::current_timestamp() - age_secs,
            cancel_id: None,
        }
    }

    fn build_republisher(
        net: &TestNetwork,
        db: Arc<Mutex<Connection>>,
    ) -> PointerRepublisher {
        let overlay = net.register(NodeId([1u8; 32]));
        PointerRepublisher::new(
            db,
            overlay,
            RepublisherConfig::default(),
            Arc::new(RwLock::new(true)),
        )
    }

    const DAY: i64 = 24 * 60 * 60;

    #[tokio::test]
    async fn test_expired_message_pointer_is_deleted_not_republished() {
        let net = TestNetwork::new();
        let db = setup_db();
        {
            let conn = db.lock().await;
            data::put_pointer(&conn, &pointer_aged("Qmexpired", PointerPurpose::Message, 31 * DAY))
                .unwrap();
        }

        let republisher = build_republisher(&net, db.clone());
        republisher.republish_cycle().await;

        assert!(net.published_pointers().is_empty());
        let conn = db.lock().await;
        assert!(data::get_pointer(&conn, "Qmexpired").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_message_pointer_is_republished() {
        let net = TestNetwork::new();
        let db = setup_db();
        {
            let conn = db.lock().await;
            data::put_pointer(&conn, &pointer_aged("Qmfresh", PointerPurpose::Message, DAY))
                .unwrap();
        }

        let republisher = build_republisher(&net, db.clone());
        republisher.republish_cycle().await;

        let published = net.published_pointers();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].content_address, "Qmfresh");
        let conn = db.lock().await;
        assert!(data::get_pointer(&conn, "Qmfresh").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_message_pointer_is_republished_indefinitely() {
        let net = TestNetwork::new();
        let db = setup_db();
        {
            let conn = db.lock().await;
            data::put_pointer(
                &conn,
                &pointer_aged("Qmmoderator", PointerPurpose::Moderator, 400 * DAY),
            )
            .unwrap();
        }

        let republisher = build_republisher(&net, db.clone());
        republisher.republish_cycle().await;

        assert_eq!(net.published_pointers().len(), 1);
        let conn = db.lock().await;
        assert!(data::get_pointer(&conn, "Qmmoderator").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cycle_cleans_up_old_seen_entries() {
        let net = TestNetwork::new();
        let db = setup_db();
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO offline_messages (address, timestamp) VALUES ('ancient', 1000)",
                [],
            )
            .unwrap();
            data::mark_seen(&conn, "recent").unwrap();
        }

        let republisher = build_republisher(&net, db.clone());
        republisher.republish_cycle().await;

        let conn = db.lock().await;
        assert!(!data::has_seen(&conn, "ancient").unwrap());
        assert!(data::has_seen(&conn, "recent").unwrap());
    }
}
