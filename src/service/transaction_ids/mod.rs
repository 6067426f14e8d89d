mod data;

use std::sync::Arc;

pub use data::Data;

use ruma::{EventId, OwnedEventId, RoomId, TransactionId};

use crate::Result;

/// Ledger of acknowledged sends, keyed by idempotency key.
pub struct Service {
    pub db: Arc<dyn Data>,
}

impl Service {
    pub fn add_txnid(&self, room_id: &RoomId, txn_id: &TransactionId, event_id: &EventId) -> Result<()> {
        self.db.add_txnid(room_id, txn_id, event_id)
    }

    pub fn existing_txnid(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<Option<OwnedEventId>> {
        self.db.existing_txnid(room_id, txn_id)
    }
}
