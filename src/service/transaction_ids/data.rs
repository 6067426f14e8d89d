use ruma::{EventId, OwnedEventId, RoomId, TransactionId};

use crate::Result;

pub trait Data: Send + Sync {
    /// Records the server event created for `txn_id`.
    fn add_txnid(&self, room_id: &RoomId, txn_id: &TransactionId, event_id: &EventId) -> Result<()>;

    fn existing_txnid(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<Option<OwnedEventId>>;
}
