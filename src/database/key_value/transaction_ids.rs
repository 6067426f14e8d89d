use matrixon_timeline_core::TimelineError;
use ruma::{EventId, OwnedEventId, RoomId, TransactionId};

use crate::{
    database::{join_key, KeyValueDatabase},
    service, utils, Result,
};

impl service::transaction_ids::Data for KeyValueDatabase {
    fn add_txnid(&self, room_id: &RoomId, txn_id: &TransactionId, event_id: &EventId) -> Result<()> {
        let key = join_key(&[room_id.as_bytes(), txn_id.as_bytes()]);
        self.roomtxnid_eventid.insert(&key, event_id.as_bytes())?;

        Ok(())
    }

    fn existing_txnid(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<Option<OwnedEventId>> {
        let key = join_key(&[room_id.as_bytes(), txn_id.as_bytes()]);

        // If there's no entry, this is a new transaction
        self.roomtxnid_eventid
            .get(&key)?
            .map(|bytes| {
                EventId::parse(utils::string_from_bytes(&bytes)?)
                    .map_err(|_| TimelineError::bad_database("Invalid event id in roomtxnid_eventid."))
            })
            .transpose()
    }
}
