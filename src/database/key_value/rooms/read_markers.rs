use std::collections::BTreeMap;

use matrixon_timeline_core::TimelineError;
use ruma::{EventId, OwnedEventId, OwnedUserId, RoomId, UserId};

use crate::{
    database::{join_key, prefix_key, KeyValueDatabase},
    service::{self, rooms::read_markers::ReadMarkers},
    utils, Result,
};

impl service::rooms::read_markers::Data for KeyValueDatabase {
    fn read_markers(&self, room_id: &RoomId) -> Result<ReadMarkers> {
        self.roomid_readmarkers
            .get(room_id.as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| TimelineError::bad_database("Invalid markers in roomid_readmarkers."))
            })
            .transpose()
            .map(Option::unwrap_or_default)
    }

    fn set_read_markers(&self, room_id: &RoomId, markers: &ReadMarkers) -> Result<()> {
        self.roomid_readmarkers
            .insert(room_id.as_bytes(), &serde_json::to_vec(markers)?)
    }

    fn set_receipt(&self, room_id: &RoomId, user_id: &UserId, event_id: &EventId) -> Result<()> {
        let key = join_key(&[room_id.as_bytes(), user_id.as_bytes()]);
        self.roomuserid_receipt.insert(&key, event_id.as_bytes())
    }

    fn receipts(&self, room_id: &RoomId) -> Result<BTreeMap<OwnedUserId, OwnedEventId>> {
        let prefix = prefix_key(&[room_id.as_bytes()]);
        self.roomuserid_receipt
            .scan_prefix(prefix.clone())
            .map(|(key, value)| {
                let user_id = UserId::parse(utils::string_from_bytes(&key[prefix.len()..])?)
                    .map_err(|_| TimelineError::bad_database("Invalid user id in roomuserid_receipt."))?;
                let event_id = EventId::parse(utils::string_from_bytes(&value)?)
                    .map_err(|_| TimelineError::bad_database("Invalid event id in roomuserid_receipt."))?;
                Ok((user_id, event_id))
            })
            .collect()
    }
}
