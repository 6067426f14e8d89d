use matrixon_timeline_core::TimelineError;
use ruma::RoomId;

use crate::{
    database::{join_key, prefix_key, KeyValueDatabase},
    service::{self, rooms::state::StateEntry},
    utils, Result,
};

impl service::rooms::state::Data for KeyValueDatabase {
    fn state_entry(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Result<Option<StateEntry>> {
        let key = join_key(&[room_id.as_bytes(), kind.as_bytes(), state_key.as_bytes()]);
        self.roomstatekey_event
            .get(&key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| TimelineError::bad_database("Invalid entry in roomstatekey_event."))
            })
            .transpose()
    }

    fn set_state_entry(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
        entry: &StateEntry,
    ) -> Result<()> {
        let key = join_key(&[room_id.as_bytes(), kind.as_bytes(), state_key.as_bytes()]);
        self.roomstatekey_event.insert(&key, &serde_json::to_vec(entry)?)
    }

    fn room_state(&self, room_id: &RoomId) -> Result<Vec<(String, String, StateEntry)>> {
        let prefix = prefix_key(&[room_id.as_bytes()]);
        self.roomstatekey_event
            .scan_prefix(prefix.clone())
            .map(|(key, value)| {
                let mut parts = key[prefix.len()..].splitn(2, |&b| b == 0xff);
                let kind = parts
                    .next()
                    .ok_or_else(|| TimelineError::bad_database("State key without a type."))?;
                let state_key = parts
                    .next()
                    .ok_or_else(|| TimelineError::bad_database("State key without a state key."))?;
                let entry = serde_json::from_slice(&value)
                    .map_err(|_| TimelineError::bad_database("Invalid entry in roomstatekey_event."))?;
                Ok((
                    utils::string_from_bytes(kind)?,
                    utils::string_from_bytes(state_key)?,
                    entry,
                ))
            })
            .collect()
    }
}
