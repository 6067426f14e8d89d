use std::collections::BTreeMap;

use matrixon_timeline_core::{TagInfo, TimelineError};
use ruma::RoomId;

use crate::{database::KeyValueDatabase, service, Result};

impl service::rooms::tags::Data for KeyValueDatabase {
    fn tags(&self, room_id: &RoomId) -> Result<BTreeMap<String, TagInfo>> {
        self.roomid_tags
            .get(room_id.as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| TimelineError::bad_database("Invalid tags in roomid_tags."))
            })
            .transpose()
            .map(Option::unwrap_or_default)
    }

    fn set_tags(&self, room_id: &RoomId, tags: &BTreeMap<String, TagInfo>) -> Result<()> {
        self.roomid_tags
            .insert(room_id.as_bytes(), &serde_json::to_vec(tags)?)
    }
}
