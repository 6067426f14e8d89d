use std::collections::BTreeMap;

use matrixon_timeline_core::TagInfo;
use ruma::RoomId;

use crate::Result;

pub trait Data: Send + Sync {
    fn tags(&self, room_id: &RoomId) -> Result<BTreeMap<String, TagInfo>>;

    fn set_tags(&self, room_id: &RoomId, tags: &BTreeMap<String, TagInfo>) -> Result<()>;
}
