use matrixon_timeline_core::Token;
use ruma::{EventId, OwnedRoomId, RoomId};

use super::TimelineCount;
use crate::Result;

pub trait Data: Send + Sync {
    /// Serialized `RoomTimeline` of a room, if one was ever saved.
    fn load_snapshot(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>>;

    fn save_snapshot(&self, room_id: &RoomId, snapshot: &[u8]) -> Result<()>;

    fn known_rooms(&self) -> Result<Vec<OwnedRoomId>>;

    fn next_count(&self) -> Result<u64>;

    fn next_backfill_count(&self) -> Result<u64>;

    fn event_count(&self, event_id: &EventId) -> Result<Option<TimelineCount>>;

    fn set_event_count(&self, event_id: &EventId, count: TimelineCount) -> Result<()>;

    fn sync_token(&self) -> Result<Option<Token>>;

    fn set_sync_token(&self, token: &Token) -> Result<()>;
}
