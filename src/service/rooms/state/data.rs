use ruma::RoomId;

use super::StateEntry;
use crate::Result;

pub trait Data: Send + Sync {
    fn state_entry(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Result<Option<StateEntry>>;

    fn set_state_entry(
        &self,
        room_id: &RoomId,
        kind: &str,
        state_key: &str,
        entry: &StateEntry,
    ) -> Result<()>;

    /// Every current `(type, state_key, entry)` of the room.
    fn room_state(&self, room_id: &RoomId) -> Result<Vec<(String, String, StateEntry)>>;
}
