use std::collections::BTreeMap;

use ruma::{EventId, OwnedEventId, OwnedUserId, RoomId, UserId};

use super::ReadMarkers;
use crate::Result;

pub trait Data: Send + Sync {
    /// Own markers of a room; defaults when none were ever set.
    fn read_markers(&self, room_id: &RoomId) -> Result<ReadMarkers>;

    fn set_read_markers(&self, room_id: &RoomId, markers: &ReadMarkers) -> Result<()>;

    /// Records the latest public receipt of a room member.
    fn set_receipt(&self, room_id: &RoomId, user_id: &UserId, event_id: &EventId) -> Result<()>;

    fn receipts(&self, room_id: &RoomId) -> Result<BTreeMap<OwnedUserId, OwnedEventId>>;
}
