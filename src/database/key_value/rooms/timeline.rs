use matrixon_timeline_core::{TimelineError, Token};
use ruma::{EventId, OwnedRoomId, RoomId};

use crate::{
    database::KeyValueDatabase,
    service::{self, rooms::timeline::TimelineCount},
    utils, Result,
};

const COUNTER: &[u8] = b"c";
const BACKFILL_COUNTER: &[u8] = b"backfill";
const SYNC_TOKEN: &[u8] = b"sync_token";

impl service::rooms::timeline::Data for KeyValueDatabase {
    fn load_snapshot(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>> {
        self.roomid_timeline.get(room_id.as_bytes())
    }

    fn save_snapshot(&self, room_id: &RoomId, snapshot: &[u8]) -> Result<()> {
        self.roomid_timeline.insert(room_id.as_bytes(), snapshot)
    }

    fn known_rooms(&self) -> Result<Vec<OwnedRoomId>> {
        self.roomid_timeline
            .iter()
            .map(|(key, _)| {
                let room_id = utils::string_from_bytes(&key)?;
                RoomId::parse(room_id)
                    .map_err(|_| TimelineError::bad_database("Invalid room id in roomid_timeline."))
            })
            .collect()
    }

    fn next_count(&self) -> Result<u64> {
        utils::u64_from_bytes(&self.global.increment(COUNTER)?)
    }

    fn next_backfill_count(&self) -> Result<u64> {
        utils::u64_from_bytes(&self.global.increment(BACKFILL_COUNTER)?)
    }

    fn event_count(&self, event_id: &EventId) -> Result<Option<TimelineCount>> {
        self.eventid_count
            .get(event_id.as_bytes())?
            .map(|bytes| TimelineCount::from_bytes(&bytes))
            .transpose()
    }

    fn set_event_count(&self, event_id: &EventId, count: TimelineCount) -> Result<()> {
        self.eventid_count
            .insert(event_id.as_bytes(), &count.to_bytes())
    }

    fn sync_token(&self) -> Result<Option<Token>> {
        self.global
            .get(SYNC_TOKEN)?
            .map(|bytes| utils::string_from_bytes(&bytes).map(Token::from))
            .transpose()
    }

    fn set_sync_token(&self, token: &Token) -> Result<()> {
        self.global.insert(SYNC_TOKEN, token.as_str().as_bytes())
    }
}
