#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use matrixon_timeline::{
    core::{Event, JoinedRoomUpdate, NoopDecryptor, PageResponse, SyncResponse, TimelineConfig, TimelineSlice, Token},
    database::KeyValueDatabase,
    transport::ReplayTransport,
    Services,
};
use ruma::{
    events::TimelineEventType, room_id, uint, user_id, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId,
    OwnedRoomId, RoomId,
};
use serde_json::json;

pub fn room() -> OwnedRoomId {
    room_id!("!room:example.org").to_owned()
}

pub fn id(n: u32) -> OwnedEventId {
    EventId::parse(format!("$e{n}")).unwrap()
}

pub fn event(n: u32) -> Event {
    Event::new(
        id(n),
        room(),
        TimelineEventType::RoomMessage,
        user_id!("@alice:example.org").to_owned(),
        MilliSecondsSinceUnixEpoch(uint!(1)),
        json!({ "msgtype": "m.text", "body": format!("message {n}") }),
    )
}

/// Backward page, newest first.
pub fn backward_page(start: &str, end: Option<&str>, range: std::ops::Range<u32>) -> PageResponse {
    PageResponse {
        start: Token::new(start),
        end: end.map(Token::new),
        events: range.rev().map(event).collect(),
        state: Vec::new(),
    }
}

/// Forward page, oldest first.
pub fn forward_page(start: &str, end: Option<&str>, range: std::ops::Range<u32>) -> PageResponse {
    PageResponse {
        start: Token::new(start),
        end: end.map(Token::new),
        events: range.map(event).collect(),
        state: Vec::new(),
    }
}

pub fn delta(next: &str, events: Vec<Event>, limited: bool, prev: Option<&str>) -> SyncResponse {
    let update = JoinedRoomUpdate {
        timeline: TimelineSlice {
            events,
            limited,
            prev_batch: prev.map(Token::new),
        },
        ..Default::default()
    };
    SyncResponse {
        next_batch: Token::new(next),
        rooms: BTreeMap::from([(room(), update)]),
    }
}

pub fn services(transport: Arc<ReplayTransport>) -> Services {
    let db = Arc::new(KeyValueDatabase::in_memory().unwrap());
    let config = TimelineConfig::new(user_id!("@me:example.org").to_owned());
    Services::build(db, config, transport, Arc::new(NoopDecryptor)).unwrap()
}

/// Event ids of every chunk of the room, oldest chunk first.
pub async fn chunks(services: &Services, room_id: &RoomId) -> Vec<Vec<String>> {
    services
        .rooms
        .timeline
        .read(room_id, |timeline| {
            timeline.check_invariants().unwrap();
            timeline
                .chunks()
                .iter()
                .map(|chunk| chunk.events().map(|id| id.as_str().to_owned()).collect())
                .collect()
        })
        .await
        .unwrap()
}

pub fn names(range: std::ops::Range<u32>) -> Vec<String> {
    range.map(|n| format!("$e{n}")).collect()
}

pub async fn live_ids(services: &Services, room_id: &RoomId) -> Vec<String> {
    services
        .live_view(room_id)
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.event.event_id.as_str().to_owned())
        .collect()
}
