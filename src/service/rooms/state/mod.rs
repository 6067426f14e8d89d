mod data;

use std::{cmp::Ordering, sync::Arc};

pub use data::Data;

use matrixon_timeline_core::{Event, StateChange, Transport};
use ruma::{events::TimelineEventType, OwnedEventId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::timeline::{RoomTimeline, TimelineCount};
use crate::Result;

/// Current holder of one `(type, state_key)` slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub event_id: OwnedEventId,
    pub count: TimelineCount,
}

/// Current room state, one event per `(type, state_key)`.
///
/// Competing state events are resolved last-writer-wins on server order, as
/// far as the chunk graph can tell it; no state resolution is performed on
/// the client.
pub struct Service {
    pub db: Arc<dyn Data>,
    transport: Arc<dyn Transport>,
}

impl Service {
    pub fn build(db: Arc<dyn Data>, transport: Arc<dyn Transport>) -> Self {
        Self { db, transport }
    }

    /// Records `event` as current state unless a later event already holds
    /// its slot. Call after the event has been placed in `timeline`.
    #[tracing::instrument(skip(self, timeline, event), fields(event_id = %event.event_id))]
    pub fn apply(
        &self,
        timeline: &RoomTimeline,
        event: &Event,
        count: TimelineCount,
    ) -> Result<Option<StateChange>> {
        let Some(state_key) = event.state_key.as_deref() else {
            return Ok(None);
        };
        let kind = event.kind.to_string();

        let previous = self.db.state_entry(&event.room_id, &kind, state_key)?;
        if let Some(current) = &previous {
            let order = timeline.cmp_recency(
                (&*current.event_id, current.count),
                (&*event.event_id, count),
            );
            if current.event_id == event.event_id || order != Ordering::Less {
                debug!(current = %current.event_id, "Keeping newer state");
                return Ok(None);
            }
        }

        self.db.set_state_entry(
            &event.room_id,
            &kind,
            state_key,
            &StateEntry {
                event_id: event.event_id.clone(),
                count,
            },
        )?;

        Ok(Some(StateChange {
            kind: event.kind.clone(),
            state_key: state_key.to_owned(),
            event_id: event.event_id.clone(),
            previous: previous.map(|entry| entry.event_id),
        }))
    }

    pub fn current(&self, room_id: &RoomId, kind: &TimelineEventType, state_key: &str) -> Result<Option<StateEntry>> {
        self.db.state_entry(room_id, &kind.to_string(), state_key)
    }

    pub fn room_state(&self, room_id: &RoomId) -> Result<Vec<(String, String, StateEntry)>> {
        self.db.room_state(room_id)
    }

    /// Sends a state event. The projection changes once the event comes back
    /// through sync.
    #[tracing::instrument(skip(self, content))]
    pub async fn send_state(
        &self,
        room_id: &RoomId,
        kind: &TimelineEventType,
        state_key: &str,
        content: &Value,
    ) -> Result<OwnedEventId> {
        Ok(self.transport.send_state(room_id, kind, state_key, content).await?)
    }
}
