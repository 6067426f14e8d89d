// =============================================================================
// Matrixon Timeline - Timeline Module
// =============================================================================
//
// Project: Matrixon - Gap-aware room timeline engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Owns the chunk graph of every room. Each room's graph sits behind its own
//   async mutex; graph mutations run as synchronous closures so the lock is
//   never held across network I/O. Every mutation persists a snapshot of the
//   room's graph.
//
// =============================================================================

mod chunk;
mod data;
mod diff;
mod graph;

use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt,
    sync::Arc,
};

pub use chunk::TimelineChunk;
pub use data::Data;
pub use diff::DiffBus;
pub use graph::RoomTimeline;

use matrixon_timeline_core::{TimelineError, Token};
use ruma::{EventId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{utils, Result};

/// Server-order stamp of an event.
///
/// Sync-delivered events count up from zero. Backfilled events (pagination,
/// context) count up too, but every backfilled event sorts before every
/// normal one and a larger backfill count is older.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimelineCount {
    Backfilled(u64),
    Normal(u64),
}

impl TimelineCount {
    pub fn min() -> Self {
        Self::Backfilled(u64::MAX)
    }
    pub fn max() -> Self {
        Self::Normal(u64::MAX)
    }

    pub fn try_from_string(token: &str) -> Result<Self> {
        if let Some(stripped) = token.strip_prefix('-') {
            stripped.parse().map(TimelineCount::Backfilled)
        } else {
            token.parse().map(TimelineCount::Normal)
        }
        .map_err(|_| TimelineError::InvalidState(format!("invalid timeline count {token}")))
    }

    pub fn stringify(&self) -> String {
        match self {
            TimelineCount::Backfilled(x) => format!("-{x}"),
            TimelineCount::Normal(x) => x.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let (tag, value) = match self {
            TimelineCount::Backfilled(x) => (0u8, x),
            TimelineCount::Normal(x) => (1u8, x),
        };
        let mut bytes = Vec::with_capacity(9);
        bytes.push(tag);
        bytes.extend_from_slice(&value.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (tag, value) = bytes
            .split_first()
            .ok_or_else(|| TimelineError::bad_database("Empty timeline count."))?;
        let value = utils::u64_from_bytes(value)?;
        match tag {
            0 => Ok(TimelineCount::Backfilled(value)),
            1 => Ok(TimelineCount::Normal(value)),
            _ => Err(TimelineError::bad_database("Unknown timeline count tag.")),
        }
    }
}

impl fmt::Display for TimelineCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

impl PartialOrd for TimelineCount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimelineCount {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TimelineCount::Normal(s), TimelineCount::Normal(o)) => s.cmp(o),
            (TimelineCount::Backfilled(s), TimelineCount::Backfilled(o)) => o.cmp(s),
            (TimelineCount::Normal(_), TimelineCount::Backfilled(_)) => Ordering::Greater,
            (TimelineCount::Backfilled(_), TimelineCount::Normal(_)) => Ordering::Less,
        }
    }
}

pub struct Service {
    pub db: Arc<dyn Data>,

    rooms: RwLock<HashMap<OwnedRoomId, Arc<Mutex<RoomTimeline>>>>,
}

impl Service {
    pub fn build(db: Arc<dyn Data>) -> Self {
        Self {
            db,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// The lock guarding a room's graph, loading the graph on first use.
    pub async fn room(&self, room_id: &RoomId) -> Result<Arc<Mutex<RoomTimeline>>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return Ok(Arc::clone(room));
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(Arc::clone(room));
        }

        let timeline = self.load(room_id)?;
        let room = Arc::new(Mutex::new(timeline));
        rooms.insert(room_id.to_owned(), Arc::clone(&room));
        Ok(room)
    }

    fn load(&self, room_id: &RoomId) -> Result<RoomTimeline> {
        let Some(bytes) = self.db.load_snapshot(room_id)? else {
            debug!(%room_id, "No stored timeline, starting empty");
            return Ok(RoomTimeline::new(room_id.to_owned()));
        };

        match RoomTimeline::from_snapshot(&bytes) {
            Ok(timeline) if timeline.room_id == room_id => {
                info!(%room_id, chunks = timeline.chunks().len(), "✅ Restored room timeline");
                Ok(timeline)
            }
            Ok(timeline) => {
                warn!(%room_id, stored = %timeline.room_id, "Stored timeline belongs to another room, starting empty");
                Ok(RoomTimeline::new(room_id.to_owned()))
            }
            Err(error) => {
                warn!(%room_id, %error, "Stored timeline is unreadable, starting empty");
                Ok(RoomTimeline::new(room_id.to_owned()))
            }
        }
    }

    /// Runs `f` with exclusive access to the room's graph and persists the
    /// result.
    #[tracing::instrument(skip(self, f))]
    pub async fn mutate<T>(
        &self,
        room_id: &RoomId,
        f: impl FnOnce(&mut RoomTimeline) -> T,
    ) -> Result<T> {
        let room = self.room(room_id).await?;
        let mut timeline = room.lock().await;
        let value = f(&mut timeline);

        debug_assert_eq!(timeline.check_invariants(), Ok(()));
        self.db.save_snapshot(room_id, &timeline.snapshot()?)?;
        Ok(value)
    }

    pub async fn read<T>(&self, room_id: &RoomId, f: impl FnOnce(&RoomTimeline) -> T) -> Result<T> {
        let room = self.room(room_id).await?;
        let timeline = room.lock().await;
        Ok(f(&timeline))
    }

    /// Rooms with a stored or loaded graph.
    pub async fn known_rooms(&self) -> Result<Vec<OwnedRoomId>> {
        let mut known = self.db.known_rooms()?;
        for room_id in self.rooms.read().await.keys() {
            if !known.contains(room_id) {
                known.push(room_id.clone());
            }
        }
        known.sort();
        Ok(known)
    }

    /// Stamps an event with its server order unless it already has one.
    pub fn ensure_count(&self, event_id: &EventId, backfilled: bool) -> Result<TimelineCount> {
        if let Some(count) = self.db.event_count(event_id)? {
            return Ok(count);
        }

        let count = if backfilled {
            TimelineCount::Backfilled(self.db.next_backfill_count()?)
        } else {
            TimelineCount::Normal(self.db.next_count()?)
        };
        self.db.set_event_count(event_id, count)?;
        Ok(count)
    }

    pub fn event_count(&self, event_id: &EventId) -> Result<Option<TimelineCount>> {
        self.db.event_count(event_id)
    }

    pub fn sync_token(&self) -> Result<Option<Token>> {
        self.db.sync_token()
    }

    pub fn set_sync_token(&self, token: &Token) -> Result<()> {
        self.db.set_sync_token(token)
    }
}
