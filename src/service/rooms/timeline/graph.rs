use std::{cmp::Ordering, collections::HashMap};

use matrixon_timeline_core::{ChunkId, Direction, TimelineError};
use ruma::{EventId, OwnedEventId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::{TimelineChunk, TimelineCount};
use crate::Result;

/// Every chunk known for one room, live chunk last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomTimeline {
    pub room_id: OwnedRoomId,
    chunks: Vec<TimelineChunk>,
    next_chunk_id: u64,

    #[serde(skip)]
    index: HashMap<OwnedEventId, ChunkId>,
}

impl RoomTimeline {
    pub fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            chunks: Vec::new(),
            next_chunk_id: 1,
            index: HashMap::new(),
        }
    }

    /// Restores a persisted timeline. Snapshots that do not decode or break
    /// the graph invariants are rejected so the caller can cold start.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        let mut timeline: Self = serde_json::from_slice(bytes)?;
        for chunk in &mut timeline.chunks {
            chunk.rebuild_members();
        }
        timeline.rebuild_index()?;
        timeline
            .check_invariants()
            .map_err(|e| TimelineError::InvalidState(format!("corrupt timeline snapshot: {e}")))?;
        Ok(timeline)
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        self.index.clear();
        for chunk in &self.chunks {
            for event_id in chunk.events() {
                if self.index.insert(event_id.clone(), chunk.chunk_id).is_some() {
                    return Err(TimelineError::InvalidState(format!(
                        "{event_id} appears in more than one chunk"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn chunks(&self) -> &[TimelineChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, chunk_id: ChunkId) -> Option<&TimelineChunk> {
        self.chunks.iter().find(|chunk| chunk.chunk_id == chunk_id)
    }

    /// Mutable access for token bookkeeping. Event membership must only
    /// change through `take_chunk` / `place_chunk` so the index stays exact.
    pub(crate) fn chunk_mut(&mut self, chunk_id: ChunkId) -> Option<&mut TimelineChunk> {
        self.chunks.iter_mut().find(|chunk| chunk.chunk_id == chunk_id)
    }

    pub fn live_chunk(&self) -> Option<&TimelineChunk> {
        self.chunks.last().filter(|chunk| chunk.is_last_forward)
    }

    pub(crate) fn live_chunk_mut(&mut self) -> Option<&mut TimelineChunk> {
        self.chunks.last_mut().filter(|chunk| chunk.is_last_forward)
    }

    /// The live chunk, or the most recently placed chunk when the room has
    /// none.
    pub fn newest_chunk(&self) -> Option<&TimelineChunk> {
        self.chunks.last()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.index.contains_key(event_id)
    }

    pub fn chunk_of(&self, event_id: &EventId) -> Option<ChunkId> {
        self.index.get(event_id).copied()
    }

    pub fn position(&self, event_id: &EventId) -> Option<(ChunkId, usize)> {
        let chunk_id = self.chunk_of(event_id)?;
        let index = self.chunk(chunk_id)?.position(event_id)?;
        Some((chunk_id, index))
    }

    /// Orders two events when their relative position is provable, i.e. both
    /// live in the same chunk.
    pub fn compare_positions(&self, a: &EventId, b: &EventId) -> Option<Ordering> {
        let (chunk_a, index_a) = self.position(a)?;
        let (chunk_b, index_b) = self.position(b)?;
        (chunk_a == chunk_b).then(|| index_a.cmp(&index_b))
    }

    /// Orders two events by server order where the graph proves it: both in
    /// one chunk, or exactly one in the live chunk. The live chunk runs
    /// unbroken up to the head of the room, so every event outside it is
    /// older than all of its events.
    pub fn order_events(&self, a: &EventId, b: &EventId) -> Option<Ordering> {
        let (chunk_a, index_a) = self.position(a)?;
        let (chunk_b, index_b) = self.position(b)?;
        if chunk_a == chunk_b {
            return Some(index_a.cmp(&index_b));
        }

        let live = self.live_chunk()?.chunk_id;
        if chunk_a == live {
            Some(Ordering::Greater)
        } else if chunk_b == live {
            Some(Ordering::Less)
        } else {
            None
        }
    }

    /// Server order of two stamped events: graph order where provable, the
    /// stamps otherwise.
    pub fn cmp_recency(
        &self,
        (a, count_a): (&EventId, TimelineCount),
        (b, count_b): (&EventId, TimelineCount),
    ) -> Ordering {
        self.order_events(a, b).unwrap_or_else(|| count_a.cmp(&count_b))
    }

    pub fn event_count(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn allocate_chunk_id(&mut self) -> ChunkId {
        let chunk_id = ChunkId(self.next_chunk_id);
        self.next_chunk_id += 1;
        chunk_id
    }

    /// Returns the chunk a first pagination should grow from, creating an
    /// empty head chunk for a room nothing is known about yet.
    pub(crate) fn ensure_anchor_chunk(&mut self) -> ChunkId {
        if let Some(chunk) = self.newest_chunk() {
            return chunk.chunk_id;
        }

        let mut chunk = TimelineChunk::new(self.allocate_chunk_id());
        chunk.is_last_forward = true;
        let chunk_id = chunk.chunk_id;
        self.chunks.push(chunk);
        chunk_id
    }

    /// Forgets the token of one frontier so the next request fetches a new
    /// one. Other chunks keep their tokens.
    pub(crate) fn reset_frontier(&mut self, chunk_id: ChunkId, direction: Direction) {
        match self.chunk_mut(chunk_id) {
            Some(chunk) => chunk.set_token(direction, None),
            None => warn!(%chunk_id, "Frontier reset for a chunk that no longer exists"),
        }
    }

    /// Removes a chunk from the graph and unindexes its events.
    pub(crate) fn take_chunk(&mut self, chunk_id: ChunkId) -> Option<TimelineChunk> {
        let position = self.chunks.iter().position(|c| c.chunk_id == chunk_id)?;
        let chunk = self.chunks.remove(position);
        for event_id in chunk.events() {
            self.index.remove(event_id);
        }
        Some(chunk)
    }

    /// Inserts a chunk. A live chunk goes last and strips the live flag from
    /// every other chunk; an empty former live chunk is dropped. Other chunks
    /// go right before the live one.
    pub(crate) fn place_chunk(&mut self, chunk: TimelineChunk) {
        for event_id in chunk.events() {
            if let Some(previous) = self.index.insert(event_id.clone(), chunk.chunk_id) {
                error!(%event_id, %previous, chunk_id = %chunk.chunk_id, "Event placed in two chunks");
                debug_assert!(false, "{event_id} placed in {previous} and {}", chunk.chunk_id);
            }
        }

        if chunk.is_last_forward {
            self.chunks.retain(|other| {
                let tokenless = other.prev_token.is_none() && other.next_token.is_none();
                !(other.is_empty() && (other.is_last_forward || tokenless))
            });
            for other in &mut self.chunks {
                other.is_last_forward = false;
            }
            self.chunks.push(chunk);
        } else {
            let position = match self.chunks.last() {
                Some(last) if last.is_last_forward => self.chunks.len() - 1,
                _ => self.chunks.len(),
            };
            self.chunks.insert(position, chunk);
        }
    }

    /// Verifies the graph's structural invariants.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let live: Vec<_> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.is_last_forward)
            .collect();
        if live.len() > 1 {
            return Err(format!("{} chunks are marked live", live.len()));
        }
        if let Some((position, chunk)) = live.first() {
            if *position + 1 != self.chunks.len() {
                return Err(format!("live {} is not the last chunk", chunk.chunk_id));
            }
        }

        let mut seen = HashMap::new();
        for chunk in &self.chunks {
            if chunk.chunk_id.0 >= self.next_chunk_id {
                return Err(format!("{} was never allocated", chunk.chunk_id));
            }
            for event_id in chunk.events() {
                if let Some(other) = seen.insert(event_id, chunk.chunk_id) {
                    return Err(format!("{event_id} is in {other} and {}", chunk.chunk_id));
                }
                if self.index.get(event_id) != Some(&chunk.chunk_id) {
                    return Err(format!("index is stale for {event_id}"));
                }
            }
        }
        if seen.len() != self.index.len() {
            return Err("index holds events no chunk contains".to_owned());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixon_timeline_core::Token;
    use ruma::room_id;

    fn id(name: &str) -> OwnedEventId {
        EventId::parse(format!("${name}")).unwrap()
    }

    fn chunk(timeline: &mut RoomTimeline, names: &[&str], live: bool) -> ChunkId {
        let mut chunk = TimelineChunk::new(timeline.allocate_chunk_id());
        chunk.append(names.iter().map(|n| id(n)), None);
        chunk.is_last_forward = live;
        let chunk_id = chunk.chunk_id;
        timeline.place_chunk(chunk);
        chunk_id
    }

    #[test]
    fn test_live_chunk_is_kept_last() {
        let mut timeline = RoomTimeline::new(room_id!("!r:example.org").to_owned());
        let live = chunk(&mut timeline, &["e5", "e6"], true);
        let old = chunk(&mut timeline, &["e1", "e2"], false);

        assert_eq!(timeline.chunks().len(), 2);
        assert_eq!(timeline.live_chunk().map(|c| c.chunk_id), Some(live));
        assert_eq!(timeline.chunks()[0].chunk_id, old);
        timeline.check_invariants().unwrap();

        let new_live = chunk(&mut timeline, &["e9"], true);
        assert_eq!(timeline.live_chunk().map(|c| c.chunk_id), Some(new_live));
        assert!(!timeline.chunk(live).unwrap().is_last_forward);
        timeline.check_invariants().unwrap();
    }

    #[test]
    fn test_positions_compare_only_within_a_chunk() {
        let mut timeline = RoomTimeline::new(room_id!("!r:example.org").to_owned());
        let live = chunk(&mut timeline, &["e5", "e6"], true);
        chunk(&mut timeline, &["e1"], false);

        assert_eq!(timeline.position(&id("e6")), Some((live, 1)));
        assert_eq!(timeline.compare_positions(&id("e5"), &id("e6")), Some(Ordering::Less));
        assert_eq!(timeline.compare_positions(&id("e1"), &id("e6")), None);
        assert!(timeline.chunk_of(&id("e1")).is_some());
        assert_eq!(timeline.event_count(), 3);
    }

    #[test]
    fn test_live_chunk_outranks_older_chunks() {
        let mut timeline = RoomTimeline::new(room_id!("!r:example.org").to_owned());
        chunk(&mut timeline, &["e30", "e31"], true);
        chunk(&mut timeline, &["e5"], false);
        chunk(&mut timeline, &["e1"], false);

        assert_eq!(timeline.order_events(&id("e5"), &id("e30")), Some(Ordering::Less));
        assert_eq!(timeline.order_events(&id("e31"), &id("e30")), Some(Ordering::Greater));
        assert_eq!(timeline.order_events(&id("e1"), &id("e5")), None);
        assert_eq!(timeline.order_events(&id("e1"), &id("unknown")), None);

        // The stamps would rank e30 older; the graph knows better.
        assert_eq!(
            timeline.cmp_recency(
                (&*id("e30"), TimelineCount::Backfilled(9)),
                (&*id("e5"), TimelineCount::Backfilled(2)),
            ),
            Ordering::Greater
        );
        assert_eq!(
            timeline.cmp_recency(
                (&*id("e1"), TimelineCount::Backfilled(9)),
                (&*id("e5"), TimelineCount::Backfilled(2)),
            ),
            Ordering::Less
        );
    }

    #[test]
    fn test_take_chunk_unindexes_events() {
        let mut timeline = RoomTimeline::new(room_id!("!r:example.org").to_owned());
        let old = chunk(&mut timeline, &["e1", "e2"], false);
        let taken = timeline.take_chunk(old).unwrap();
        assert_eq!(taken.len(), 2);
        assert!(!timeline.contains(&id("e1")));
        timeline.check_invariants().unwrap();
    }

    #[test]
    fn test_anchor_chunk_and_frontier_reset() {
        let mut timeline = RoomTimeline::new(room_id!("!r:example.org").to_owned());
        let anchor = timeline.ensure_anchor_chunk();
        assert_eq!(timeline.ensure_anchor_chunk(), anchor);
        assert!(timeline.live_chunk().is_some());

        timeline.chunk_mut(anchor).unwrap().prev_token = Some(Token::new("t1"));
        timeline.reset_frontier(anchor, Direction::Backward);
        assert_eq!(timeline.chunk(anchor).unwrap().prev_token, None);
    }

    #[test]
    fn test_snapshot_restores_index() {
        let mut timeline = RoomTimeline::new(room_id!("!r:example.org").to_owned());
        chunk(&mut timeline, &["e1", "e2"], true);
        let bytes = timeline.snapshot().unwrap();

        let restored = RoomTimeline::from_snapshot(&bytes).unwrap();
        assert!(restored.contains(&id("e2")));
        assert_eq!(restored.chunks(), timeline.chunks());
        assert!(RoomTimeline::from_snapshot(b"{not json").is_err());
    }
}
