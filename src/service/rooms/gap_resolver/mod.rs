// =============================================================================
// Matrixon Timeline - Gap Resolver Module
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
//   Stitches newly fetched runs of events into a room's chunk graph. Runs
//   are connected to existing chunks by an explicit pagination anchor, by
//   shared event ids or by matching boundary tokens, and merged until no
//   chunk is adjacent anymore. A run that connects to nothing becomes a new
//   disconnected chunk, never an error.
//
// =============================================================================

use std::collections::HashSet;

use matrixon_timeline_core::{ChunkId, Direction, Token};
use ruma::OwnedEventId;
use tracing::{debug, error};

use super::timeline::{RoomTimeline, TimelineChunk};

/// The chunk frontier a page was requested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub chunk_id: ChunkId,
    pub direction: Direction,
    /// The chunk's boundary token when the request was issued.
    pub token: Option<Token>,
}

/// A run of events in server order, oldest first, with the tokens bounding
/// it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub events: Vec<OwnedEventId>,
    pub prev_token: Option<Token>,
    pub next_token: Option<Token>,
    pub is_last_forward: bool,
    pub reached_start: bool,
    pub anchor: Option<Anchor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Chunk now holding the run; `None` when there was nothing to place.
    pub chunk_id: Option<ChunkId>,
    /// Ids new to the room, in batch order.
    pub accepted: Vec<OwnedEventId>,
    /// Ids already known to the room or repeated within the batch.
    pub rejected: Vec<OwnedEventId>,
    /// Chunks absorbed into `chunk_id`.
    pub merged: Vec<ChunkId>,
}

pub struct Service;

impl Service {
    /// Applies a batch to the room's graph. Must run under the room lock.
    #[tracing::instrument(skip(self, timeline, batch), fields(room_id = %timeline.room_id, events = batch.events.len()))]
    pub fn resolve(&self, timeline: &mut RoomTimeline, batch: Batch) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();

        let mut seen = HashSet::new();
        let mut events = Vec::with_capacity(batch.events.len());
        for event_id in batch.events {
            if !seen.insert(event_id.clone()) {
                outcome.rejected.push(event_id);
            } else if timeline.contains(&event_id) {
                outcome.rejected.push(event_id.clone());
                events.push(event_id);
            } else {
                outcome.accepted.push(event_id.clone());
                events.push(event_id);
            }
        }

        if events.is_empty() && batch.anchor.is_none() && !batch.is_last_forward {
            debug!("Nothing to place");
            return outcome;
        }

        let mut run = TimelineChunk::new(ChunkId(0));
        run.append(events, batch.next_token);
        run.prev_token = batch.prev_token;
        run.is_last_forward = batch.is_last_forward;
        run.is_last_backward = batch.reached_start;

        let mut involved = Vec::new();

        if let Some(anchor) = batch.anchor {
            match timeline.chunk(anchor.chunk_id) {
                Some(chunk) if chunk.token(anchor.direction) == anchor.token.as_ref() => {
                    if let Some(chunk) = timeline.take_chunk(anchor.chunk_id) {
                        involved.push((chunk.chunk_id, chunk.is_last_forward));
                        run = if shares_events(&chunk, &run) {
                            splice(timeline, chunk, run)
                        } else {
                            match anchor.direction {
                                Direction::Backward => concat(run, chunk),
                                Direction::Forward => concat(chunk, run),
                            }
                        };
                    }
                }
                Some(_) => debug!(chunk_id = %anchor.chunk_id, "Anchor frontier moved, resolving by content"),
                None => debug!(chunk_id = %anchor.chunk_id, "Anchor chunk is gone, resolving by content"),
            }
        }

        while let Some((chunk_id, joined)) = find_neighbour(timeline, &run) {
            let Some(chunk) = timeline.take_chunk(chunk_id) else {
                break;
            };
            involved.push((chunk.chunk_id, chunk.is_last_forward));
            run = match joined {
                Join::Overlap => splice(timeline, chunk, run),
                Join::Before => concat(run, chunk),
                Join::After => concat(chunk, run),
            };
        }

        let chunk_id = involved
            .iter()
            .find(|(_, live)| *live)
            .or_else(|| involved.first())
            .map(|(chunk_id, _)| *chunk_id)
            .unwrap_or_else(|| timeline.allocate_chunk_id());
        run.chunk_id = chunk_id;

        outcome.merged = involved
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| *id != chunk_id)
            .collect();
        outcome.chunk_id = Some(chunk_id);

        debug!(
            %chunk_id,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            merged = ?outcome.merged,
            "Resolved batch"
        );
        timeline.place_chunk(run);

        outcome
    }
}

enum Join {
    Overlap,
    /// The run directly precedes the chunk.
    Before,
    /// The run directly follows the chunk.
    After,
}

fn find_neighbour(timeline: &RoomTimeline, run: &TimelineChunk) -> Option<(ChunkId, Join)> {
    if let Some(chunk_id) = run.events().find_map(|id| timeline.chunk_of(id)) {
        return Some((chunk_id, Join::Overlap));
    }

    if let Some(next) = &run.next_token {
        if let Some(chunk) = timeline
            .chunks()
            .iter()
            .find(|chunk| chunk.prev_token.as_ref() == Some(next))
        {
            return Some((chunk.chunk_id, Join::Before));
        }
    }

    if let Some(prev) = &run.prev_token {
        if let Some(chunk) = timeline
            .chunks()
            .iter()
            .find(|chunk| chunk.next_token.as_ref() == Some(prev))
        {
            return Some((chunk.chunk_id, Join::After));
        }
    }

    None
}

fn shares_events(a: &TimelineChunk, b: &TimelineChunk) -> bool {
    b.events().any(|id| a.contains(id))
}

/// Joins two adjacent runs that share no events. An empty side without a
/// token or flag on its outer boundary defers to the other side there.
fn concat(mut older: TimelineChunk, mut newer: TimelineChunk) -> TimelineChunk {
    let older_blank = older.is_empty() && older.prev_token.is_none() && !older.is_last_backward;
    let (prev_token, is_last_backward) = if older_blank {
        (newer.prev_token.clone(), newer.is_last_backward)
    } else {
        (older.prev_token.clone(), older.is_last_backward)
    };

    let newer_blank = newer.is_empty() && newer.next_token.is_none() && !newer.is_last_forward;
    let (next_token, is_last_forward) = if newer_blank {
        (older.next_token.clone(), older.is_last_forward)
    } else {
        (newer.next_token.clone(), newer.is_last_forward)
    };

    let mut events = older.take_events();
    events.extend(newer.take_events());

    let mut joined = TimelineChunk::new(older.chunk_id);
    joined.append(events, next_token);
    joined.prev_token = prev_token;
    joined.is_last_backward = is_last_backward;
    joined.is_last_forward = is_last_forward;
    joined
}

/// Merges two runs of the same history that share at least one event,
/// aligned on the first shared id. The side reaching further back supplies
/// the older boundary, the side reaching further ahead the newer one.
fn splice(timeline: &mut RoomTimeline, mut existing: TimelineChunk, mut run: TimelineChunk) -> TimelineChunk {
    let existing_events = existing.take_events();
    let run_events = run.take_events();

    let Some((i, j)) = run_events
        .iter()
        .enumerate()
        .find_map(|(j, id)| existing_events.iter().position(|e| e == id).map(|i| (i, j)))
    else {
        // Callers only splice overlapping runs.
        existing.append(existing_events, existing.next_token.clone());
        run.append(run_events, run.next_token.clone());
        return concat(existing, run);
    };

    let existing_prefix_wins = i >= j;
    let (prefix, prev_token, prefix_back) = if existing_prefix_wins {
        (
            &existing_events[..i],
            if i == j { existing.prev_token.clone().or(run.prev_token.clone()) } else { existing.prev_token.clone() },
            existing.is_last_backward,
        )
    } else {
        (&run_events[..j], run.prev_token.clone(), run.is_last_backward)
    };

    let existing_suffix = &existing_events[i..];
    let run_suffix = &run_events[j..];
    let existing_suffix_wins = existing_suffix.len() >= run_suffix.len();
    let (suffix, next_token, suffix_forward) = if existing_suffix_wins {
        (
            existing_suffix,
            if existing_suffix.len() == run_suffix.len() {
                existing.next_token.clone().or(run.next_token.clone())
            } else {
                existing.next_token.clone()
            },
            existing.is_last_forward,
        )
    } else {
        (run_suffix, run.next_token.clone(), run.is_last_forward)
    };

    let mut placed = HashSet::new();
    let merged_events: Vec<OwnedEventId> = prefix
        .iter()
        .chain(suffix)
        .filter(|id| placed.insert((*id).clone()))
        .cloned()
        .collect();

    let mut merged = TimelineChunk::new(existing.chunk_id);
    merged.append(merged_events, next_token);
    merged.prev_token = prev_token;
    merged.is_last_backward = prefix_back || existing.is_last_backward || run.is_last_backward;
    merged.is_last_forward = suffix_forward || existing.is_last_forward || run.is_last_forward;

    let leftovers: Vec<OwnedEventId> = existing_events
        .iter()
        .chain(run_events.iter())
        .filter(|id| placed.insert((*id).clone()))
        .cloned()
        .collect();
    if !leftovers.is_empty() {
        error!(?leftovers, "Overlapping runs disagree on history, keeping the rest apart");
        debug_assert!(false, "overlapping runs disagree on history: {leftovers:?}");

        let mut apart = TimelineChunk::new(timeline.allocate_chunk_id());
        apart.append(leftovers, None);
        timeline.place_chunk(apart);
    }

    merged
}
