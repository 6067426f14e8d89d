use std::collections::{HashSet, VecDeque};

use matrixon_timeline_core::{ChunkId, Direction, Token};
use ruma::{EventId, OwnedEventId};
use serde::{Deserialize, Serialize};
use tracing::error;

/// A contiguous run of room history, oldest event first.
///
/// `prev_token` continues the run backwards, `next_token` forwards. A missing
/// `prev_token` on a chunk that has not reached the start of the room means
/// the run was obtained without a backward token; one has to be fetched
/// before the chunk can grow backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineChunk {
    pub chunk_id: ChunkId,
    events: VecDeque<OwnedEventId>,
    pub prev_token: Option<Token>,
    pub next_token: Option<Token>,
    /// This chunk ends at the current head of the room.
    pub is_last_forward: bool,
    /// This chunk starts at the creation of the room.
    pub is_last_backward: bool,

    #[serde(skip)]
    members: HashSet<OwnedEventId>,
}

impl TimelineChunk {
    pub fn new(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            events: VecDeque::new(),
            prev_token: None,
            next_token: None,
            is_last_forward: false,
            is_last_backward: false,
            members: HashSet::new(),
        }
    }

    /// Rebuilds the membership set after deserialization.
    pub(super) fn rebuild_members(&mut self) {
        self.members = self.events.iter().cloned().collect();
    }

    pub fn events(&self) -> impl DoubleEndedIterator<Item = &OwnedEventId> + ExactSizeIterator {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first(&self) -> Option<&OwnedEventId> {
        self.events.front()
    }

    pub fn last(&self) -> Option<&OwnedEventId> {
        self.events.back()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.members.contains(event_id)
    }

    pub fn position(&self, event_id: &EventId) -> Option<usize> {
        if !self.contains(event_id) {
            return None;
        }
        self.events.iter().position(|id| id == event_id)
    }

    /// Boundary token on the given side.
    pub fn token(&self, direction: Direction) -> Option<&Token> {
        match direction {
            Direction::Backward => self.prev_token.as_ref(),
            Direction::Forward => self.next_token.as_ref(),
        }
    }

    pub fn set_token(&mut self, direction: Direction, token: Option<Token>) {
        match direction {
            Direction::Backward => self.prev_token = token,
            Direction::Forward => self.next_token = token,
        }
    }

    /// Nothing more exists in that direction.
    pub fn is_exhausted(&self, direction: Direction) -> bool {
        match direction {
            Direction::Backward => self.is_last_backward,
            Direction::Forward => self.is_last_forward,
        }
    }

    /// Extends the chunk into the past. `events` come newest first, each
    /// older than the current first event. Ids already in the chunk are
    /// rejected and returned.
    pub fn prepend(
        &mut self,
        events: impl IntoIterator<Item = OwnedEventId>,
        new_prev_token: Option<Token>,
    ) -> Vec<OwnedEventId> {
        let mut rejected = Vec::new();
        for event_id in events {
            if self.members.insert(event_id.clone()) {
                self.events.push_front(event_id);
            } else {
                rejected.push(event_id);
            }
        }
        self.prev_token = new_prev_token;
        self.report_rejected(&rejected);
        rejected
    }

    /// Extends the chunk into the future. `events` come oldest first, each
    /// newer than the current last event. Ids already in the chunk are
    /// rejected and returned.
    pub fn append(
        &mut self,
        events: impl IntoIterator<Item = OwnedEventId>,
        new_next_token: Option<Token>,
    ) -> Vec<OwnedEventId> {
        let mut rejected = Vec::new();
        for event_id in events {
            if self.members.insert(event_id.clone()) {
                self.events.push_back(event_id);
            } else {
                rejected.push(event_id);
            }
        }
        self.next_token = new_next_token;
        self.report_rejected(&rejected);
        rejected
    }

    pub(crate) fn take_events(&mut self) -> Vec<OwnedEventId> {
        self.members.clear();
        self.events.drain(..).collect()
    }

    fn report_rejected(&self, rejected: &[OwnedEventId]) {
        if !rejected.is_empty() {
            error!(chunk_id = %self.chunk_id, ?rejected, "Rejected duplicate events in chunk");
        }
        debug_assert!(
            rejected.is_empty(),
            "duplicate event ids inserted into {}: {rejected:?}",
            self.chunk_id
        );
    }
}
