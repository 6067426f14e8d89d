//! Core types for the Matrixon timeline engine
//!
//! This module defines the records exchanged between the engine, its
//! collaborators and the UI-facing observers: timeline events, pagination
//! tokens, the sync/page/context payloads delivered by the transport, and the
//! diffs emitted after every structural change.
//!
//! Identifiers reuse the ruma owned id types so that malformed ids are
//! rejected at the edge instead of deep inside the merge algorithm.

use std::{collections::BTreeMap, fmt};

use ruma::{
    events::TimelineEventType, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId,
    OwnedTransactionId, OwnedUserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Opaque server-issued cursor marking a position in room history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Pagination direction, relative to the room's server ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards older events.
    Backward,
    /// Towards newer events.
    Forward,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Backward => Direction::Forward,
            Direction::Forward => Direction::Backward,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Backward => f.write_str("b"),
            Direction::Forward => f.write_str("f"),
        }
    }
}

/// Identifier of a chunk inside one room's chunk graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// Marker attached to events the decryption collaborator could not decrypt.
///
/// The event keeps its position in the timeline; a later successful
/// re-decryption replaces it in place.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("unable to decrypt event: {reason}")]
pub struct DecryptionFailure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl DecryptionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Server-provided data that is not part of the signed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsigned {
    /// Idempotency key of an event sent by this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<OwnedTransactionId>,
    /// Redaction that stripped this event's content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_because: Option<OwnedEventId>,
}

impl Unsigned {
    pub fn is_empty(&self) -> bool {
        self.transaction_id.is_none() && self.redacted_because.is_none()
    }
}

/// How an event relates to the event it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    /// Reaction (`m.annotation`) carrying the reaction key.
    Annotation { key: String },
    /// Edit (`m.replace`).
    Replace,
    /// Thread reply (`m.thread`).
    Thread,
    /// Any other relation type.
    Reference,
    /// Redaction of the target.
    Redaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub event_id: OwnedEventId,
    pub kind: RelationKind,
}

impl Relation {
    pub fn annotation(event_id: OwnedEventId, key: impl Into<String>) -> Self {
        Self {
            event_id,
            kind: RelationKind::Annotation { key: key.into() },
        }
    }

    pub fn replace(event_id: OwnedEventId) -> Self {
        Self {
            event_id,
            kind: RelationKind::Replace,
        }
    }

    /// The `m.relates_to` object for this relation.
    pub fn to_content(&self) -> Value {
        match &self.kind {
            RelationKind::Annotation { key } => json!({
                "rel_type": "m.annotation",
                "event_id": self.event_id,
                "key": key,
            }),
            RelationKind::Replace => json!({ "rel_type": "m.replace", "event_id": self.event_id }),
            RelationKind::Thread => json!({ "rel_type": "m.thread", "event_id": self.event_id }),
            RelationKind::Reference | RelationKind::Redaction => {
                json!({ "rel_type": "m.reference", "event_id": self.event_id })
            }
        }
    }
}

/// Immutable timeline record. Identity is `event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub sender: OwnedUserId,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Unsigned::is_empty")]
    pub unsigned: Unsigned,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption_failure: Option<DecryptionFailure>,
}

impl Event {
    pub fn new(
        event_id: OwnedEventId,
        room_id: OwnedRoomId,
        kind: TimelineEventType,
        sender: OwnedUserId,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        content: Value,
    ) -> Self {
        Self {
            event_id,
            room_id,
            kind,
            sender,
            origin_server_ts,
            content,
            state_key: None,
            unsigned: Unsigned::default(),
            decryption_failure: None,
        }
    }

    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: OwnedTransactionId) -> Self {
        self.unsigned.transaction_id = Some(transaction_id);
        self
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn is_redacted(&self) -> bool {
        self.unsigned.redacted_because.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.kind == TimelineEventType::RoomEncrypted
    }

    pub fn transaction_id(&self) -> Option<&OwnedTransactionId> {
        self.unsigned.transaction_id.as_ref()
    }

    /// Parses the relation this event carries, if any.
    ///
    /// Redactions point at their target through `redacts`; every other
    /// relation lives in `m.relates_to`.
    pub fn relation(&self) -> Option<Relation> {
        if self.kind == TimelineEventType::RoomRedaction {
            let target = self.content.get("redacts").and_then(Value::as_str)?;
            return Some(Relation {
                event_id: EventId::parse(target).ok()?,
                kind: RelationKind::Redaction,
            });
        }

        let relates_to = self.content.get("m.relates_to")?;
        let event_id = EventId::parse(relates_to.get("event_id")?.as_str()?).ok()?;
        let kind = match relates_to.get("rel_type").and_then(Value::as_str) {
            Some("m.annotation") => RelationKind::Annotation {
                key: relates_to
                    .get("key")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            },
            Some("m.replace") => RelationKind::Replace,
            Some("m.thread") => RelationKind::Thread,
            _ => RelationKind::Reference,
        };

        Some(Relation { event_id, kind })
    }

    pub fn relates_to_id(&self) -> Option<OwnedEventId> {
        self.relation().map(|relation| relation.event_id)
    }

    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

/// Timeline part of a room's sync delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineSlice {
    /// New events in server order, oldest first.
    #[serde(default)]
    pub events: Vec<Event>,
    /// The server skipped events between the previous cursor and `events`.
    #[serde(default)]
    pub limited: bool,
    /// Token to paginate backwards from the first event of `events`.
    #[serde(default)]
    pub prev_batch: Option<Token>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ephemeral {
    /// Full replacement of the typing set, when present.
    #[serde(default)]
    pub typing: Option<Vec<OwnedUserId>>,
    /// Latest read receipt per user.
    #[serde(default)]
    pub receipts: BTreeMap<OwnedUserId, OwnedEventId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomAccountData {
    #[serde(default)]
    pub fully_read: Option<OwnedEventId>,
    /// Full replacement of the room's tags, when present.
    #[serde(default)]
    pub tags: Option<BTreeMap<String, TagInfo>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoomUpdate {
    #[serde(default)]
    pub timeline: TimelineSlice,
    /// State deltas preceding the timeline slice.
    #[serde(default)]
    pub state: Vec<Event>,
    #[serde(default)]
    pub ephemeral: Ephemeral,
    #[serde(default)]
    pub account_data: RoomAccountData,
}

/// One incremental sync delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: Token,
    #[serde(default)]
    pub rooms: BTreeMap<OwnedRoomId, JoinedRoomUpdate>,
}

/// One page of room history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    /// The token the page was requested from.
    pub start: Token,
    /// Token to continue in the same direction; `None` when history is
    /// exhausted in that direction.
    #[serde(default)]
    pub end: Option<Token>,
    /// Events in the requested direction: newest first when paginating
    /// backwards, oldest first when paginating forwards.
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub state: Vec<Event>,
}

/// Events surrounding an arbitrary event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub event: Event,
    /// Newest first.
    #[serde(default)]
    pub events_before: Vec<Event>,
    /// Oldest first.
    #[serde(default)]
    pub events_after: Vec<Event>,
    /// Token to paginate backwards from the oldest returned event.
    #[serde(default)]
    pub start: Option<Token>,
    /// Token to paginate forwards from the newest returned event.
    #[serde(default)]
    pub end: Option<Token>,
    #[serde(default)]
    pub state: Vec<Event>,
}

/// Lifecycle of a locally originated event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SendState {
    Pending,
    SentAwaitingSync { event_id: OwnedEventId },
    ServerConfirmed { event_id: OwnedEventId },
    Failed { reason: String },
}

impl SendState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SendState::ServerConfirmed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SendState::Failed { .. })
    }
}

/// An outgoing event before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDraft {
    pub kind: TimelineEventType,
    pub content: Value,
}

impl LocalDraft {
    pub fn new(kind: TimelineEventType, content: Value) -> Self {
        Self { kind, content }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(
            TimelineEventType::RoomMessage,
            json!({ "msgtype": "m.text", "body": body.into() }),
        )
    }

    pub fn reaction(target: OwnedEventId, key: impl Into<String>) -> Self {
        let relation = Relation::annotation(target, key);
        Self::new(
            TimelineEventType::Reaction,
            json!({ "m.relates_to": relation.to_content() }),
        )
    }

    pub fn edit(target: OwnedEventId, new_body: impl Into<String>) -> Self {
        let new_body = new_body.into();
        let relation = Relation::replace(target);
        Self::new(
            TimelineEventType::RoomMessage,
            json!({
                "msgtype": "m.text",
                "body": format!("* {new_body}"),
                "m.new_content": { "msgtype": "m.text", "body": new_body },
                "m.relates_to": relation.to_content(),
            }),
        )
    }
}

/// What produced a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOrigin {
    Sync,
    Pagination(Direction),
    Context,
    LocalEcho,
    Decryption,
}

/// A current-state entry that changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub kind: TimelineEventType,
    pub state_key: String,
    pub event_id: OwnedEventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<OwnedEventId>,
}

/// A confirmed event that took the place of a local echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superseded {
    pub transaction_id: OwnedTransactionId,
    pub placeholder_id: OwnedEventId,
    pub event: Event,
}

/// Minimal description of the visible changes of one mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineDiff {
    pub room_id: OwnedRoomId,
    pub origin: DiffOrigin,
    /// Newly visible events, in insertion order.
    #[serde(default)]
    pub inserted: Vec<Event>,
    /// Events whose content changed (edits, redactions, re-decryption,
    /// local echo state changes).
    #[serde(default)]
    pub updated: Vec<Event>,
    /// Local echoes replaced in place by their confirmed event.
    #[serde(default)]
    pub superseded: Vec<Superseded>,
    /// Discarded local echoes.
    #[serde(default)]
    pub removed: Vec<OwnedEventId>,
    #[serde(default)]
    pub state_changes: Vec<StateChange>,
}

impl TimelineDiff {
    pub fn new(room_id: OwnedRoomId, origin: DiffOrigin) -> Self {
        Self {
            room_id,
            origin,
            inserted: Vec::new(),
            updated: Vec::new(),
            superseded: Vec::new(),
            removed: Vec::new(),
            state_changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.superseded.is_empty()
            && self.removed.is_empty()
            && self.state_changes.is_empty()
    }
}
