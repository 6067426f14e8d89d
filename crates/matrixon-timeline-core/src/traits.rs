//! Collaborator traits for the Matrixon timeline engine
//!
//! The engine never talks to the network or to a crypto store directly. It is
//! handed a `Transport` and a `Decryptor` at construction time and reaches the
//! outside world only through them.

use std::time::Duration;

use async_trait::async_trait;
use ruma::{events::TimelineEventType, EventId, OwnedEventId, RoomId, TransactionId};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    types::{ContextResponse, DecryptionFailure, Direction, Event, PageResponse, SyncResponse, TagInfo, Token},
};

/// Network side of the engine.
///
/// Every call may fail with a `TransportError`; the engine decides what a
/// failure means for its state machines.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Incremental sync delta since `since` (`None` for the first sync).
    async fn fetch_sync_delta(&self, since: Option<&Token>) -> Result<SyncResponse, TransportError>;

    /// One page of history. `from = None` starts at the newest event.
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        from: Option<&Token>,
        direction: Direction,
        limit: u32,
    ) -> Result<PageResponse, TransportError>;

    /// Events around `event_id`. With `limit = 0` only the event and its
    /// surrounding tokens are returned.
    async fn fetch_context(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        limit: u32,
    ) -> Result<ContextResponse, TransportError>;

    /// Sends an event under an idempotency key and returns the server event id.
    async fn submit_event(
        &self,
        room_id: &RoomId,
        kind: &TimelineEventType,
        content: &Value,
        txn_id: &TransactionId,
    ) -> Result<OwnedEventId, TransportError>;

    async fn redact_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        txn_id: &TransactionId,
    ) -> Result<OwnedEventId, TransportError>;

    async fn send_state(
        &self,
        room_id: &RoomId,
        kind: &TimelineEventType,
        state_key: &str,
        content: &Value,
    ) -> Result<OwnedEventId, TransportError>;

    async fn set_read_markers(
        &self,
        room_id: &RoomId,
        fully_read: Option<&EventId>,
        read_receipt: Option<&EventId>,
    ) -> Result<(), TransportError>;

    async fn send_typing(
        &self,
        room_id: &RoomId,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    async fn add_tag(&self, room_id: &RoomId, tag: &str, info: &TagInfo) -> Result<(), TransportError>;

    async fn delete_tag(&self, room_id: &RoomId, tag: &str) -> Result<(), TransportError>;
}

/// Decryption side of the engine.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Returns the decrypted form of `event`. The returned event keeps the
    /// original `event_id`.
    async fn decrypt(&self, event: &Event) -> Result<Event, DecryptionFailure>;
}

/// Decryptor for unencrypted deployments: every event is returned unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDecryptor;

#[async_trait]
impl Decryptor for NoopDecryptor {
    async fn decrypt(&self, event: &Event) -> Result<Event, DecryptionFailure> {
        Ok(event.clone())
    }
}

/// Runs `event` through the decryptor if it needs it.
///
/// Plain events pass through untouched. A failure never drops the event: it is
/// returned with `decryption_failure` set so it keeps its timeline slot.
pub async fn decrypt_or_mark(decryptor: &dyn Decryptor, event: Event) -> Event {
    if !event.is_encrypted() && event.decryption_failure.is_none() {
        return event;
    }

    match decryptor.decrypt(&event).await {
        Ok(mut decrypted) => {
            debug_assert_eq!(decrypted.event_id, event.event_id);
            decrypted.event_id = event.event_id;
            decrypted.room_id = event.room_id;
            decrypted.decryption_failure = None;
            debug!(event_id = %decrypted.event_id, "Decrypted event");
            decrypted
        }
        Err(failure) => {
            warn!(event_id = %event.event_id, reason = %failure.reason, "Failed to decrypt event");
            Event {
                decryption_failure: Some(failure),
                ..event
            }
        }
    }
}
