mod data;

use std::sync::{Arc, Mutex};

pub use data::Data;

use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use matrixon_timeline_core::{utils::is_local_event_id, Event, TimelineError};
use ruma::{EventId, OwnedEventId, OwnedRoomId};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    utils::stream::{broadcast_stream, OptionalStreamExt},
    Result,
};

/// What a `put` did to the stored copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Unchanged,
    Updated { version: u64 },
}

/// Published whenever an event is inserted or its content changes. Carries
/// the copy that was stored under `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventUpdate {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub version: u64,
    pub event: Event,
}

pub struct Service {
    pub db: Arc<dyn Data>,

    write_lock: Mutex<()>,
    update_sender: broadcast::Sender<EventUpdate>,
}

impl Service {
    pub fn build(db: Arc<dyn Data>, channel_capacity: usize) -> Self {
        let (update_sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            db,
            write_lock: Mutex::new(()),
            update_sender,
        }
    }

    /// Stores an event. Re-putting an identical event is a no-op; a changed
    /// copy bumps the event's version and notifies subscribers.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub fn put(&self, event: &Event) -> Result<PutOutcome> {
        if is_local_event_id(&event.event_id) {
            return Err(TimelineError::InvalidState(format!(
                "local echo {} cannot be stored",
                event.event_id
            )));
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TimelineError::Storage("event store write lock poisoned".to_owned()))?;

        let (outcome, version) = match self.db.get_event(&event.event_id)? {
            Some(existing) if existing == *event => return Ok(PutOutcome::Unchanged),
            Some(_) => {
                let version = self.db.event_version(&event.event_id)?.unwrap_or(1) + 1;
                self.db.put_event(event, version)?;
                (PutOutcome::Updated { version }, version)
            }
            None => {
                self.db.put_event(event, 1)?;
                (PutOutcome::Inserted, 1)
            }
        };
        // A decrypted copy may reveal a relation the ciphertext hid.
        if let Some(relation) = event.relation() {
            self.db.add_relation(&relation.event_id, &event.event_id)?;
        }
        debug!(?outcome, "Stored event");

        // Nobody listening is fine.
        let _ = self.update_sender.send(EventUpdate {
            event_id: event.event_id.clone(),
            room_id: event.room_id.clone(),
            version,
            event: event.clone(),
        });

        Ok(outcome)
    }

    pub fn put_all<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Result<Vec<PutOutcome>> {
        events.into_iter().map(|event| self.put(event)).collect()
    }

    /// Stores an event received from the server. A stored copy wins, since
    /// edits and redactions are applied to it in place, unless it is still
    /// undecrypted and the incoming copy is not.
    pub fn ingest(&self, event: &Event) -> Result<PutOutcome> {
        match self.db.get_event(&event.event_id)? {
            Some(stored)
                if stored.decryption_failure.is_none() || event.decryption_failure.is_some() =>
            {
                Ok(PutOutcome::Unchanged)
            }
            _ => self.put(event),
        }
    }

    pub fn get(&self, event_id: &EventId) -> Result<Option<Event>> {
        self.db.get_event(event_id)
    }

    pub fn exists(&self, event_id: &EventId) -> Result<bool> {
        Ok(self.db.event_version(event_id)?.is_some())
    }

    pub fn version(&self, event_id: &EventId) -> Result<Option<u64>> {
        self.db.event_version(event_id)
    }

    pub fn relations(&self, target: &EventId) -> Result<Vec<OwnedEventId>> {
        self.db.relations(target)
    }

    /// Stored events relating to `target`. Dangling index entries are skipped.
    pub fn relating_events(&self, target: &EventId) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for event_id in self.db.relations(target)? {
            match self.db.get_event(&event_id)? {
                Some(event) => events.push(event),
                None => warn!(%target, %event_id, "Relation points at a missing event"),
            }
        }
        Ok(events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventUpdate> {
        self.update_sender.subscribe()
    }

    /// Current copy of the event followed by every later version, each
    /// exactly once and in version order. Yields `None` while the event is
    /// unknown.
    pub fn watch_event(&self, event_id: &EventId) -> BoxStream<'static, Option<Event>> {
        let receiver = self.update_sender.subscribe();
        let (initial, mut seen) = self.snapshot(event_id).unwrap_or_else(|error| {
            warn!(%event_id, %error, "Failed to read watched event");
            (None, 0)
        });

        let target = event_id.to_owned();
        let updates = broadcast_stream(receiver).filter_map(move |update| {
            let fresh = update.event_id == target && update.version > seen;
            if fresh {
                seen = update.version;
            }
            future::ready(fresh.then(|| Some(update.event)))
        });

        stream::once(future::ready(initial)).chain(updates).boxed()
    }

    /// The stored copy and its version, read under the write lock so both
    /// belong to the same `put`.
    fn snapshot(&self, event_id: &EventId) -> Result<(Option<Event>, u64)> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TimelineError::Storage("event store write lock poisoned".to_owned()))?;
        let event = self.db.get_event(event_id)?;
        let version = self.db.event_version(event_id)?.unwrap_or(0);
        Ok((event, version))
    }

    /// Like `watch_event`, but only yields once the event exists.
    pub fn watch_existing(&self, event_id: &EventId) -> BoxStream<'static, Event> {
        self.watch_event(event_id).unwrap_optional()
    }

    pub fn watch_content(&self, event_id: &EventId) -> BoxStream<'static, Option<Value>> {
        self.watch_event(event_id).map_optional(|event| event.content)
    }
}
