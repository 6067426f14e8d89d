use matrixon_timeline_core::Event;
use ruma::{EventId, OwnedEventId};

use crate::Result;

pub trait Data: Send + Sync {
    fn get_event(&self, event_id: &EventId) -> Result<Option<Event>>;

    fn event_version(&self, event_id: &EventId) -> Result<Option<u64>>;

    /// Stores `event` as `version`, replacing any previous copy.
    fn put_event(&self, event: &Event, version: u64) -> Result<()>;

    fn add_relation(&self, target: &EventId, relating: &EventId) -> Result<()>;

    /// Ids of every stored event relating to `target`.
    fn relations(&self, target: &EventId) -> Result<Vec<OwnedEventId>>;
}
