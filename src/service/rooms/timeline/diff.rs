use futures::{future, stream::BoxStream, StreamExt};
use matrixon_timeline_core::TimelineDiff;
use ruma::{OwnedRoomId, RoomId};
use tokio::sync::broadcast;
use tracing::debug;

use crate::utils::stream::broadcast_stream;

/// Fan-out of timeline diffs to UI observers.
pub struct DiffBus {
    sender: broadcast::Sender<TimelineDiff>,
}

impl DiffBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a diff. Empty diffs are dropped; returns whether anything
    /// was sent.
    pub fn emit(&self, diff: &TimelineDiff) -> bool {
        if diff.is_empty() {
            return false;
        }

        let receivers = self.sender.send(diff.clone()).unwrap_or(0);
        debug!(room_id = %diff.room_id, origin = ?diff.origin, receivers, "Emitted timeline diff");
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineDiff> {
        self.sender.subscribe()
    }

    /// Diffs of one room, in emission order.
    pub fn room_stream(&self, room_id: &RoomId) -> BoxStream<'static, TimelineDiff> {
        let room_id: OwnedRoomId = room_id.to_owned();
        broadcast_stream(self.sender.subscribe())
            .filter(move |diff| future::ready(diff.room_id == room_id))
            .boxed()
    }
}
