mod data;

use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

pub use data::Data;

use matrixon_timeline_core::Transport;
use ruma::{EventId, OwnedEventId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::timeline;
use crate::Result;

/// The user's own markers in a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarkers {
    pub fully_read: Option<OwnedEventId>,
    pub read_receipt: Option<OwnedEventId>,
}

pub struct Service {
    pub db: Arc<dyn Data>,
    user_id: OwnedUserId,
    timeline: Arc<timeline::Service>,
    transport: Arc<dyn Transport>,
}

impl Service {
    pub fn build(
        db: Arc<dyn Data>,
        user_id: OwnedUserId,
        timeline: Arc<timeline::Service>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            db,
            user_id,
            timeline,
            transport,
        }
    }

    pub fn read_markers(&self, room_id: &RoomId) -> Result<ReadMarkers> {
        self.db.read_markers(room_id)
    }

    pub fn receipts(&self, room_id: &RoomId) -> Result<BTreeMap<OwnedUserId, OwnedEventId>> {
        self.db.receipts(room_id)
    }

    /// Moves the markers forward. A marker that would move backwards, as far
    /// as the known timeline can tell, is left where it is. Returns the
    /// resulting markers.
    #[tracing::instrument(skip(self))]
    pub async fn set_read_markers(
        &self,
        room_id: &RoomId,
        fully_read: Option<&EventId>,
        read_receipt: Option<&EventId>,
    ) -> Result<ReadMarkers> {
        let current = self.db.read_markers(room_id)?;

        let (fully_read, read_receipt) = self
            .timeline
            .read(room_id, |timeline| {
                let advance = |current: Option<&OwnedEventId>, proposed: Option<&EventId>| {
                    let proposed = proposed?;
                    match current {
                        Some(current) if current == proposed => None,
                        Some(current) => match timeline.compare_positions(current, proposed) {
                            Some(Ordering::Greater) => None,
                            _ => Some(proposed.to_owned()),
                        },
                        None => Some(proposed.to_owned()),
                    }
                };
                (
                    advance(current.fully_read.as_ref(), fully_read),
                    advance(current.read_receipt.as_ref(), read_receipt),
                )
            })
            .await?;

        if fully_read.is_none() && read_receipt.is_none() {
            debug!("Markers already at or past the requested events");
            return Ok(current);
        }

        self.transport
            .set_read_markers(room_id, fully_read.as_deref(), read_receipt.as_deref())
            .await?;

        let markers = ReadMarkers {
            fully_read: fully_read.or(current.fully_read),
            read_receipt: read_receipt.clone().or(current.read_receipt),
        };
        self.db.set_read_markers(room_id, &markers)?;
        if let Some(receipt) = &read_receipt {
            self.db.set_receipt(room_id, &self.user_id, receipt)?;
        }

        Ok(markers)
    }

    /// Marks every known room read up to its newest live event.
    pub async fn mark_all_rooms_read(&self) -> Result<usize> {
        let mut marked = 0;
        for room_id in self.timeline.known_rooms().await? {
            let latest = self
                .timeline
                .read(&room_id, |timeline| timeline.live_chunk().and_then(|c| c.last().cloned()))
                .await?;
            let Some(latest) = latest else {
                continue;
            };

            match self.set_read_markers(&room_id, Some(&latest), Some(&latest)).await {
                Ok(_) => marked += 1,
                Err(error) => warn!(%room_id, %error, "Failed to mark room read"),
            }
        }
        info!(marked, "✅ Marked rooms read");
        Ok(marked)
    }

    /// Applies markers and receipts delivered by sync. The server copy of the
    /// fully-read marker is authoritative.
    pub fn apply_sync(
        &self,
        room_id: &RoomId,
        fully_read: Option<&EventId>,
        receipts: &BTreeMap<OwnedUserId, OwnedEventId>,
    ) -> Result<()> {
        let mut markers = self.db.read_markers(room_id)?;
        let before = markers.clone();

        if let Some(fully_read) = fully_read {
            markers.fully_read = Some(fully_read.to_owned());
        }
        for (user_id, event_id) in receipts {
            self.db.set_receipt(room_id, user_id, event_id)?;
            if *user_id == self.user_id {
                markers.read_receipt = Some(event_id.clone());
            }
        }

        if markers != before {
            self.db.set_read_markers(room_id, &markers)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::KeyValueDatabase,
        service::rooms::{
            gap_resolver::{self, Batch},
            timeline::RoomTimeline,
        },
        transport::ReplayTransport,
    };
    use ruma::{event_id, room_id, user_id};
    use test_log::test;

    async fn service() -> (Service, Arc<ReplayTransport>) {
        let db = Arc::new(KeyValueDatabase::in_memory().unwrap());
        let timeline = Arc::new(timeline::Service::build(db.clone()));
        timeline
            .mutate(room_id!("!room:example.org"), |t: &mut RoomTimeline| {
                gap_resolver::Service.resolve(
                    t,
                    Batch {
                        events: vec![
                            event_id!("$e1").to_owned(),
                            event_id!("$e2").to_owned(),
                            event_id!("$e3").to_owned(),
                        ],
                        is_last_forward: true,
                        ..Default::default()
                    },
                )
            })
            .await
            .unwrap();
        let transport = Arc::new(ReplayTransport::new());
        let service = Service::build(
            db,
            user_id!("@me:example.org").to_owned(),
            timeline,
            transport.clone(),
        );
        (service, transport)
    }

    #[test(tokio::test)]
    async fn test_markers_only_move_forward() {
        let (markers, transport) = service().await;
        let room = room_id!("!room:example.org");

        let set = markers
            .set_read_markers(room, Some(event_id!("$e2")), Some(event_id!("$e2")))
            .await
            .unwrap();
        assert_eq!(set.fully_read, Some(event_id!("$e2").to_owned()));

        let unchanged = markers
            .set_read_markers(room, Some(event_id!("$e1")), None)
            .await
            .unwrap();
        assert_eq!(unchanged.fully_read, Some(event_id!("$e2").to_owned()));
        assert_eq!(transport.read_marker_calls(), 1);

        let advanced = markers
            .set_read_markers(room, None, Some(event_id!("$e3")))
            .await
            .unwrap();
        assert_eq!(advanced.read_receipt, Some(event_id!("$e3").to_owned()));
        assert_eq!(advanced.fully_read, Some(event_id!("$e2").to_owned()));
        assert_eq!(
            markers.receipts(room).unwrap().get(user_id!("@me:example.org")),
            Some(&event_id!("$e3").to_owned())
        );
    }

    #[test(tokio::test)]
    async fn test_mark_all_rooms_read() {
        let (markers, _) = service().await;
        assert_eq!(markers.mark_all_rooms_read().await.unwrap(), 1);
        let room = markers.read_markers(room_id!("!room:example.org")).unwrap();
        assert_eq!(room.fully_read, Some(event_id!("$e3").to_owned()));
    }

    #[test(tokio::test)]
    async fn test_sync_receipts_update_projection() {
        let (markers, _) = service().await;
        let room = room_id!("!room:example.org");
        let receipts = BTreeMap::from([
            (user_id!("@me:example.org").to_owned(), event_id!("$e1").to_owned()),
            (user_id!("@bob:example.org").to_owned(), event_id!("$e3").to_owned()),
        ]);

        markers.apply_sync(room, Some(event_id!("$e2")), &receipts).unwrap();

        let own = markers.read_markers(room).unwrap();
        assert_eq!(own.fully_read, Some(event_id!("$e2").to_owned()));
        assert_eq!(own.read_receipt, Some(event_id!("$e1").to_owned()));
        assert_eq!(markers.receipts(room).unwrap().len(), 2);
    }
}
