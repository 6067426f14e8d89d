mod data;

use std::{collections::BTreeMap, sync::Arc};

pub use data::Data;

use matrixon_timeline_core::{TagInfo, Transport};
use ruma::RoomId;
use tracing::debug;

use crate::Result;

pub struct Service {
    pub db: Arc<dyn Data>,
    transport: Arc<dyn Transport>,
}

impl Service {
    pub fn build(db: Arc<dyn Data>, transport: Arc<dyn Transport>) -> Self {
        Self { db, transport }
    }

    pub fn tags(&self, room_id: &RoomId) -> Result<BTreeMap<String, TagInfo>> {
        self.db.tags(room_id)
    }

    #[tracing::instrument(skip(self))]
    pub async fn add_tag(&self, room_id: &RoomId, tag: &str, order: Option<f64>) -> Result<()> {
        let info = TagInfo { order };
        self.transport.add_tag(room_id, tag, &info).await?;

        let mut tags = self.db.tags(room_id)?;
        tags.insert(tag.to_owned(), info);
        self.db.set_tags(room_id, &tags)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_tag(&self, room_id: &RoomId, tag: &str) -> Result<()> {
        self.transport.delete_tag(room_id, tag).await?;

        let mut tags = self.db.tags(room_id)?;
        if tags.remove(tag).is_some() {
            self.db.set_tags(room_id, &tags)?;
        }
        Ok(())
    }

    /// Sync account data carries the full tag set of a room.
    pub fn replace(&self, room_id: &RoomId, tags: &BTreeMap<String, TagInfo>) -> Result<bool> {
        if self.db.tags(room_id)? == *tags {
            return Ok(false);
        }
        debug!(%room_id, count = tags.len(), "Replacing room tags");
        self.db.set_tags(room_id, tags)?;
        Ok(true)
    }
}
