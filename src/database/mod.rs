// =============================================================================
// Matrixon Timeline - Database Module
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
//   Named trees of the timeline engine. `KeyValueDatabase` implements the
//   `Data` trait of every service in `key_value/`.
//
// =============================================================================

pub mod abstraction;
pub mod key_value;

use std::sync::Arc;

use tracing::{debug, info};

use self::abstraction::{memory, KeyValueDatabaseEngine, KvTree};
use crate::Result;

pub struct KeyValueDatabase {
    db: Arc<dyn KeyValueDatabaseEngine>,

    //pub event_store: event_store::EventStore,
    pub(crate) eventid_event: Arc<dyn KvTree>, // EventId = Event json
    pub(crate) eventid_version: Arc<dyn KvTree>, // EventId = u64 version
    pub(crate) targetid_relatingid: Arc<dyn KvTree>, // TargetId = EventId + 0xff + RelatingId
    pub(crate) eventid_originalcontent: Arc<dyn KvTree>, // EventId = content before edits

    //pub timeline: timeline::Timeline,
    pub(crate) roomid_timeline: Arc<dyn KvTree>, // RoomId = RoomTimeline snapshot
    pub(crate) eventid_count: Arc<dyn KvTree>, // EventId = TimelineCount
    pub(crate) global: Arc<dyn KvTree>,

    //pub state: state::State,
    pub(crate) roomstatekey_event: Arc<dyn KvTree>, // RoomStateKey = RoomId + 0xff + Kind + 0xff + StateKey

    //pub read_markers: read_markers::ReadMarkers,
    pub(crate) roomid_readmarkers: Arc<dyn KvTree>,
    pub(crate) roomuserid_receipt: Arc<dyn KvTree>, // RoomUserId = RoomId + 0xff + UserId

    //pub tags: tags::Tags,
    pub(crate) roomid_tags: Arc<dyn KvTree>,

    //pub transaction_ids: transaction_ids::TransactionIds,
    pub(crate) roomtxnid_eventid: Arc<dyn KvTree>, // RoomTxnId = RoomId + 0xff + TxnId
}

impl KeyValueDatabase {
    /// Opens every tree on `engine`.
    pub fn load_or_create(engine: Arc<dyn KeyValueDatabaseEngine>) -> Result<Self> {
        debug!("Opening timeline trees");
        let db = Self {
            eventid_event: engine.open_tree("eventid_event")?,
            eventid_version: engine.open_tree("eventid_version")?,
            targetid_relatingid: engine.open_tree("targetid_relatingid")?,
            eventid_originalcontent: engine.open_tree("eventid_originalcontent")?,
            roomid_timeline: engine.open_tree("roomid_timeline")?,
            eventid_count: engine.open_tree("eventid_count")?,
            global: engine.open_tree("global")?,
            roomstatekey_event: engine.open_tree("roomstatekey_event")?,
            roomid_readmarkers: engine.open_tree("roomid_readmarkers")?,
            roomuserid_receipt: engine.open_tree("roomuserid_receipt")?,
            roomid_tags: engine.open_tree("roomid_tags")?,
            roomtxnid_eventid: engine.open_tree("roomtxnid_eventid")?,
            db: engine,
        };
        info!("✅ Timeline database ready");
        Ok(db)
    }

    /// Database on the in-process engine.
    pub fn in_memory() -> Result<Self> {
        Self::load_or_create(Arc::new(memory::Engine::new()))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()
    }

    pub fn memory_usage(&self) -> Result<String> {
        self.db.memory_usage()
    }
}

/// `a + 0xff + b`, the composite key layout used by every tree.
pub(crate) fn join_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(0xff);
        }
        key.extend_from_slice(part);
    }
    key
}

pub(crate) fn prefix_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = join_key(parts);
    key.push(0xff);
    key
}
