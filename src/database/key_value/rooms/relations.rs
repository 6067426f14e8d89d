use matrixon_timeline_core::TimelineError;
use ruma::EventId;
use serde_json::Value;

use crate::{database::KeyValueDatabase, service, Result};

impl service::rooms::relations::Data for KeyValueDatabase {
    fn original_content(&self, event_id: &EventId) -> Result<Option<Value>> {
        self.eventid_originalcontent
            .get(event_id.as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|_| {
                    TimelineError::bad_database("Invalid content in eventid_originalcontent.")
                })
            })
            .transpose()
    }

    fn set_original_content(&self, event_id: &EventId, content: &Value) -> Result<()> {
        self.eventid_originalcontent
            .insert(event_id.as_bytes(), &serde_json::to_vec(content)?)
    }
}
