use matrixon_timeline_core::{Event, TimelineError};
use ruma::{EventId, OwnedEventId};

use crate::{
    database::{join_key, prefix_key, KeyValueDatabase},
    service, utils, Result,
};

impl service::rooms::event_store::Data for KeyValueDatabase {
    fn get_event(&self, event_id: &EventId) -> Result<Option<Event>> {
        self.eventid_event
            .get(event_id.as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| TimelineError::bad_database("Invalid event in eventid_event."))
            })
            .transpose()
    }

    fn event_version(&self, event_id: &EventId) -> Result<Option<u64>> {
        self.eventid_version
            .get(event_id.as_bytes())?
            .map(|bytes| utils::u64_from_bytes(&bytes))
            .transpose()
    }

    fn put_event(&self, event: &Event, version: u64) -> Result<()> {
        let json = serde_json::to_vec(event)?;
        self.eventid_event.insert(event.event_id.as_bytes(), &json)?;
        self.eventid_version
            .insert(event.event_id.as_bytes(), &version.to_be_bytes())?;
        Ok(())
    }

    fn add_relation(&self, target: &EventId, relating: &EventId) -> Result<()> {
        let key = join_key(&[target.as_bytes(), relating.as_bytes()]);
        self.targetid_relatingid.insert(&key, &[])
    }

    fn relations(&self, target: &EventId) -> Result<Vec<OwnedEventId>> {
        let prefix = prefix_key(&[target.as_bytes()]);
        self.targetid_relatingid
            .scan_prefix(prefix.clone())
            .map(|(key, _)| {
                let relating = utils::string_from_bytes(&key[prefix.len()..])?;
                EventId::parse(relating)
                    .map_err(|_| TimelineError::bad_database("Invalid event id in targetid_relatingid."))
            })
            .collect()
    }
}
