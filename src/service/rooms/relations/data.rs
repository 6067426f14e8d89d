use ruma::EventId;
use serde_json::Value;

use crate::Result;

pub trait Data: Send + Sync {
    /// Content of an event before its first edit was applied.
    fn original_content(&self, event_id: &EventId) -> Result<Option<Value>>;

    fn set_original_content(&self, event_id: &EventId, content: &Value) -> Result<()>;
}
