//! Utility functions for the Matrixon timeline engine

use ruma::{EventId, OwnedEventId, OwnedTransactionId, TransactionId};

use crate::Result;

const LOCAL_EVENT_PREFIX: &str = "$local.";

/// Generate a fresh idempotency key for an outgoing event
pub fn generate_transaction_id() -> OwnedTransactionId {
    uuid::Uuid::new_v4().simple().to_string().into()
}

/// Placeholder event id shown for a local echo until the server confirms it
pub fn local_event_id(txn_id: &TransactionId) -> Result<OwnedEventId> {
    Ok(EventId::parse(format!("{LOCAL_EVENT_PREFIX}{txn_id}"))?)
}

pub fn is_local_event_id(event_id: &EventId) -> bool {
    event_id.as_str().starts_with(LOCAL_EVENT_PREFIX)
}
