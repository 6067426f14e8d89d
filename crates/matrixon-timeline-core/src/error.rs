//! Error types for the Matrixon timeline engine
//!
//! `TransportError` is what collaborators report; `TimelineError` is what the
//! engine reports to its callers. Both are `Clone` so that a single failure
//! can be handed to every waiter of a shared in-flight request.

use ruma::{OwnedEventId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChunkId, DecryptionFailure, Direction, Token};

/// Failures reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The server no longer recognises the pagination token.
    #[error("Unknown pagination token")]
    UnknownToken,

    /// The idempotency key was already used; the server reports the event it
    /// created the first time.
    #[error("Duplicate submission of {event_id}")]
    Duplicate { event_id: OwnedEventId },

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Maps an HTTP status to the closest transport failure.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited { retry_after_ms: 0 },
            _ => Self::Http {
                status,
                message: message.into(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network { .. } | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            Self::UnknownToken | Self::Duplicate { .. } => false,
        }
    }
}

/// Timeline engine error type
#[derive(Debug, Clone, Error)]
pub enum TimelineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server invalidated a frontier token. The frontier is reset and the
    /// next request re-fetches a token for it.
    #[error("Gap in {room_id} at {chunk_id} ({direction}) can no longer be filled from token {token}")]
    GapUnrecoverable {
        room_id: OwnedRoomId,
        chunk_id: ChunkId,
        direction: Direction,
        token: Token,
    },

    #[error("Decryption error: {0}")]
    Decryption(#[from] DecryptionFailure),

    #[error("Duplicate submission, server event is {event_id}")]
    DuplicateSubmission { event_id: OwnedEventId },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TimelineError {
    /// Storage returned data that does not decode.
    pub fn bad_database(msg: &str) -> Self {
        tracing::error!("BadDatabase: {}", msg);
        Self::Storage(msg.to_owned())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Cancelled | Self::GapUnrecoverable { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TimelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<ruma::IdParseError> for TimelineError {
    fn from(e: ruma::IdParseError) -> Self {
        Self::InvalidId(e.to_string())
    }
}

/// Result type for timeline operations
pub type Result<T, E = TimelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::event_id;

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::network("reset").is_retryable());
        assert!(TransportError::from_http_status(502, "bad gateway").is_retryable());
        assert!(!TransportError::from_http_status(403, "forbidden").is_retryable());
        assert!(!TransportError::UnknownToken.is_retryable());
        assert!(!TransportError::Duplicate {
            event_id: event_id!("$dup").to_owned()
        }
        .is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(TransportError::from_http_status(504, ""), TransportError::Timeout);
        assert_eq!(
            TransportError::from_http_status(429, ""),
            TransportError::RateLimited { retry_after_ms: 0 }
        );
    }

    #[test]
    fn test_error_display() {
        let error = TimelineError::from(TransportError::Timeout);
        assert!(error.to_string().contains("Transport error"));
        assert!(error.to_string().contains("timed out"));
        assert!(error.is_retryable());

        let error = TimelineError::Storage("disk full".into());
        assert!(error.to_string().contains("disk full"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(TimelineError::from(parse), TimelineError::Serialization(_)));
    }

    #[test]
    fn test_transport_error_serde_tag() {
        let value = serde_json::to_value(TransportError::RateLimited { retry_after_ms: 500 }).unwrap();
        assert_eq!(value["kind"], "rate_limited");
        let back: TransportError = serde_json::from_value(value).unwrap();
        assert_eq!(back, TransportError::RateLimited { retry_after_ms: 500 });
    }
}
