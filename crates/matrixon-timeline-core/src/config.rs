//! Configuration for the Matrixon timeline engine
//!
//! `TimelineConfig` is plain serde data; loading it from files and the
//! environment is the binary's job.

use std::time::Duration;

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Result, TimelineError};

/// Timeline engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// The account the engine acts for. Local echoes are sent as this user.
    pub user_id: OwnedUserId,

    /// `tracing` filter directive used by the binary.
    #[serde(default = "default_log")]
    pub log: String,

    /// Page size used when the caller does not pass one.
    #[serde(default = "default_page_limit")]
    pub default_page_limit: u32,

    /// Upper bound for any requested page size.
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: u32,

    /// Optional timeout wrapped around every pagination transport call.
    #[serde(default)]
    pub pagination_timeout_ms: Option<u64>,

    /// Server-side lifetime of a typing notification.
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,

    /// Capacity of the diff broadcast channel.
    #[serde(default = "default_diff_channel_capacity")]
    pub diff_channel_capacity: usize,

    /// Capacity of the event update broadcast channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl TimelineConfig {
    pub fn new(user_id: OwnedUserId) -> Self {
        Self {
            user_id,
            log: default_log(),
            default_page_limit: default_page_limit(),
            max_page_limit: default_max_page_limit(),
            pagination_timeout_ms: None,
            typing_timeout_ms: default_typing_timeout_ms(),
            diff_channel_capacity: default_diff_channel_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_page_limit == 0 {
            return Err(TimelineError::Config("max_page_limit must be at least 1".into()));
        }

        if self.default_page_limit == 0 || self.default_page_limit > self.max_page_limit {
            return Err(TimelineError::Config(format!(
                "default_page_limit must be within 1..={}",
                self.max_page_limit
            )));
        }

        if self.diff_channel_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(TimelineError::Config("channel capacities must be non-zero".into()));
        }

        if self.pagination_timeout_ms == Some(0) {
            return Err(TimelineError::Config("pagination_timeout_ms must be positive".into()));
        }

        Ok(())
    }

    /// Clamps a requested page size to `1..=max_page_limit`.
    pub fn bounded_page_limit(&self, requested: Option<u32>) -> u32 {
        let limit = requested.unwrap_or(self.default_page_limit);
        let bounded = limit.clamp(1, self.max_page_limit.max(1));
        if bounded != limit {
            warn!(requested = limit, bounded, "Page limit out of range, clamping");
        }
        bounded
    }

    pub fn pagination_timeout(&self) -> Option<Duration> {
        self.pagination_timeout_ms.map(Duration::from_millis)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

fn default_log() -> String {
    "info".to_owned()
}

fn default_page_limit() -> u32 {
    20
}

fn default_max_page_limit() -> u32 {
    100
}

fn default_typing_timeout_ms() -> u64 {
    30_000
}

fn default_diff_channel_capacity() -> usize {
    256
}

fn default_event_channel_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::user_id;
    use test_log::test;

    fn config() -> TimelineConfig {
        TimelineConfig::new(user_id!("@alice:example.org").to_owned())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.log, "info");
        assert_eq!(config.default_page_limit, 20);
        assert_eq!(config.typing_timeout(), Duration::from_secs(30));
        assert_eq!(config.pagination_timeout(), None);
    }

    #[test]
    fn test_page_limit_is_bounded() {
        let config = config();
        assert_eq!(config.bounded_page_limit(None), 20);
        assert_eq!(config.bounded_page_limit(Some(0)), 1);
        assert_eq!(config.bounded_page_limit(Some(5_000)), 100);
        assert_eq!(config.bounded_page_limit(Some(42)), 42);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = config();
        config.default_page_limit = 500;
        assert!(matches!(config.validate(), Err(TimelineError::Config(_))));

        let mut config = self::config();
        config.pagination_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TimelineConfig =
            serde_json::from_str(r#"{ "user_id": "@bob:example.org", "max_page_limit": 50 }"#).unwrap();
        assert_eq!(config.max_page_limit, 50);
        assert_eq!(config.default_page_limit, 20);
        assert_eq!(config.diff_channel_capacity, 256);
    }
}
