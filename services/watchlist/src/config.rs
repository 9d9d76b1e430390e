//! Watchlist configuration

use std::time::Duration;

use feed_types::directory::service_filter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration for a [`crate::Watchlist`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchlistConfig {
    /// Time to wait for a refresh after sending a request.
    pub request_timeout_ms: u64,
    /// Time to wait for an acknowledgement after sending a post.
    pub post_ack_timeout_ms: u64,
    /// Maximum number of posts awaiting acknowledgement across all streams.
    pub max_outstanding_posts: usize,
    /// Item stream slots allocated up front.
    pub initial_stream_pool_size: usize,
    /// The pool never grows past this many item streams.
    pub max_streams: usize,
    /// Honour the open window advertised in a service's load section.
    pub obey_open_window: bool,
    /// Recover closed streams internally instead of closing requests.
    pub single_open: bool,
    /// Keep streams open when the provider marks their data suspect.
    pub allow_suspect_data: bool,
    /// Filter used on the internal directory request.
    pub directory_filter: u32,
    /// Group-id buffers longer than this are allocated ad hoc.
    pub group_id_max_pooled_len: usize,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            post_ack_timeout_ms: 15_000,
            max_outstanding_posts: 100_000,
            initial_stream_pool_size: 64,
            max_streams: 1_000_000,
            obey_open_window: true,
            single_open: true,
            allow_suspect_data: true,
            directory_filter: service_filter::INFO
                | service_filter::STATE
                | service_filter::GROUP
                | service_filter::LOAD
                | service_filter::LINK,
            group_id_max_pooled_len: 256,
        }
    }
}

impl WatchlistConfig {
    /// Parse from JSON; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.post_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "post_ack_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.initial_stream_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "initial_stream_pool_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_streams < self.initial_stream_pool_size {
            return Err(ConfigError::Invalid {
                field: "max_streams",
                reason: format!(
                    "{} is below initial_stream_pool_size {}",
                    self.max_streams, self.initial_stream_pool_size
                ),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn post_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.post_ack_timeout_ms)
    }
}
