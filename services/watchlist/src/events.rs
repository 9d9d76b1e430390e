//! Messages delivered to the application, submit options and counters

use feed_types::msg::Msg;
use serde::{Deserialize, Serialize};

/// A message for the application, already carrying its own stream id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchlistEvent {
    pub msg: Msg,
    /// Name of the service the stream is bound to, when known
    pub service_name: Option<String>,
}

impl WatchlistEvent {
    pub fn new(msg: Msg, service_name: Option<String>) -> Self {
        Self { msg, service_name }
    }
}

/// Options accompanying a submitted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Bind the request to a service by name instead of by key service id.
    pub service_name: Option<String>,
}

impl SubmitOptions {
    pub fn service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
        }
    }
}

/// Watchlist counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchlistStats {
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub posts_sent: u64,
    pub posts_acked: u64,
    pub posts_timed_out: u64,
    pub request_timeouts: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
}
