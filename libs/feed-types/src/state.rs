//! Stream and data state
//!
//! Carried on refresh and status messages; the watchlist also synthesizes
//! states when it recovers or closes streams on the application's behalf.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Open,
    /// Snapshot stream; closes after the complete refresh
    NonStreaming,
    /// Closed, may be re-requested
    ClosedRecover,
    Closed,
    Redirected,
}

impl StreamState {
    /// Returns true if no further messages will arrive on the stream.
    pub fn is_final(&self) -> bool {
        !matches!(self, StreamState::Open)
    }
}

/// Health of the data on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataState {
    Ok,
    Suspect,
    NoChange,
}

/// Additional state code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateCode {
    None,
    NotFound,
    Timeout,
    NotEntitled,
    InvalidArgument,
    UsageError,
    Preempted,
    NoResources,
    AlreadyOpen,
    SourceUnknown,
    NotOpen,
    FailoverStarted,
    FailoverCompleted,
}

/// Stream state, data state, code and explanatory text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StateCode,
    pub text: String,
}

impl Default for State {
    fn default() -> Self {
        Self::open_ok()
    }
}

impl State {
    pub fn new(
        stream_state: StreamState,
        data_state: DataState,
        code: StateCode,
        text: impl Into<String>,
    ) -> Self {
        Self {
            stream_state,
            data_state,
            code,
            text: text.into(),
        }
    }

    /// Open, data ok
    pub fn open_ok() -> Self {
        Self::new(StreamState::Open, DataState::Ok, StateCode::None, "")
    }

    /// Open, data suspect
    pub fn open_suspect(code: StateCode, text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Suspect, code, text)
    }

    /// Closed, may be recovered by re-requesting
    pub fn closed_recover(code: StateCode, text: impl Into<String>) -> Self {
        Self::new(StreamState::ClosedRecover, DataState::Suspect, code, text)
    }

    /// Closed for good
    pub fn closed(code: StateCode, text: impl Into<String>) -> Self {
        Self::new(StreamState::Closed, DataState::Suspect, code, text)
    }

    pub fn is_open_ok(&self) -> bool {
        self.stream_state == StreamState::Open && self.data_state == DataState::Ok
    }
}
