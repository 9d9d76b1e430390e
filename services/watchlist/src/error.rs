//! Error taxonomy for the watchlist
//!
//! Component errors convert into [`WatchlistError`], which every façade call
//! returns. Only [`WatchlistError::NoBuffers`] is worth retrying.

use feed_types::ids::{ServiceId, StreamId};
use feed_types::errors::ModelError;
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors raised by the stream pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("stream pool exhausted at capacity {capacity}")]
    Exhausted { capacity: usize },

    #[error("stream pool failed to grow from {capacity} slots")]
    GrowthFailed { capacity: usize },

    #[error("stream handle does not refer to a live stream")]
    UnknownHandle,
}

/// Errors raised while validating or tracking a post.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    #[error("post requesting an acknowledgement has no post id")]
    MissingPostId,

    #[error("multi-part post has no sequence number")]
    MissingSeqNum,

    #[error("posts are not allowed on administrative domains")]
    AdministrativeDomain,

    #[error("post id {post_id} with sequence {seq_num:?} is already awaiting an acknowledgement")]
    Duplicate { post_id: u32, seq_num: Option<u32> },

    #[error("too many outstanding posts (limit {limit})")]
    TooManyOutstanding { limit: usize },
}

/// Errors raised while applying directory entries to the service cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceCacheError {
    #[error("service id {0} already exists")]
    DuplicateId(ServiceId),

    #[error("service name {0} already exists")]
    DuplicateName(String),
}

/// Top-level watchlist error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WatchlistError {
    #[error("invalid usage: {reason}")]
    InvalidUsage { reason: String },

    #[error("no buffers available")]
    NoBuffers,

    #[error("channel failure: {reason}")]
    ChannelFailure { reason: String },

    #[error("channel is not connected")]
    NotConnected,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("invalid message: {0}")]
    Model(#[from] ModelError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("post error: {0}")]
    Post(#[from] PostError),

    #[error("service cache error: {0}")]
    ServiceCache(#[from] ServiceCacheError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WatchlistError {
    pub fn invalid_usage(reason: impl Into<String>) -> Self {
        Self::InvalidUsage {
            reason: reason.into(),
        }
    }

    /// Returns true if the caller should try again after the next dispatch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoBuffers)
    }

    /// Returns true for misuse the caller must fix before resubmitting.
    pub fn is_invalid_usage(&self) -> bool {
        matches!(self, Self::InvalidUsage { .. } | Self::Model(_) | Self::Post(_))
    }
}

impl From<TransportError> for WatchlistError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoBuffers => Self::NoBuffers,
            other => Self::Transport(other),
        }
    }
}
