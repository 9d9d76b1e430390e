//! Identifier types for streams, services and item groups
//!
//! Stream ids are plain integers on the wire: positive ids are assigned by the
//! consumer, negative ids are reserved for provider-driven streams.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Stream identifier as carried in every message header.
pub type StreamId = i32;

/// Numeric service identifier from the provider's directory.
pub type ServiceId = u16;

/// Stream id of the permanent login control stream.
pub const LOGIN_STREAM_ID: StreamId = 1;

/// Stream id of the permanent directory control stream.
pub const DIRECTORY_STREAM_ID: StreamId = 2;

/// First stream id handed out for item streams.
pub const FIRST_ITEM_STREAM_ID: StreamId = 3;

/// Returns true if the id belongs to a provider-driven stream.
pub fn is_provider_driven(stream_id: StreamId) -> bool {
    stream_id < 0
}

/// Opaque, provider-assigned item group identifier
///
/// Compared bytewise. Scoped to a single service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    /// Create a group id from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume and return the underlying buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Borrow<[u8]> for GroupId {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for GroupId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for GroupId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}
