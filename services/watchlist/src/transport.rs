//! Transport seam
//!
//! The watchlist never touches a socket. It borrows a send buffer, fills it
//! through the codec and hands it back for submission. Running out of
//! buffers is an ordinary, retryable condition.

use thiserror::Error;

/// Transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no send buffers available")]
    NoBuffers,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("transport failure: {0}")]
    Other(String),
}

/// Outcome of handing a filled buffer to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Written (or queued) for the wire.
    Success,
    /// Accepted but the caller should flush before writing more.
    WriteRetry,
    /// The buffer could not be written; the channel is unusable.
    Failure(String),
}

impl SubmitStatus {
    /// Returns true if the message reached the transport.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitStatus::Success | SubmitStatus::WriteRetry)
    }
}

/// A buffer borrowed from the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendBuffer {
    data: Vec<u8>,
}

impl SendBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Writable contents for an encoder.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Outbound half of a connection, as seen by the watchlist.
pub trait Transport {
    /// Borrow a buffer of at least `size_hint` bytes.
    fn get_buffer(&mut self, size_hint: usize) -> Result<SendBuffer, TransportError>;

    /// Hand a filled buffer over for writing. The buffer is consumed.
    fn submit(&mut self, buffer: SendBuffer) -> SubmitStatus;

    /// Return a buffer that will not be submitted.
    fn release(&mut self, buffer: SendBuffer);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn get_buffer(&mut self, size_hint: usize) -> Result<SendBuffer, TransportError> {
        (**self).get_buffer(size_hint)
    }

    fn submit(&mut self, buffer: SendBuffer) -> SubmitStatus {
        (**self).submit(buffer)
    }

    fn release(&mut self, buffer: SendBuffer) {
        (**self).release(buffer)
    }
}
