//! Message codec seam
//!
//! [`JsonCodec`] carries the message model as JSON. A binary wire codec can
//! be dropped in behind the same trait.

use feed_types::msg::Msg;
use thiserror::Error;

use crate::transport::SendBuffer;

/// Encode/decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode {class} message: {reason}")]
    Encode { class: &'static str, reason: String },

    #[error("failed to decode message: {reason}")]
    Decode { reason: String },
}

/// Translates between decoded messages and wire bytes.
pub trait Codec {
    /// Append the encoding of `msg` to `buffer`.
    fn encode(&self, msg: &Msg, buffer: &mut SendBuffer) -> Result<(), CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Msg, CodecError>;
}

/// serde_json codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Msg, buffer: &mut SendBuffer) -> Result<(), CodecError> {
        serde_json::to_writer(buffer.data_mut(), msg).map_err(|e| CodecError::Encode {
            class: msg.class_label(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Msg, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }
}
