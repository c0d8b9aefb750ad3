//! Argument and result codecs.
//!
//! A codec turns request payload bytes into a handler's declared argument
//! type and the handler's return value back into bytes. It is picked once when
//! the dispatcher is built and shared by every dispatch.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Serialization strategy for handler arguments and return values.
pub trait Codec: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(Box::new(e)))
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }
}
