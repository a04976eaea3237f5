//! Pluggable binary codecs for user arguments and return values.
//!
//! The default [`TaggedCodec`] is a compact tagged binary form (postcard
//! under the hood) restricted to the portable value space. The secondary
//! [`TrustedCodec`] additionally carries [`Value::Opaque`] payloads; it
//! exists for host-originated data only and is never offered to a guest.

use crate::value::Value;

/// Deepest value nesting a codec will accept.
pub const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value not encodable: {0}")]
    Unencodable(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serializes a value.
    ///
    /// # Errors
    ///
    /// [`CodecError::Unencodable`] when the value lies outside this
    /// codec's space; the caller surfaces it before any VM is touched.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Deserializes a value, rejecting anything outside this codec's
    /// space even if the bytes parse.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Default codec: compact tagged binary, portable value space only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedCodec;

impl Codec for TaggedCodec {
    fn name(&self) -> &'static str {
        "tagged"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        check_portable(value)?;
        postcard::to_allocvec(value).map_err(|e| CodecError::Unencodable(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let value: Value =
            postcard::from_bytes(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if value.contains_opaque() {
            // Opaque payloads are host-trusted; a guest must never
            // originate one.
            return Err(CodecError::Malformed(
                "opaque payload in tagged data".into(),
            ));
        }
        Ok(value)
    }
}

/// Secondary codec for host-trusted payloads; also carries `Opaque`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedCodec;

impl Codec for TrustedCodec {
    fn name(&self) -> &'static str {
        "trusted"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        if value.depth() > MAX_VALUE_DEPTH {
            return Err(CodecError::Unencodable(format!(
                "nesting exceeds {MAX_VALUE_DEPTH} levels"
            )));
        }
        postcard::to_allocvec(value).map_err(|e| CodecError::Unencodable(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

fn check_portable(value: &Value) -> Result<(), CodecError> {
    if value.contains_opaque() {
        return Err(CodecError::Unencodable(
            "opaque payloads require the trusted codec".into(),
        ));
    }
    if value.depth() > MAX_VALUE_DEPTH {
        return Err(CodecError::Unencodable(format!(
            "nesting exceeds {MAX_VALUE_DEPTH} levels"
        )));
    }
    Ok(())
}
