//! JSON codec using `serde_json`.
//!
//! The default payload codec. Request bodies are positional argument
//! arrays (`[v0, v1, …]`); response bodies are the bare serialized
//! return value, or a message string for error statuses.
//!
//! # Example
//!
//! ```
//! use sockwire::codec::JsonCodec;
//!
//! let encoded = JsonCodec::encode(&5i32).unwrap();
//! assert_eq!(&encoded, b"5");
//! let decoded: i32 = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, 5);
//! ```

use crate::error::Result;

/// JSON codec for structured data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode a positional argument array from already-converted values.
    #[inline]
    pub fn encode_args(args: &[serde_json::Value]) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(args)?)
    }

    /// Decode a positional argument array.
    ///
    /// Anything other than a JSON array is rejected.
    pub fn decode_args(bytes: &[u8]) -> Result<Vec<serde_json::Value>> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<serde_json::Value>(bytes)? {
            serde_json::Value::Array(values) => Ok(values),
            other => Err(crate::error::SockwireError::Protocol(format!(
                "Expected positional argument array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
