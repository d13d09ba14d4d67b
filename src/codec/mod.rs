//! Codec module - serialization/deserialization for payloads.
//!
//! This module provides the payload codecs named by the header's
//! `payload_encoding` field:
//!
//! - [`JsonCodec`] - UTF-8 JSON, the default (absent encoding field)
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde`, selected per
//!   action by the binary-result marker
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather
//! than trait objects. The wire carries only the codec *name*; both
//! peers resolve names through [`PayloadEncoding`].

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::{Result, SockwireError};

/// Payload codec selector, resolved from the header's encoding name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// UTF-8 JSON; positional argument arrays for requests.
    #[default]
    Json,
    /// MessagePack binary encoding.
    MsgPack,
}

impl PayloadEncoding {
    /// The name written into the header. `Json` is the default and is
    /// omitted on the wire.
    pub fn name(self) -> &'static str {
        match self {
            PayloadEncoding::Json => "json",
            PayloadEncoding::MsgPack => "msgpack",
        }
    }

    /// The header field value: `None` for the default codec.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            PayloadEncoding::Json => None,
            PayloadEncoding::MsgPack => Some("msgpack"),
        }
    }

    /// Resolve a header encoding field. An absent field means the
    /// default; an unknown name is a protocol error.
    pub fn from_header(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("json") => Ok(PayloadEncoding::Json),
            Some("msgpack") => Ok(PayloadEncoding::MsgPack),
            Some(other) => Err(SockwireError::Protocol(format!(
                "Unknown payload encoding {:?}",
                other
            ))),
        }
    }

    /// Encode a value with this codec.
    pub fn encode<T: serde::Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            PayloadEncoding::Json => JsonCodec::encode(value),
            PayloadEncoding::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode a value with this codec.
    pub fn decode<T: serde::de::DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadEncoding::Json => JsonCodec::decode(bytes),
            PayloadEncoding::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_json() {
        assert_eq!(PayloadEncoding::default(), PayloadEncoding::Json);
        assert_eq!(PayloadEncoding::from_header(None).unwrap(), PayloadEncoding::Json);
    }

    #[test]
    fn test_header_value_omits_default() {
        assert_eq!(PayloadEncoding::Json.header_value(), None);
        assert_eq!(PayloadEncoding::MsgPack.header_value(), Some("msgpack"));
    }

    #[test]
    fn test_resolve_by_name() {
        assert_eq!(
            PayloadEncoding::from_header(Some("json")).unwrap(),
            PayloadEncoding::Json
        );
        assert_eq!(
            PayloadEncoding::from_header(Some("msgpack")).unwrap(),
            PayloadEncoding::MsgPack
        );
        assert!(PayloadEncoding::from_header(Some("bson")).is_err());
    }

    #[test]
    fn test_dispatching_encode_decode() {
        for encoding in [PayloadEncoding::Json, PayloadEncoding::MsgPack] {
            let encoded = encoding.encode(&vec![1, 2, 3]).unwrap();
            let decoded: Vec<i32> = encoding.decode(&encoded).unwrap();
            assert_eq!(decoded, vec![1, 2, 3]);
        }
    }
}
