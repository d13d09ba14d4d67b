//! MsgPack codec using `rmp-serde`.
//!
//! The binary alternative to JSON, selected per action by the
//! binary-result marker. Uses `to_vec_named` so structs serialize as
//! maps (field names on the wire), which keeps payloads decodable by
//! peers that do not share Rust struct layouts.

use crate::error::Result;

/// MessagePack codec for structured data.
///
/// Uses `rmp_serde::to_vec_named` so structs are serialized as maps
/// (with field names) rather than arrays (positional).
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_struct_serialized_as_map() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();

        // MsgPack map format starts with 0x83 (fixmap with 3 elements);
        // array format would start with 0x93.
        assert_eq!(
            encoded[0] & 0xF0,
            0x80,
            "Expected map format (0x8X), got {:02X}",
            encoded[0]
        );
    }

    #[test]
    fn test_binary_buffer() {
        let data: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();

        // bin8 format marker.
        assert_eq!(encoded[0], 0xc4, "Expected bin8 format");

        let decoded: serde_bytes::ByteBuf = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_option_roundtrip() {
        let some_val: Option<i32> = Some(42);
        let encoded = MsgPackCodec::encode(&some_val).unwrap();
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, some_val);

        let none_val: Option<i32> = None;
        let encoded = MsgPackCodec::encode(&none_val).unwrap();
        assert_eq!(encoded, vec![0xc0], "None should encode as msgpack nil");
    }
}
