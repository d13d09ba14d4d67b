//! Protocol module - wire format, framing, and message assembly.
//!
//! This module implements the binary protocol for a logical message:
//! - Tag/varint header encoding/decoding (trailing, self-delimited)
//! - Payload-then-header framing with multi-fragment assembly
//! - Status codes shared by requests and responses

mod frame;
mod wire_format;

pub use frame::{encode_fragments, encode_message, MessageAssembler, MAX_FRAGMENT, TRAILER_LEN};
pub use wire_format::{Header, Status, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_LIMIT};
