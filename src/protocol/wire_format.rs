//! Wire format encoding and decoding for the message header.
//!
//! The header is a small variable-length structure encoded with
//! protobuf-style field tags, placed at the *tail* of a logical message
//! (see [`super::frame`]). Fields:
//!
//! ```text
//! ┌───────┬─────┬──────────────────┬──────────────────────────────┐
//! │ field │ tag │ wire type        │ presence                     │
//! ├───────┼─────┼──────────────────┼──────────────────────────────┤
//! │ status│  1  │ varint           │ always                       │
//! │ uid   │  2  │ varint           │ optional (absent = notify)   │
//! │ len   │  3  │ varint           │ optional (default 0)         │
//! │ enc   │  4  │ len-prefixed str │ optional (absent = json)     │
//! │ action│  5  │ len-prefixed str │ required iff status=Request  │
//! └───────┴─────┴──────────────────┴──────────────────────────────┘
//! ```
//!
//! An encoded header never exceeds [`HEADER_LIMIT`] bytes.

use crate::error::{Result, SockwireError};

/// Maximum size of an encoded header in bytes.
pub const HEADER_LIMIT: usize = 256;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Wire type for varint fields.
const WIRE_VARINT: u8 = 0;

/// Wire type for length-prefixed fields.
const WIRE_LEN: u8 = 2;

const TAG_STATUS: u8 = 1;
const TAG_UID: u8 = 2;
const TAG_PAYLOAD_LENGTH: u8 = 3;
const TAG_PAYLOAD_ENCODING: u8 = 4;
const TAG_ACTION_NAME: u8 = 5;

/// Message status. `Request` identifies a request; any other value
/// identifies a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// A request (carries an action name).
    Request = 0,
    /// Successful response.
    Ok = 1,
    /// Caller fault: bad arguments, invalid token, arity mismatch.
    BadRequest = 2,
    /// The request itself could not be understood.
    InvalidRequest = 3,
    /// Controller or action not found.
    NotFound = 4,
    /// The action requires authentication.
    Unauthorized = 5,
    /// Callee fault; details never cross the wire.
    InternalError = 6,
}

impl Status {
    /// Convert from a wire value. Returns `None` for unknown values.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => Status::Request,
            1 => Status::Ok,
            2 => Status::BadRequest,
            3 => Status::InvalidRequest,
            4 => Status::NotFound,
            5 => Status::Unauthorized,
            6 => Status::InternalError,
            _ => return None,
        })
    }

    /// Convert to the wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this status marks a request.
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(self, Status::Request)
    }

    /// Check if this status marks an error response.
    #[inline]
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Request | Status::Ok)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Request/response discriminator and response outcome.
    pub status: Status,
    /// Correlation id. Absent on notifications and their (discarded)
    /// responses; present on every real response.
    pub uid: Option<u32>,
    /// Payload length in bytes.
    pub payload_length: u32,
    /// Payload codec name. Absent means the default (`json`).
    pub payload_encoding: Option<String>,
    /// `"Controller/Action"` or bare `"Action"`. Present iff request.
    pub action_name: Option<String>,
}

impl Header {
    /// Build a request header.
    pub fn request(
        action_name: &str,
        uid: Option<u32>,
        payload_length: u32,
        payload_encoding: Option<&str>,
    ) -> Self {
        Self {
            status: Status::Request,
            uid,
            payload_length,
            payload_encoding: payload_encoding.map(str::to_string),
            action_name: Some(action_name.to_string()),
        }
    }

    /// Build a response header.
    pub fn response(
        status: Status,
        uid: u32,
        payload_length: u32,
        payload_encoding: Option<&str>,
    ) -> Self {
        Self {
            status,
            uid: Some(uid),
            payload_length,
            payload_encoding: payload_encoding.map(str::to_string),
            action_name: None,
        }
    }

    /// Check if this header marks a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.status.is_request()
    }

    /// Check if this header marks a notification (request without uid).
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.is_request() && self.uid.is_none()
    }

    /// Encode the header to bytes.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the encoded size would exceed
    /// [`HEADER_LIMIT`] (only possible with an oversized action name or
    /// encoding name).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);

        put_tag(&mut buf, TAG_STATUS, WIRE_VARINT);
        put_varint(&mut buf, self.status.as_u8() as u64);

        if let Some(uid) = self.uid {
            put_tag(&mut buf, TAG_UID, WIRE_VARINT);
            put_varint(&mut buf, uid as u64);
        }

        if self.payload_length != 0 {
            put_tag(&mut buf, TAG_PAYLOAD_LENGTH, WIRE_VARINT);
            put_varint(&mut buf, self.payload_length as u64);
        }

        if let Some(enc) = &self.payload_encoding {
            put_tag(&mut buf, TAG_PAYLOAD_ENCODING, WIRE_LEN);
            put_str(&mut buf, enc);
        }

        if let Some(action) = &self.action_name {
            put_tag(&mut buf, TAG_ACTION_NAME, WIRE_LEN);
            put_str(&mut buf, action);
        }

        if buf.len() > HEADER_LIMIT {
            return Err(SockwireError::Protocol(format!(
                "Header size {} exceeds limit {}",
                buf.len(),
                HEADER_LIMIT
            )));
        }

        Ok(buf)
    }

    /// Decode a header from bytes. The buffer must contain exactly one
    /// header; unknown fields are skipped by wire type.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let mut status = None;
        let mut uid = None;
        let mut payload_length = 0u32;
        let mut payload_encoding = None;
        let mut action_name = None;

        while pos < buf.len() {
            let tag_byte = buf[pos];
            pos += 1;
            let field = tag_byte >> 3;
            let wire = tag_byte & 0x07;

            match (field, wire) {
                (TAG_STATUS, WIRE_VARINT) => {
                    let v = get_varint(buf, &mut pos)?;
                    status = Some(
                        u8::try_from(v)
                            .ok()
                            .and_then(Status::from_u8)
                            .ok_or_else(|| {
                                SockwireError::Protocol(format!("Unknown status value {}", v))
                            })?,
                    );
                }
                (TAG_UID, WIRE_VARINT) => {
                    let v = get_varint(buf, &mut pos)?;
                    uid = Some(u32::try_from(v).map_err(|_| {
                        SockwireError::Protocol(format!("uid {} out of range", v))
                    })?);
                }
                (TAG_PAYLOAD_LENGTH, WIRE_VARINT) => {
                    let v = get_varint(buf, &mut pos)?;
                    payload_length = u32::try_from(v).map_err(|_| {
                        SockwireError::Protocol(format!("payload length {} out of range", v))
                    })?;
                }
                (TAG_PAYLOAD_ENCODING, WIRE_LEN) => {
                    payload_encoding = Some(get_str(buf, &mut pos)?);
                }
                (TAG_ACTION_NAME, WIRE_LEN) => {
                    action_name = Some(get_str(buf, &mut pos)?);
                }
                // Unknown field: skip by wire type for forward compatibility.
                (_, WIRE_VARINT) => {
                    get_varint(buf, &mut pos)?;
                }
                (_, WIRE_LEN) => {
                    let len = get_varint(buf, &mut pos)? as usize;
                    if buf.len() - pos < len {
                        return Err(SockwireError::Protocol(
                            "Truncated length-prefixed field".to_string(),
                        ));
                    }
                    pos += len;
                }
                (_, w) => {
                    return Err(SockwireError::Protocol(format!(
                        "Unsupported wire type {}",
                        w
                    )));
                }
            }
        }

        let status = status
            .ok_or_else(|| SockwireError::Protocol("Header missing status field".to_string()))?;

        Ok(Self {
            status,
            uid,
            payload_length,
            payload_encoding,
            action_name,
        })
    }

    /// Validate field-presence rules.
    ///
    /// A request must carry `action_name`; a response must not, and must
    /// carry `uid`.
    pub fn validate(&self) -> Result<()> {
        if self.is_request() {
            match &self.action_name {
                Some(name) if !name.is_empty() => {}
                _ => {
                    return Err(SockwireError::Protocol(
                        "Request header missing action name".to_string(),
                    ));
                }
            }
        } else {
            if self.action_name.is_some() {
                return Err(SockwireError::Protocol(
                    "Response header must not carry an action name".to_string(),
                ));
            }
            if self.uid.is_none() {
                return Err(SockwireError::Protocol(
                    "Response header missing uid".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[inline]
fn put_tag(buf: &mut Vec<u8>, field: u8, wire: u8) {
    buf.push((field << 3) | wire);
}

/// Append a LEB128 varint.
fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Append a length-prefixed UTF-8 string.
fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Read a LEB128 varint, advancing `pos`.
fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| SockwireError::Protocol("Truncated varint".to_string()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(SockwireError::Protocol("Varint overflow".to_string()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read a length-prefixed UTF-8 string, advancing `pos`.
fn get_str(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = get_varint(buf, pos)? as usize;
    if buf.len() - *pos < len {
        return Err(SockwireError::Protocol("Truncated string field".to_string()));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| SockwireError::Protocol("String field is not UTF-8".to_string()))?
        .to_string();
    *pos += len;
    Ok(s)
}
