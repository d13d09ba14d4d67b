//! Message framing and multi-fragment assembly.
//!
//! A logical message is laid out as:
//!
//! ```text
//! ┌─────────────────┬──────────────────┬───────────────┐
//! │ payload bytes   │ encoded header   │ header length │
//! │ 0..N            │ ≤ 256 bytes      │ u16 BE        │
//! └─────────────────┴──────────────────┴───────────────┘
//! ```
//!
//! The header trails the payload so a writer can stream payload bytes
//! before their final length is known. On the wire, one logical message
//! is one binary WebSocket message; the sender builds it from payload
//! fragments of at most [`MAX_FRAGMENT`] bytes, and the last fragment
//! carries the trailing header. The receive side is a state machine
//! ([`MessageAssembler`]) that accumulates fragments until the final one
//! and then splits the trailer off.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, HEADER_LIMIT};
use crate::error::{Result, SockwireError};

/// Maximum payload bytes per fragment.
pub const MAX_FRAGMENT: usize = 8 * 1024;

/// Size of the trailing header-length field.
pub const TRAILER_LEN: usize = 2;

/// Encode a logical message as a list of fragments.
///
/// All fragments except the last contain only payload bytes; the last
/// one holds the payload remainder, the encoded header, and the header
/// length trailer. An empty payload yields a single header-only
/// fragment.
pub fn encode_fragments(header: &Header, payload: &[u8]) -> Result<Vec<Bytes>> {
    let header_bytes = header.encode()?;

    let mut fragments = Vec::with_capacity(payload.len() / MAX_FRAGMENT + 1);
    let mut chunks = payload.chunks(MAX_FRAGMENT).peekable();

    loop {
        match chunks.next() {
            Some(chunk) if chunks.peek().is_some() => {
                fragments.push(Bytes::copy_from_slice(chunk));
            }
            last => {
                // Final fragment: payload remainder + header + trailer.
                let tail = last.unwrap_or(&[]);
                let mut buf = BytesMut::with_capacity(tail.len() + header_bytes.len() + TRAILER_LEN);
                buf.extend_from_slice(tail);
                buf.extend_from_slice(&header_bytes);
                buf.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
                fragments.push(buf.freeze());
                return Ok(fragments);
            }
        }
    }
}

/// Encode a logical message as one contiguous buffer.
///
/// Literally the concatenation of [`encode_fragments`]; what a peer
/// that never fragments would put on the socket, and what the
/// receive side sees after WebSocket reassembly.
pub fn encode_message(header: &Header, payload: &[u8]) -> Result<Bytes> {
    let mut fragments = encode_fragments(header, payload)?;
    if fragments.len() == 1 {
        return Ok(fragments.remove(0));
    }
    let total: usize = fragments.iter().map(|f| f.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for fragment in &fragments {
        buf.extend_from_slice(fragment);
    }
    Ok(buf.freeze())
}

/// Accumulates message fragments and yields complete logical messages.
///
/// Fragmentation is opaque to the caller: feed every fragment through
/// [`MessageAssembler::push`] and a `(Header, payload)` pair comes out
/// once the final fragment arrives. The assembler is reused across
/// messages on the same connection.
pub struct MessageAssembler {
    /// Accumulated bytes of the in-progress message.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl MessageAssembler {
    /// Create a new assembler with the given payload limit.
    pub fn new(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            max_payload_size,
        }
    }

    /// Push one fragment. Returns the complete message once `fin` is set.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the accumulated message exceeds the
    /// configured limit, the trailer is malformed, the header cannot be
    /// decoded, or the declared payload length disagrees with the
    /// assembled bytes. The assembler is left empty after any error.
    pub fn push(&mut self, fragment: &[u8], fin: bool) -> Result<Option<(Header, Bytes)>> {
        self.buffer.extend_from_slice(fragment);

        let limit = self.max_payload_size as usize + HEADER_LIMIT + TRAILER_LEN;
        if self.buffer.len() > limit {
            self.buffer.clear();
            return Err(SockwireError::Protocol(format!(
                "Message size exceeds maximum {}",
                self.max_payload_size
            )));
        }

        if !fin {
            return Ok(None);
        }

        self.finish().map(Some)
    }

    /// Split the trailer off the accumulated bytes and decode the header.
    fn finish(&mut self) -> Result<(Header, Bytes)> {
        let mut message = std::mem::take(&mut self.buffer);

        if message.len() < TRAILER_LEN {
            return Err(SockwireError::Protocol(
                "Message shorter than header trailer".to_string(),
            ));
        }

        let trailer_at = message.len() - TRAILER_LEN;
        let header_len =
            u16::from_be_bytes([message[trailer_at], message[trailer_at + 1]]) as usize;

        if header_len > HEADER_LIMIT {
            return Err(SockwireError::Protocol(format!(
                "Header length {} exceeds limit {}",
                header_len, HEADER_LIMIT
            )));
        }
        if trailer_at < header_len {
            return Err(SockwireError::Protocol(
                "Header length exceeds message size".to_string(),
            ));
        }

        let payload_len = trailer_at - header_len;
        let header = Header::decode(&message[payload_len..trailer_at])?;
        header.validate()?;

        if header.payload_length as usize != payload_len {
            return Err(SockwireError::Protocol(format!(
                "Payload length mismatch: header says {}, assembled {}",
                header.payload_length, payload_len
            )));
        }

        message.truncate(payload_len);
        Ok((header, message.freeze()))
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the assembler holds no partial message.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
