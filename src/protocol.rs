//! PostgreSQL wire protocol framing.
//!
//! This module implements the subset of the v3 protocol the client needs:
//! a write buffer with length-prefix backpatching for outgoing messages, and
//! a checked read cursor for incoming ones. It has no I/O awareness; bytes go
//! out through [`crate::socket::PgSocket`] and come back in as a single
//! received region (see the fragmentation note on
//! [`crate::connection::PgConnection`]).
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use crate::error::{PgError, PgResult};

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Frontend message tags.
pub mod frontend {
    pub const PASSWORD: u8 = b'p';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Backend message tags.
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ERROR_RESPONSE: u8 = b'E';
}

/// Authentication request subtypes (payload of an 'R' message).
pub mod auth {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
}

// ============================================================================
// Write side
// ============================================================================

/// Outgoing message buffer with length-prefix backpatching.
///
/// Messages are framed as `[tag] length(i32, includes itself) payload`;
/// the startup message omits the tag. `start_message` records where the
/// length goes, `end_message` patches it once the body is known. Several
/// frames may be queued before a flush (e.g. Parse + Sync). Single writer,
/// reused across messages on one connection; must be fully flushed (and
/// [`WriteBuffer::clear`]ed) before reuse.
pub struct WriteBuffer {
    buf: Vec<u8>,
    message_start: usize,
}

const DEFAULT_WRITE_CAPACITY: usize = 1024;

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(DEFAULT_WRITE_CAPACITY),
            message_start: 0,
        }
    }

    /// Begin a tagged message.
    pub fn start_message(&mut self, tag: u8) -> &mut Self {
        self.write_u8(tag);
        self.start_untagged_message()
    }

    /// Begin an untagged message (startup only).
    pub fn start_untagged_message(&mut self) -> &mut Self {
        self.message_start = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self
    }

    /// Close the current message: backpatch its length field with
    /// `current - message_start` (the tag byte is excluded by construction).
    pub fn end_message(&mut self) -> &mut Self {
        let len = (self.buf.len() - self.message_start) as i32;
        self.buf[self.message_start..self.message_start + 4].copy_from_slice(&len.to_be_bytes());
        self
    }

    pub fn write_u8(&mut self, b: u8) -> &mut Self {
        self.buf.push(b);
        self
    }

    pub fn write_null(&mut self) -> &mut Self {
        self.write_u8(0)
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Write a UTF-8 string followed by a null terminator.
    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.write_null()
    }

    /// The framed bytes queued so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Reset for the next message cycle.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.message_start = 0;
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Read side
// ============================================================================

/// Checked read cursor over a received byte region.
///
/// The codec trusts that every message it is asked to read sits entirely in
/// the region; a read past the end is reported as a protocol error rather
/// than a panic.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.position
    }

    fn take(&mut self, len: usize) -> PgResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(PgError::Protocol(format!(
                "unexpected end of buffer: need {} bytes, have {}",
                len,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> PgResult<&'a [u8]> {
        self.take(len)
    }

    /// Read `len` bytes as UTF-8.
    pub fn read_str(&mut self, len: usize) -> PgResult<&'a str> {
        std::str::from_utf8(self.take(len)?)
            .map_err(|_| PgError::Protocol("invalid UTF-8 in string".to_string()))
    }

    /// Read a null-terminated UTF-8 string; the terminator is consumed.
    pub fn read_cstr(&mut self) -> PgResult<&'a str> {
        let rest = &self.buf[self.position..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("missing null terminator in string".to_string()))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| PgError::Protocol("invalid UTF-8 in string".to_string()))?;
        self.position += end + 1;
        Ok(s)
    }

    pub fn skip(&mut self, len: usize) -> PgResult<()> {
        self.take(len).map(|_| ())
    }

    /// Read a message header: the 1-byte tag plus the body length (the wire
    /// length minus the 4 bytes of the length field itself). The cursor is
    /// left at the start of the body, so unhandled messages can be skipped
    /// with `skip(body_len)`.
    pub fn read_message_header(&mut self) -> PgResult<(u8, usize)> {
        let tag = self.read_u8()?;
        let len = self.read_i32()?;
        if len < 4 {
            return Err(PgError::Protocol(format!(
                "invalid message length {} for tag '{}'",
                len, tag as char
            )));
        }
        Ok((tag, len as usize - 4))
    }

    /// Walk an ErrorResponse body: `(field-code, cstring)` pairs terminated
    /// by a zero code. Only the human-readable message field (code `M`) is
    /// kept; everything else is discarded.
    pub fn read_error_message(&mut self) -> PgResult<String> {
        const MESSAGE: u8 = b'M';

        let mut message = None;
        loop {
            let code = self.read_u8()?;
            if code == 0 {
                break;
            }
            let value = self.read_cstr()?;
            if code == MESSAGE {
                message = Some(value.to_owned());
            }
        }
        Ok(message.unwrap_or_else(|| "unknown server error".to_string()))
    }
}
