//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands and replies, and decode both directions of the
//! store's request/reply protocol.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//!
//! ## Null Replies
//!
//! RESP2 has two nulls: `$-1` (missing key/field) and `*-1` (blocking pop
//! timed out). Both are kept distinct from empty values so callers can tell
//! "absent" apart from "present but empty".

use std::io::BufRead;

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// RESP value, used for both client replies and server-side encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// `+OK`.
    pub fn ok() -> Self {
        RespValue::Simple(b"OK".to_vec())
    }

    /// Bulk string holding a copy of `data`.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    /// `-ERR <message>` style reply. The caller supplies the prefix.
    pub fn error(message: impl Into<Vec<u8>>) -> Self {
        RespValue::Error(message.into())
    }

    /// Array of values.
    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    /// Returns true for `$-1` and `*-1`.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Bulk(None) | RespValue::Array(None))
    }

    /// Borrow the payload of a simple or non-null bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Integer view: integer replies directly, or text that parses as decimal.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => parse_i64(data).ok(),
            _ => None,
        }
    }

    /// Appends the wire form of this value to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            RespValue::Bulk(Some(data)) => {
                out.push(b'$');
                push_usize(out, data.len());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                out.push(b'*');
                push_usize(out, items.len());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ProtocolResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ProtocolError::Framing("empty line"));
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(ProtocolError::Framing("unknown type byte")),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ProtocolResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ProtocolError::Framing("bulk string missing CRLF"));
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ProtocolResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Array(None));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(Some(items)))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ProtocolResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ProtocolError::Eof);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ProtocolError::Framing("line missing CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

/// Incremental decoder for client requests (arrays of bulk strings).
///
/// Bytes are only consumed from the buffer once a whole command is present,
/// so the caller can keep appending socket reads to the same `BytesMut`.
#[derive(Debug, Default)]
pub struct RespParser {
    _private: (),
}

impl RespParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        RespParser { _private: () }
    }

    /// Attempts to decode one command.
    ///
    /// Returns `Ok(None)` when `buf` holds only a partial command.
    pub fn parse(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<Vec<Vec<u8>>>> {
        let mut pos = 0;
        let count = match read_header(buf, &mut pos, b'*')? {
            Some(count) => count,
            None => return Ok(None),
        };
        if count < 0 {
            return Err(ProtocolError::Framing("negative argument count"));
        }

        let mut args = Vec::with_capacity((count as usize).min(64));
        for _ in 0..count {
            let len = match read_header(buf, &mut pos, b'$')? {
                Some(len) => len,
                None => return Ok(None),
            };
            if len < 0 {
                return Err(ProtocolError::Framing("null argument"));
            }
            let end = pos + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::Framing("argument missing CRLF"));
            }
            args.push(buf[pos..end].to_vec());
            pos = end + 2;
        }

        buf.advance(pos);
        Ok(Some(args))
    }
}

fn read_header(buf: &[u8], pos: &mut usize, prefix: u8) -> ProtocolResult<Option<i64>> {
    if *pos >= buf.len() {
        return Ok(None);
    }
    if buf[*pos] != prefix {
        return Err(ProtocolError::Framing("unexpected type byte"));
    }
    let line_end = match buf[*pos..].windows(2).position(|w| w == b"\r\n") {
        Some(offset) => *pos + offset,
        None => return Ok(None),
    };
    let value = parse_i64(&buf[*pos + 1..line_end])?;
    *pos = line_end + 2;
    Ok(Some(value))
}

/// Parses an ASCII decimal with optional leading `-`.
pub fn parse_i64(data: &[u8]) -> ProtocolResult<i64> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
        if data.len() == 1 {
            return Err(ProtocolError::InvalidInteger);
        }
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
