//! # RESP2 Framing
//!
//! Both peers speak plain RESP2: commands are arrays of bulk strings, replies
//! are any RESP2 value, and the node's pushed CQ frames are arrays on the
//! subscription socket. Bulk payloads are raw bytes.
//!
//! The blocking reader here serves the client and tests; the node parses
//! incrementally from its own buffer.

use std::io::{BufRead, ErrorKind, Write};

use crate::error::{FrameError, FrameResult};

/// Largest bulk payload either peer accepts.
pub const MAX_BULK_LEN: usize = 64 * 1024 * 1024;

/// One RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`, `+PONG`.
    Simple(Vec<u8>),
    /// `-CLASS message`; the first word names the error class.
    Error(Vec<u8>),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`).
    Bulk(Option<Vec<u8>>),
    /// Query rows and pushed frames.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    pub fn null() -> Self {
        RespValue::Bulk(None)
    }

    /// `-CLASS message` reply.
    pub fn error(class: &str, message: &str) -> Self {
        RespValue::Error(format!("{} {}", class, message).into_bytes())
    }

    pub fn as_bulk(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Payload of a bulk string; anything else is a framing error.
    pub fn into_bulk(self) -> FrameResult<Option<Vec<u8>>> {
        match self {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(FrameError::Protocol),
        }
    }
}

/// Splits `CLASS rest of message` at the first space.
pub fn split_error(message: &[u8]) -> (&[u8], &[u8]) {
    match message.iter().position(|byte| *byte == b' ') {
        Some(at) => (&message[..at], &message[at + 1..]),
        None => (message, &[]),
    }
}

/// Appends a command (array of bulk strings) to `out`.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    write_header(out, b'*', args.len() as i64);
    for arg in args {
        write_bulk(out, arg);
    }
}

/// Appends any value to `out`.
pub fn encode_value(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::Simple(text) => write_line(out, b'+', text),
        RespValue::Error(text) => write_line(out, b'-', text),
        RespValue::Integer(n) => write_header(out, b':', *n),
        RespValue::Bulk(Some(data)) => write_bulk(out, data),
        RespValue::Bulk(None) => write_header(out, b'$', -1),
        RespValue::Array(items) => {
            write_header(out, b'*', items.len() as i64);
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

fn write_line(out: &mut Vec<u8>, prefix: u8, text: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(text);
    out.extend_from_slice(b"\r\n");
}

fn write_header(out: &mut Vec<u8>, prefix: u8, n: i64) {
    out.push(prefix);
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{}", n);
    out.extend_from_slice(b"\r\n");
}

fn write_bulk(out: &mut Vec<u8>, data: &[u8]) {
    write_header(out, b'$', data.len() as i64);
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Reads one complete value. `line` is scratch space reused across calls.
pub fn read_response<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> FrameResult<RespValue> {
    next_line(reader, line)?;
    let (&prefix, payload) = line.split_first().ok_or(FrameError::Protocol)?;
    match prefix {
        b'+' => Ok(RespValue::Simple(payload.to_vec())),
        b'-' => Ok(RespValue::Error(payload.to_vec())),
        b':' => parse_i64(payload).map(RespValue::Integer),
        b'$' => match usize::try_from(parse_i64(payload)?) {
            Ok(len) if len > MAX_BULK_LEN => Err(FrameError::Protocol),
            Ok(len) => read_payload(reader, len).map(|data| RespValue::Bulk(Some(data))),
            Err(_) => Ok(RespValue::null()),
        },
        b'*' => {
            let count = usize::try_from(parse_i64(payload)?).unwrap_or(0);
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_response(reader, line)?);
            }
            Ok(RespValue::Array(items))
        }
        _ => Err(FrameError::Protocol),
    }
}

/// Reads `len` payload bytes plus the trailing CRLF.
fn read_payload<R: BufRead>(reader: &mut R, len: usize) -> FrameResult<Vec<u8>> {
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => FrameError::Eof,
        _ => FrameError::Io(err),
    })?;
    if !data.ends_with(b"\r\n") {
        return Err(FrameError::Protocol);
    }
    data.truncate(len);
    Ok(data)
}

/// Fills `line` with the next CRLF-terminated line, terminator stripped.
fn next_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> FrameResult<()> {
    line.clear();
    if reader.read_until(b'\n', line)? == 0 {
        return Err(FrameError::Eof);
    }
    if !line.ends_with(b"\r\n") {
        return Err(FrameError::Protocol);
    }
    line.truncate(line.len() - 2);
    Ok(())
}

/// Parses the decimal number of a `:`, `$` or `*` header.
pub fn parse_i64(digits: &[u8]) -> FrameResult<i64> {
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::Protocol);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(FrameError::Protocol)
}
