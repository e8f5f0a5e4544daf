//! # Request Parser
//!
//! Incremental RESP2 parser for client requests. Requests are arrays of
//! bulk strings; a frame is consumed from the buffer only once it is
//! complete, so partial reads simply wait for more bytes.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use gkv_common::{encode_value, parse_i64, RespValue, MAX_BULK_LEN};

/// Upper bound on arguments per request.
const MAX_ARGS: i64 = 1024;
/// Upper bound on a single bulk argument.
const MAX_BULK: i64 = MAX_BULK_LEN as i64;
/// Longest header line (`*<n>` / `$<n>`) accepted before CRLF.
const MAX_HEADER: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RespError {
    #[error("protocol error")]
    Protocol,
}

#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one request; `Ok(None)` means more bytes are needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut pos = 0;
        let count = match read_header(buf, &mut pos, b'*')? {
            Some(count) => count,
            None => return Ok(None),
        };
        if !(0..=MAX_ARGS).contains(&count) {
            return Err(RespError::Protocol);
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = match read_header(buf, &mut pos, b'$')? {
                Some(len) => len,
                None => return Ok(None),
            };
            if !(0..=MAX_BULK).contains(&len) {
                return Err(RespError::Protocol);
            }
            let len = len as usize;
            let end = pos + len + 2;
            if buf.len() < end {
                return Ok(None);
            }
            if &buf[pos + len..end] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buf[pos..pos + len].to_vec());
            pos = end;
        }

        buf.advance(pos);
        Ok(Some(args))
    }
}

fn read_header(buf: &[u8], pos: &mut usize, prefix: u8) -> Result<Option<i64>, RespError> {
    let start = *pos;
    if buf.len() <= start {
        return Ok(None);
    }
    if buf[start] != prefix {
        return Err(RespError::Protocol);
    }
    let line = &buf[start + 1..];
    let line_end = match line.windows(2).position(|window| window == b"\r\n") {
        Some(idx) => idx,
        None if line.len() > MAX_HEADER => return Err(RespError::Protocol),
        None => return Ok(None),
    };
    let value = parse_i64(&line[..line_end]).map_err(|_| RespError::Protocol)?;
    *pos = start + 1 + line_end + 2;
    Ok(Some(value))
}

/// Serializes a reply.
pub fn encode_reply(value: &RespValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(value, &mut out);
    out
}
