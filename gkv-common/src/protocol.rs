//! # Protocol Vocabulary
//!
//! Purpose: Name the commands, error classes and pushed frames exchanged
//! between the client, the locator and the grid node.
//!
//! ## Usage Notes
//!
//! - Requests are RESP2 arrays of bulk strings whose first element is one of
//!   the `CMD_*` constants.
//! - Error replies start with one of the `ERR_*` class words so the client can
//!   map them onto its error taxonomy without parsing free text.
//! - Keys and values travel as two bulk strings: the tag, then the payload.
//!
//! ## Pushed Frames
//!
//! ```text
//! CQ_EVENT <cq-name> <op> <key-tag> <key> <new-tag> <new> <old-tag> <old>
//! CQ_ERROR <cq-name> <message>
//! ```
//!
//! `new`/`old` pairs are null bulk strings when absent.

use std::fmt;

use crate::error::{FrameError, FrameResult};
use crate::resp::RespValue;
use crate::wire::WireValue;

/// Default port a locator listens on.
pub const DEFAULT_LOCATOR_PORT: u16 = 10334;

pub const CMD_LOCATE: &[u8] = b"LOCATE";
pub const CMD_PING: &[u8] = b"PING";
pub const CMD_REGION: &[u8] = b"REGION";
pub const CMD_PUT: &[u8] = b"PUT";
pub const CMD_GET: &[u8] = b"GET";
pub const CMD_DESTROY: &[u8] = b"DESTROY";
pub const CMD_INVALIDATE: &[u8] = b"INVALIDATE";
pub const CMD_QUERY: &[u8] = b"QUERY";
pub const CMD_SUBSCRIBE: &[u8] = b"SUBSCRIBE";
pub const CMD_CQ_REGISTER: &[u8] = b"CQ_REGISTER";
pub const CMD_CQ_CLOSE: &[u8] = b"CQ_CLOSE";

pub const PUSH_CQ_EVENT: &[u8] = b"CQ_EVENT";
pub const PUSH_CQ_ERROR: &[u8] = b"CQ_ERROR";

/// Generic failure.
pub const ERR_GENERIC: &str = "ERR";
/// The named region does not exist on the node.
pub const ERR_NO_REGION: &str = "NOREGION";
/// The query was malformed or failed to execute.
pub const ERR_QUERY: &str = "QUERY";
/// A continuous query of that name is already registered for the client.
pub const ERR_CQ_EXISTS: &str = "EXISTS";

/// Kind of change carried by a CQ event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqOperation {
    Create,
    Update,
    Destroy,
    Invalidate,
    Error,
}

impl CqOperation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CqOperation::Create => "CREATE",
            CqOperation::Update => "UPDATE",
            CqOperation::Destroy => "DESTROY",
            CqOperation::Invalidate => "INVALIDATE",
            CqOperation::Error => "ERROR",
        }
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"CREATE" => Some(CqOperation::Create),
            b"UPDATE" => Some(CqOperation::Update),
            b"DESTROY" => Some(CqOperation::Destroy),
            b"INVALIDATE" => Some(CqOperation::Invalidate),
            b"ERROR" => Some(CqOperation::Error),
            _ => None,
        }
    }
}

impl fmt::Display for CqOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes a value as a `[tag, payload]` reply.
pub fn encode_pair(value: &WireValue) -> RespValue {
    RespValue::Array(vec![
        RespValue::bulk(value.tag.as_bytes()),
        RespValue::bulk(value.bytes.clone()),
    ])
}

/// Decodes a `[tag, payload]` reply; the null bulk string means absent.
pub fn decode_pair(value: RespValue) -> FrameResult<Option<WireValue>> {
    match value {
        RespValue::Bulk(None) => Ok(None),
        RespValue::Array(items) => {
            let mut items = items.into_iter();
            match (items.next(), items.next(), items.next()) {
                (Some(tag), Some(bytes), None) => pair_from_parts(tag, bytes),
                _ => Err(FrameError::Protocol),
            }
        }
        _ => Err(FrameError::Protocol),
    }
}

fn pair_from_parts(tag: RespValue, bytes: RespValue) -> FrameResult<Option<WireValue>> {
    match (tag.into_bulk()?, bytes.into_bulk()?) {
        (Some(tag), Some(bytes)) => {
            let tag = String::from_utf8(tag).map_err(|_| FrameError::Protocol)?;
            Ok(Some(WireValue::new(tag, bytes)))
        }
        (None, None) => Ok(None),
        _ => Err(FrameError::Protocol),
    }
}

/// A change event pushed for one CQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqEventFrame {
    pub cq_name: String,
    pub operation: CqOperation,
    pub key: WireValue,
    pub new_value: Option<WireValue>,
    pub old_value: Option<WireValue>,
}

/// Frames the node pushes on a subscription connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Event(CqEventFrame),
    Error { cq_name: String, message: String },
}

impl PushFrame {
    /// Name of the CQ this frame is addressed to.
    pub fn cq_name(&self) -> &str {
        match self {
            PushFrame::Event(event) => &event.cq_name,
            PushFrame::Error { cq_name, .. } => cq_name,
        }
    }

    pub fn to_resp(&self) -> RespValue {
        match self {
            PushFrame::Event(event) => {
                let mut items = Vec::with_capacity(9);
                items.push(RespValue::bulk(PUSH_CQ_EVENT));
                items.push(RespValue::bulk(event.cq_name.as_bytes()));
                items.push(RespValue::bulk(event.operation.as_str()));
                push_pair(&mut items, Some(&event.key));
                push_pair(&mut items, event.new_value.as_ref());
                push_pair(&mut items, event.old_value.as_ref());
                RespValue::Array(items)
            }
            PushFrame::Error { cq_name, message } => RespValue::Array(vec![
                RespValue::bulk(PUSH_CQ_ERROR),
                RespValue::bulk(cq_name.as_bytes()),
                RespValue::bulk(message.as_bytes()),
            ]),
        }
    }

    pub fn from_resp(value: RespValue) -> FrameResult<Self> {
        let items = match value {
            RespValue::Array(items) => items,
            _ => return Err(FrameError::Protocol),
        };
        let mut items = items.into_iter();
        let kind = next_bulk(&mut items)?;
        let cq_name = String::from_utf8(next_bulk(&mut items)?).map_err(|_| FrameError::Protocol)?;

        if kind == PUSH_CQ_ERROR {
            let message = String::from_utf8_lossy(&next_bulk(&mut items)?).into_owned();
            return Ok(PushFrame::Error { cq_name, message });
        }
        if kind != PUSH_CQ_EVENT {
            return Err(FrameError::Protocol);
        }

        let operation = CqOperation::parse(&next_bulk(&mut items)?).ok_or(FrameError::Protocol)?;
        let key = next_pair(&mut items)?.ok_or(FrameError::Protocol)?;
        let new_value = next_pair(&mut items)?;
        let old_value = next_pair(&mut items)?;
        Ok(PushFrame::Event(CqEventFrame {
            cq_name,
            operation,
            key,
            new_value,
            old_value,
        }))
    }
}

fn push_pair(items: &mut Vec<RespValue>, value: Option<&WireValue>) {
    match value {
        Some(value) => {
            items.push(RespValue::bulk(value.tag.as_bytes()));
            items.push(RespValue::bulk(value.bytes.clone()));
        }
        None => {
            items.push(RespValue::null());
            items.push(RespValue::null());
        }
    }
}

fn next_bulk(items: &mut impl Iterator<Item = RespValue>) -> FrameResult<Vec<u8>> {
    items
        .next()
        .ok_or(FrameError::Protocol)?
        .into_bulk()?
        .ok_or(FrameError::Protocol)
}

fn next_pair(items: &mut impl Iterator<Item = RespValue>) -> FrameResult<Option<WireValue>> {
    let tag = items.next().ok_or(FrameError::Protocol)?;
    let bytes = items.next().ok_or(FrameError::Protocol)?;
    pair_from_parts(tag, bytes)
}
