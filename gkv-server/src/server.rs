//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! region store and the CQ registry. A connection that sends `SUBSCRIBE`
//! becomes a push-only channel for that client's CQ frames.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info};

use gkv_common::{
    encode_pair, RespValue, WireValue, CMD_CQ_CLOSE, CMD_CQ_REGISTER, CMD_DESTROY, CMD_GET,
    CMD_INVALIDATE, CMD_PING, CMD_PUT, CMD_QUERY, CMD_REGION, CMD_SUBSCRIBE, ERR_GENERIC,
    ERR_CQ_EXISTS, ERR_NO_REGION, ERR_QUERY,
};

use crate::cq::{CqRegistry, RegisterError};
use crate::error::ServerError;
use crate::protocol::{encode_reply, RespError, RespParser};
use crate::query::Query;
use crate::store::{RegionStore, Store};

/// Shared state of one grid node.
pub struct GridNode {
    store: Store,
    cqs: CqRegistry,
}

impl GridNode {
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        GridNode {
            store: Store::new(regions),
            cqs: CqRegistry::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cqs(&self) -> &CqRegistry {
        &self.cqs
    }
}

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, node: Arc<GridNode>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "set_nodelay failed");
        }
        let node = node.clone();
        tokio::spawn(async move {
            debug!(%peer, "connection accepted");
            if let Err(err) = handle_connection(stream, node).await {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}

enum Outcome {
    Reply(RespValue),
    Subscribe(String),
}

/// Handles a single TCP client connection.
pub async fn handle_connection(stream: TcpStream, node: Arc<GridNode>) -> io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => match dispatch_command(&args, &node) {
                    Outcome::Reply(reply) => stream.write_all(&encode_reply(&reply)).await?,
                    Outcome::Subscribe(client_id) => {
                        return serve_subscriber(stream, client_id, node).await;
                    }
                },
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    let reply = RespValue::error(ERR_GENERIC, "protocol error");
                    stream.write_all(&encode_reply(&reply)).await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Pushes CQ frames for `client_id` until the client disconnects.
async fn serve_subscriber(
    stream: TcpStream,
    client_id: String,
    node: Arc<GridNode>,
) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();
    // Queued first so the acknowledgement precedes every pushed frame.
    let _ = sender.send(encode_reply(&RespValue::Simple(b"OK".to_vec())));
    let token = node.cqs.subscribe(&client_id, sender);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    // Nothing but disconnects is expected from here on.
    let mut scratch = [0u8; 512];
    let result = loop {
        match reader.read(&mut scratch).await {
            Ok(0) => break Ok(()),
            Ok(_) => continue,
            Err(err) => break Err(err),
        }
    };

    node.cqs.unsubscribe(&client_id, token);
    writer_task.abort();
    info!(client_id = %client_id, "subscription connection closed");
    result
}

/// Success and error replies alike; the error side short-circuits with `?`.
type Reply = Result<RespValue, RespValue>;

fn dispatch_command(args: &[Vec<u8>], node: &GridNode) -> Outcome {
    let cmd = match args.first() {
        Some(cmd) => cmd.as_slice(),
        None => return Outcome::Reply(resp_error("empty command")),
    };

    if cmd.eq_ignore_ascii_case(CMD_SUBSCRIBE) {
        return match handle_subscribe(args) {
            Ok(client_id) => Outcome::Subscribe(client_id),
            Err(reply) => Outcome::Reply(reply),
        };
    }

    let reply = if cmd.eq_ignore_ascii_case(CMD_PING) {
        handle_ping(args)
    } else if cmd.eq_ignore_ascii_case(CMD_REGION) {
        handle_region(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_PUT) {
        handle_put(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_GET) {
        handle_get(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_DESTROY) {
        handle_destroy(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_INVALIDATE) {
        handle_invalidate(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_QUERY) {
        handle_query(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_CQ_REGISTER) {
        handle_cq_register(args, node)
    } else if cmd.eq_ignore_ascii_case(CMD_CQ_CLOSE) {
        handle_cq_close(args, node)
    } else {
        Err(resp_error("unknown command"))
    };
    Outcome::Reply(reply.unwrap_or_else(|err| err))
}

fn arity(args: &[Vec<u8>], expected: usize, command: &str) -> Result<(), RespValue> {
    if args.len() != expected {
        return Err(resp_error(&format!("wrong number of arguments for {}", command)));
    }
    Ok(())
}

fn handle_ping(args: &[Vec<u8>]) -> Reply {
    match args.len() {
        1 => Ok(RespValue::Simple(b"PONG".to_vec())),
        2 => Ok(RespValue::bulk(args[1].clone())),
        _ => Err(resp_error("wrong number of arguments for PING")),
    }
}

fn handle_subscribe(args: &[Vec<u8>]) -> Result<String, RespValue> {
    arity(args, 2, "SUBSCRIBE")?;
    text(&args[1]).map(str::to_string)
}

fn handle_region(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 2, "REGION")?;
    region_arg(node, &args[1])?;
    Ok(resp_ok())
}

fn handle_put(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 6, "PUT")?;
    let region = region_arg(node, &args[1])?;
    let key = wire_arg(&args[2], &args[3])?;
    let value = wire_arg(&args[4], &args[5])?;
    region.put(key, value, &node.cqs);
    Ok(resp_ok())
}

fn handle_get(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 4, "GET")?;
    let region = region_arg(node, &args[1])?;
    let key = wire_arg(&args[2], &args[3])?;
    Ok(match region.get(&key) {
        Some(value) => encode_pair(&value),
        None => RespValue::null(),
    })
}

fn handle_destroy(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 4, "DESTROY")?;
    let region = region_arg(node, &args[1])?;
    let key = wire_arg(&args[2], &args[3])?;
    Ok(resp_flag(region.destroy(&key, &node.cqs)))
}

fn handle_invalidate(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 4, "INVALIDATE")?;
    let region = region_arg(node, &args[1])?;
    let key = wire_arg(&args[2], &args[3])?;
    Ok(resp_flag(region.invalidate(&key, &node.cqs)))
}

fn handle_query(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 2, "QUERY")?;
    let query = parse_query(&args[1])?;
    let rows = query_region(node, &query)?
        .select(&query)
        .map_err(server_error)?;
    debug!(region = query.region(), rows = rows.len(), "query evaluated");
    let rows = rows
        .iter()
        .map(|row| row.as_ref().map_or_else(RespValue::null, encode_pair))
        .collect();
    Ok(RespValue::Array(rows))
}

fn handle_cq_register(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 4, "CQ_REGISTER")?;
    let client_id = text(&args[1])?;
    let name = text(&args[2])?;
    let query = parse_query(&args[3])?;
    query_region(node, &query)?;
    match node.cqs.register(client_id, name, query) {
        Ok(()) => Ok(resp_ok()),
        Err(RegisterError::NotSubscribed) => Err(resp_error("client has no subscription")),
        Err(RegisterError::Exists) => Err(RespValue::error(ERR_CQ_EXISTS, &single_line(name))),
        Err(RegisterError::Projection) => Err(RespValue::error(
            ERR_QUERY,
            "continuous queries must select *",
        )),
    }
}

fn handle_cq_close(args: &[Vec<u8>], node: &GridNode) -> Reply {
    arity(args, 3, "CQ_CLOSE")?;
    let client_id = text(&args[1])?;
    let name = text(&args[2])?;
    Ok(resp_flag(node.cqs.close(client_id, name)))
}

fn parse_query(raw: &[u8]) -> Result<Query, RespValue> {
    Query::parse(text(raw)?).map_err(server_error)
}

fn region_arg<'a>(node: &'a GridNode, raw: &[u8]) -> Result<&'a Arc<RegionStore>, RespValue> {
    node.store.region(text(raw)?).map_err(server_error)
}

/// Queries name their region in the text; a missing one is a query error.
fn query_region<'a>(node: &'a GridNode, query: &Query) -> Result<&'a Arc<RegionStore>, RespValue> {
    node.store.region(query.region()).map_err(|err| match err {
        ServerError::NoRegion(name) => server_error(ServerError::query(format!(
            "region not found: /{}",
            name
        ))),
        other => server_error(other),
    })
}

fn wire_arg(tag: &[u8], bytes: &[u8]) -> Result<WireValue, RespValue> {
    let tag = text(tag)?;
    if tag.is_empty() {
        return Err(resp_error("empty type tag"));
    }
    Ok(WireValue::new(tag, bytes))
}

fn text(raw: &[u8]) -> Result<&str, RespValue> {
    std::str::from_utf8(raw).map_err(|_| resp_error("argument is not valid UTF-8"))
}

fn server_error(err: ServerError) -> RespValue {
    match err {
        ServerError::NoRegion(name) => RespValue::error(ERR_NO_REGION, &single_line(&name)),
        ServerError::Query(message) => RespValue::error(ERR_QUERY, &single_line(&message)),
        other => resp_error(&other.to_string()),
    }
}

/// Error replies end at the first CRLF.
fn single_line(message: &str) -> String {
    message.replace(['\r', '\n'], " ")
}

fn resp_ok() -> RespValue {
    RespValue::Simple(b"OK".to_vec())
}

fn resp_flag(flag: bool) -> RespValue {
    RespValue::Integer(i64::from(flag))
}

fn resp_error(message: &str) -> RespValue {
    RespValue::error(ERR_GENERIC, &single_line(message))
}
