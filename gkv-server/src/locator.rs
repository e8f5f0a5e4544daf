//! # Locator
//!
//! Answers `LOCATE` with the data address clients should connect to.
//! This node is the only server it knows about.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use gkv_common::{RespValue, CMD_LOCATE, CMD_PING, ERR_GENERIC};

use crate::protocol::{encode_reply, RespError, RespParser};

/// Accepts locator connections until the listener fails.
pub async fn serve(listener: TcpListener, advertise: String) -> io::Result<()> {
    let advertise: Arc<str> = Arc::from(advertise);
    loop {
        let (stream, peer) = listener.accept().await?;
        let advertise = advertise.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &advertise).await {
                debug!(%peer, error = %err, "locator connection closed with error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, advertise: &str) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(512);
    let mut parser = RespParser::new();

    loop {
        if stream.read_buf(&mut buffer).await? == 0 {
            return Ok(());
        }
        loop {
            let reply = match parser.parse(&mut buffer) {
                Ok(Some(args)) => answer(&args, advertise),
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    let reply = RespValue::error(ERR_GENERIC, "protocol error");
                    stream.write_all(&encode_reply(&reply)).await?;
                    return Ok(());
                }
            };
            stream.write_all(&encode_reply(&reply)).await?;
        }
    }
}

fn answer(args: &[Vec<u8>], advertise: &str) -> RespValue {
    match args.first().map(Vec::as_slice) {
        Some(cmd) if cmd.eq_ignore_ascii_case(CMD_LOCATE) => {
            debug!(server = advertise, "locate answered");
            RespValue::bulk(advertise.as_bytes())
        }
        Some(cmd) if cmd.eq_ignore_ascii_case(CMD_PING) => RespValue::Simple(b"PONG".to_vec()),
        _ => RespValue::error(ERR_GENERIC, "locator only answers LOCATE"),
    }
}
