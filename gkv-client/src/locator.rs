//! # Server Discovery
//!
//! Purpose: Ask locators for a live grid node and re-ask when that node
//! fails, with at most one resolution in flight per failure.
//!
//! Every successful resolution bumps a generation counter. A caller that saw
//! a failure under generation `g` only re-resolves if the generation is still
//! `g`; otherwise someone else already replaced the failed server.

use std::net::{SocketAddr, ToSocketAddrs};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use gkv_common::{RespValue, CMD_LOCATE};

use crate::client::{ClientError, ClientResult};
use crate::config::Endpoint;
use crate::pool::{Connection, Timeouts};

pub(crate) struct ServerResolver {
    locators: Vec<Endpoint>,
    timeouts: Timeouts,
    current: RwLock<(SocketAddr, u64)>,
    resolving: Mutex<()>,
}

impl ServerResolver {
    /// Performs the initial resolution; no live locator is fatal.
    pub fn connect(locators: Vec<Endpoint>, timeouts: Timeouts) -> ClientResult<Self> {
        let server = locate(&locators, timeouts)?;
        info!(%server, "locator resolved server");
        Ok(ServerResolver {
            locators,
            timeouts,
            current: RwLock::new((server, 0)),
            resolving: Mutex::new(()),
        })
    }

    /// Current server address and the generation it was resolved under.
    pub fn current(&self) -> (SocketAddr, u64) {
        *self.current.read()
    }

    pub fn generation(&self) -> u64 {
        self.current.read().1
    }

    /// Replaces the server observed failing under `observed` generation.
    pub fn re_resolve(&self, observed: u64) -> ClientResult<SocketAddr> {
        let _guard = self.resolving.lock();
        let (addr, generation) = self.current();
        if generation != observed {
            debug!(%addr, generation, "server already re-resolved");
            return Ok(addr);
        }

        let server = locate(&self.locators, self.timeouts)?;
        let mut current = self.current.write();
        *current = (server, generation + 1);
        if server != addr {
            info!(old = %addr, new = %server, "switched to a different server");
        }
        Ok(server)
    }
}

fn locate(locators: &[Endpoint], timeouts: Timeouts) -> ClientResult<SocketAddr> {
    let mut failures = Vec::with_capacity(locators.len());
    for locator in locators {
        match ask_locator(locator, timeouts) {
            Ok(server) => return Ok(server),
            Err(err) => {
                warn!(%locator, error = %err, "locator did not answer");
                failures.push(format!("{}: {}", locator, err));
            }
        }
    }
    Err(ClientError::Connection(format!(
        "no locator reachable ({})",
        failures.join("; ")
    )))
}

fn ask_locator(locator: &Endpoint, timeouts: Timeouts) -> ClientResult<SocketAddr> {
    let mut last_err = None;
    for addr in resolve(&locator.to_string())? {
        let reply = Connection::open(addr, timeouts, 0).and_then(|mut conn| conn.exec(&[CMD_LOCATE]));
        match reply {
            Ok(RespValue::Bulk(Some(data))) => {
                let server = String::from_utf8(data)
                    .map_err(|_| ClientError::InvalidAddress("<non-utf8>".to_string()))?;
                return resolve(&server)?
                    .next()
                    .ok_or(ClientError::InvalidAddress(server));
            }
            Ok(RespValue::Error(message)) => return Err(ClientError::from_reply(message)),
            Ok(_) => return Err(ClientError::UnexpectedResponse),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| ClientError::InvalidAddress(locator.to_string())))
}

fn resolve(addr: &str) -> ClientResult<std::vec::IntoIter<SocketAddr>> {
    addr.to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress(addr.to_string()))
}
