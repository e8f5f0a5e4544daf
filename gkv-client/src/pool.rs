//! # Connection Pool
//!
//! Purpose: Share a bounded set of sockets to the resolved node between
//! every region and CQ of one client.
//!
//! ## Design Principles
//! 1. **Bounded**: `max_total` caps open sockets; asking for one more fails
//!    with `PoolExhausted` instead of waiting.
//! 2. **Short Critical Sections**: The lock covers bookkeeping only; dialing
//!    and I/O happen outside it.
//! 3. **Generation Tagging**: A socket remembers the resolution it was dialed
//!    under, and sockets to a replaced node are never handed out again.
//! 4. **Broken Means Gone**: A socket that failed an exchange is closed, not
//!    returned.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use gkv_common::{encode_command, read_response, RespValue};

use crate::client::{ClientError, ClientResult};
use crate::locator::ServerResolver;

/// Socket timeouts for every connection the client dials.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub max_idle: usize,
    pub max_total: usize,
    pub timeouts: Timeouts,
}

#[derive(Default)]
struct Slots {
    idle: VecDeque<Connection>,
    /// Idle plus checked-out connections.
    open: usize,
    closed: bool,
}

struct Shared {
    config: PoolConfig,
    resolver: Arc<ServerResolver>,
    slots: Mutex<Slots>,
}

impl Shared {
    /// Takes an idle socket of `generation`, dropping stale ones on the way.
    fn take_idle(&self, generation: u64) -> ClientResult<Option<Connection>> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(ClientError::Closed);
        }
        while let Some(conn) = slots.idle.pop_front() {
            if conn.generation == generation {
                return Ok(Some(conn));
            }
            slots.open -= 1;
            debug!(
                stale = conn.generation,
                current = generation,
                "dropping connection to replaced node"
            );
        }
        Ok(None)
    }

    fn reserve(&self) -> bool {
        let mut slots = self.slots.lock();
        if slots.open >= self.config.max_total {
            return false;
        }
        slots.open += 1;
        true
    }

    fn checkin(&self, conn: Option<Connection>) {
        let mut slots = self.slots.lock();
        match conn {
            Some(conn) if !slots.closed && slots.idle.len() < self.config.max_idle => {
                slots.idle.push_back(conn);
            }
            _ => slots.open = slots.open.saturating_sub(1),
        }
    }
}

pub(crate) struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, resolver: Arc<ServerResolver>) -> Self {
        ConnectionPool {
            shared: Arc::new(Shared {
                config,
                resolver,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    /// Checks out a socket to the currently resolved node, dialing if no
    /// idle one fits.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let (addr, generation) = self.shared.resolver.current();
        let conn = match self.shared.take_idle(generation)? {
            Some(conn) => conn,
            None => {
                if !self.shared.reserve() {
                    return Err(ClientError::PoolExhausted);
                }
                Connection::open(addr, self.shared.config.timeouts, generation).map_err(|err| {
                    self.shared.checkin(None);
                    err
                })?
            }
        };
        Ok(PooledConnection {
            shared: self.shared.clone(),
            conn: Some(conn),
        })
    }

    /// Closes idle sockets; checked-out ones close when returned.
    pub fn close(&self) {
        let mut slots = self.shared.slots.lock();
        slots.closed = true;
        let dropped = slots.idle.len();
        slots.idle.clear();
        slots.open -= dropped;
        debug!(dropped, in_use = slots.open, "pool closed");
    }
}

/// A checked-out socket; goes back to the pool on drop unless it broke.
pub(crate) struct PooledConnection {
    shared: Arc<Shared>,
    conn: Option<Connection>,
}

impl PooledConnection {
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = self.conn.as_mut().ok_or(ClientError::Closed)?;
        let reply = conn.exec(args);
        if reply.is_err() {
            // The stream may hold half a frame.
            self.conn = None;
            self.shared.checkin(None);
        }
        reply
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.checkin(Some(conn));
        }
    }
}

/// One socket plus the scratch buffers its exchanges reuse.
pub(crate) struct Connection {
    reader: BufReader<TcpStream>,
    line: Vec<u8>,
    request: Vec<u8>,
    generation: u64,
}

impl Connection {
    pub fn open(addr: SocketAddr, timeouts: Timeouts, generation: u64) -> ClientResult<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeouts.connect)?;
        stream.set_read_timeout(Some(timeouts.read))?;
        stream.set_write_timeout(Some(timeouts.write))?;
        stream.set_nodelay(true)?;
        debug!(%addr, generation, "connection opened");

        Ok(Connection {
            reader: BufReader::new(stream),
            line: Vec::with_capacity(128),
            request: Vec::with_capacity(256),
            generation,
        })
    }

    /// Sends one command and waits for its reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.request.clear();
        encode_command(args, &mut self.request);
        let stream = self.reader.get_mut();
        stream.write_all(&self.request)?;
        stream.flush()?;
        Ok(read_response(&mut self.reader, &mut self.line)?)
    }

    /// Gives up the socket, e.g. to the subscription reader.
    pub fn into_reader(self) -> BufReader<TcpStream> {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    use crate::config::Endpoint;

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(1),
            read: Duration::from_secs(1),
            write: Duration::from_secs(1),
        }
    }

    /// One listener acting as locator (pointing at itself) and as node.
    fn fake_grid() -> Arc<ServerResolver> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let mut writer = stream.try_clone().unwrap();
                    let mut reader = BufReader::new(stream);
                    let mut line = Vec::new();
                    while let Ok(RespValue::Array(args)) = read_response(&mut reader, &mut line) {
                        let reply = match args.first().and_then(RespValue::as_bulk) {
                            Some(b"LOCATE") => {
                                let mut out = Vec::new();
                                gkv_common::encode_value(&RespValue::bulk(addr.to_string()), &mut out);
                                out
                            }
                            _ => b"+PONG\r\n".to_vec(),
                        };
                        if writer.write_all(&reply).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        Arc::new(ServerResolver::connect(vec![endpoint], timeouts()).unwrap())
    }

    fn pool(resolver: Arc<ServerResolver>, max_idle: usize, max_total: usize) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                max_idle,
                max_total,
                timeouts: timeouts(),
            },
            resolver,
        )
    }

    fn open(pool: &ConnectionPool) -> usize {
        pool.shared.slots.lock().open
    }

    #[test]
    fn enforces_max_total_and_reuses_returned_sockets() {
        let resolver = fake_grid();
        let pool = pool(resolver, 1, 1);

        let mut first = pool.acquire().unwrap();
        assert_eq!(first.exec(&[b"PING"]).unwrap(), RespValue::Simple(b"PONG".to_vec()));
        assert!(matches!(pool.acquire(), Err(ClientError::PoolExhausted)));

        drop(first);
        assert_eq!(open(&pool), 1);
        let _again = pool.acquire().unwrap();
        assert_eq!(open(&pool), 1);
    }

    #[test]
    fn sockets_of_a_replaced_node_are_not_reused() {
        let resolver = fake_grid();
        let pool = pool(resolver.clone(), 2, 2);

        drop(pool.acquire().unwrap());
        assert_eq!(open(&pool), 1);

        resolver.re_resolve(resolver.generation()).unwrap();
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.conn.as_ref().unwrap().generation, 1);
        assert_eq!(open(&pool), 1);
    }

    #[test]
    fn closed_pool_refuses_checkouts() {
        let resolver = fake_grid();
        let pool = pool(resolver, 1, 1);
        let held = pool.acquire().unwrap();
        pool.close();
        assert!(matches!(pool.acquire(), Err(ClientError::Closed)));
        drop(held);
        assert_eq!(open(&pool), 0);
    }
}
