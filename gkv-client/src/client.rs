//! # Grid Client
//!
//! Purpose: Expose a compact, blocking API over a pooled connection to a
//! grid node discovered through one or more locators.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `GridClient` hides discovery, pooling, retries and
//!    the subscription channel behind regions and CQ handles.
//! 2. **Bounded Retries**: Transient transport failures re-resolve the server
//!    and retry with exponential backoff, never indefinitely.
//! 3. **Fail Fast**: Protocol violations and server-side rejections surface
//!    immediately as errors.
//! 4. **Idempotent Shutdown**: `close` may be called any number of times and
//!    runs automatically when the last handle is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use gkv_common::{
    split_error, CodecError, FrameError, RespValue, CMD_CQ_CLOSE, CMD_PING, ERR_CQ_EXISTS,
    ERR_NO_REGION, ERR_QUERY,
};

use crate::codec::{Codec, RegionKey, RegionValue};
use crate::config::ClientConfig;
use crate::cq::{CqRegistry, CqState};
use crate::locator::ServerResolver;
use crate::pool::{ConnectionPool, PoolConfig, Timeouts};
use crate::query::{self, ResultSet};
use crate::region::Region;
use crate::subscription::SubscriptionChannel;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No locator (or no server behind it) could be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// A transient failure persisted through every retry.
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Retryable { attempts: u32, last_error: String },
    /// The region does not exist or its server cannot be reached.
    #[error("region `{region}` unavailable: {reason}")]
    RegionUnavailable { region: String, reason: String },
    /// Malformed query or server-side execution failure.
    #[error("query error: {0}")]
    Query(String),
    /// Unknown type tag or field-shape mismatch.
    #[error("serialization error: {0}")]
    Serialization(#[from] CodecError),
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The server closed the connection mid-exchange.
    #[error("connection closed by server")]
    Disconnected,
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply without a more specific class.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be parsed or resolved.
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    /// The client has been closed.
    #[error("client is closed")]
    Closed,
    /// A CQ operation is not valid in the CQ's current state.
    #[error("continuous query `{name}` is {state}")]
    InvalidCqState { name: String, state: CqState },
    /// A CQ with this name already exists on this client or on the node.
    #[error("continuous query `{0}` already exists")]
    CqExists(String),
    /// Continuous queries need `subscription_enabled`.
    #[error("subscriptions are disabled for this client")]
    SubscriptionDisabled,
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true for failures worth retrying on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Disconnected)
    }

    /// Maps an error reply onto the taxonomy using its class word.
    pub(crate) fn from_reply(message: Vec<u8>) -> Self {
        let (class, rest) = split_error(&message);
        let rest = String::from_utf8_lossy(rest).into_owned();
        if class == ERR_QUERY.as_bytes() {
            ClientError::Query(rest)
        } else if class == ERR_NO_REGION.as_bytes() {
            ClientError::RegionUnavailable {
                region: rest,
                reason: "region not found on server".to_string(),
            }
        } else if class == ERR_CQ_EXISTS.as_bytes() {
            ClientError::CqExists(rest)
        } else {
            ClientError::Server { message }
        }
    }
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => ClientError::Io(err),
            FrameError::Eof => ClientError::Disconnected,
            FrameError::Protocol => ClientError::Protocol,
        }
    }
}

/// Client connected to a grid through its locators.
///
/// Cheap to clone; clones share the pool, the codec and the subscription
/// channel. The connection is closed by [`GridClient::close`] or when the
/// last clone (and every region/CQ handle created from it) is dropped.
#[derive(Clone)]
pub struct GridClient {
    inner: Arc<ClientInner>,
}

impl GridClient {
    /// Resolves a server through the locators and opens the connection.
    ///
    /// Fails with [`ClientError::Connection`] when no locator answers or the
    /// resolved server does not respond.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let codec = Arc::new(Codec::new(&config.serialization)?);
        let timeouts = Timeouts {
            connect: config.connect_timeout,
            read: config.read_timeout,
            write: config.write_timeout,
        };

        let resolver = Arc::new(ServerResolver::connect(config.locators.clone(), timeouts)?);
        let (server, _) = resolver.current();
        let pool = ConnectionPool::new(
            PoolConfig {
                max_idle: config.max_idle,
                max_total: config.max_total,
                timeouts,
            },
            resolver.clone(),
        );

        let cqs = Arc::new(CqRegistry::new(codec.clone()));
        let client = GridClient {
            inner: Arc::new(ClientInner {
                config,
                client_id: next_client_id(),
                timeouts,
                resolver,
                pool,
                codec,
                cqs,
                subscription: Mutex::new(None),
                closed: AtomicBool::new(false),
                next_cq: AtomicU64::new(1),
            }),
        };

        client.ping().map_err(|err| {
            client.close();
            ClientError::Connection(format!("server {} did not respond: {}", server, err))
        })?;
        if client.inner.config.subscription_enabled {
            client.inner.ensure_subscription().map_err(|err| {
                client.close();
                err
            })?;
        }
        debug!(%server, client_id = %client.inner.client_id, "client connected");
        Ok(client)
    }

    /// Opens a proxy for a region that must exist on the server.
    pub fn region<K: RegionKey, V: RegionValue>(&self, name: &str) -> ClientResult<Region<K, V>> {
        Region::open(self.inner.clone(), name)
    }

    /// Runs an unscoped query; the string is sent verbatim.
    pub fn query<R: RegionValue>(&self, query: &str) -> ClientResult<ResultSet<R>> {
        query::execute(&self.inner, query)
    }

    /// Codec used for every region of this client.
    ///
    /// Register application types here before using them.
    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Pings the server.
    pub fn ping(&self) -> ClientResult<()> {
        match self.inner.exec(&[CMD_PING])? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::from_reply(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Identifier the server associates with this client's subscriptions.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Names of the CQs currently running on this client.
    pub fn running_cqs(&self) -> Vec<String> {
        self.inner.cqs.running_names()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Closes every CQ, the subscription channel and the pool. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    client_id: String,
    timeouts: Timeouts,
    resolver: Arc<ServerResolver>,
    pool: ConnectionPool,
    pub(crate) codec: Arc<Codec>,
    pub(crate) cqs: Arc<CqRegistry>,
    /// Channel to the server CQs are registered on; reopened on demand.
    subscription: Mutex<Option<SubscriptionChannel>>,
    closed: AtomicBool,
    next_cq: AtomicU64,
}

impl ClientInner {
    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Makes sure pushed CQ frames from the current server can be received.
    ///
    /// A lost channel, or one still bound to a server the client has moved
    /// away from, is replaced by a fresh one to the current server. CQs still
    /// running on the old server are failed, since writes no longer reach
    /// them.
    pub(crate) fn ensure_subscription(&self) -> ClientResult<()> {
        if !self.config.subscription_enabled {
            return Err(ClientError::SubscriptionDisabled);
        }

        let (stale, opened) = {
            let mut slot = self.subscription.lock();
            if self.is_closed() {
                return Err(ClientError::Closed);
            }
            let server = self.resolver.current().0;
            if slot
                .as_ref()
                .is_some_and(|channel| channel.is_alive() && channel.server() == server)
            {
                return Ok(());
            }
            let stale = slot.take();
            let opened = self
                .open_subscription()
                .map(|channel| *slot = Some(channel));
            (stale, opened)
        };

        // Listeners run outside the lock so they may use the client.
        if let Some(stale) = stale {
            if stale.is_alive() {
                self.cqs
                    .fail_all(&format!("server {} replaced, continuous query dropped", stale.server()));
            }
            stale.shutdown(self.config.close_grace);
        }
        opened
    }

    /// Subscribes on the current server, retrying like any other command.
    fn open_subscription(&self) -> ClientResult<SubscriptionChannel> {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (server, generation) = self.resolver.current();
            let opened =
                SubscriptionChannel::open(server, &self.client_id, self.timeouts, self.cqs.clone());
            let err = match opened {
                Ok(channel) => return Ok(channel),
                Err(err) if err.is_transient() && attempt < policy.max_attempts => err,
                Err(err) => {
                    return Err(ClientError::Connection(format!(
                        "subscription channel to {}: {}",
                        server, err
                    )))
                }
            };

            let delay = policy.backoff(attempt);
            warn!(attempt, ?delay, %server, error = %err, "subscription failed, retrying");
            thread::sleep(delay);
            if let Err(err) = self.resolver.re_resolve(generation) {
                debug!(error = %err, "re-resolution for subscription failed");
            }
        }
    }

    /// Moves the subscription along after data traffic switched servers.
    fn follow_server(&self, server: SocketAddr) {
        let bound = self.subscription.lock().as_ref().map(SubscriptionChannel::server);
        if bound.is_some_and(|bound| bound != server) && !self.is_closed() {
            if let Err(err) = self.ensure_subscription() {
                warn!(%server, error = %err, "subscription not moved, next execute retries");
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn next_cq_name(&self) -> String {
        format!("{}-cq-{}", self.client_id, self.next_cq.fetch_add(1, Ordering::Relaxed))
    }

    /// Executes one command, retrying transient failures.
    ///
    /// Each retry waits for the policy's backoff and asks the locators for a
    /// live server first. Exhaustion yields `Retryable`, or `Connection` when
    /// the last re-resolution found no server at all.
    pub(crate) fn exec(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.exec_counted(args).map(|(reply, _)| reply)
    }

    /// Like `exec`, also reporting how many attempts the reply took.
    pub(crate) fn exec_counted(&self, args: &[&[u8]]) -> ClientResult<(RespValue, u32)> {
        let policy = &self.config.retry;
        let mut unresolved: Option<ClientError> = None;
        let mut attempt = 0;
        loop {
            if self.is_closed() {
                return Err(ClientError::Closed);
            }
            attempt += 1;
            let generation = self.resolver.generation();
            let err = match self.exec_once(args) {
                Ok(response) => return Ok((response, attempt)),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            if attempt >= policy.max_attempts {
                return Err(match unresolved {
                    Some(resolve_err) => ClientError::Connection(resolve_err.to_string()),
                    None => ClientError::Retryable {
                        attempts: attempt,
                        last_error: err.to_string(),
                    },
                });
            }

            let delay = policy.backoff(attempt);
            warn!(attempt, ?delay, error = %err, "transient failure, retrying");
            thread::sleep(delay);
            match self.resolver.re_resolve(generation) {
                Ok(server) => {
                    unresolved = None;
                    self.follow_server(server);
                }
                Err(err) => unresolved = Some(err),
            }
        }
    }

    fn exec_once(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut conn = self.pool.acquire()?;
        conn.exec(args)
    }

    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for name in self.cqs.close_all() {
            // Single attempt: the server also drops CQs with the subscription socket.
            let outcome = self.exec_once(&[CMD_CQ_CLOSE, self.client_id.as_bytes(), name.as_bytes()]);
            if let Err(err) = outcome {
                debug!(cq = %name, error = %err, "deregistration skipped during close");
            }
        }

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.shutdown(self.config.close_grace);
        }
        self.pool.close();
        debug!(client_id = %self.client_id, "client closed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{:x}-{}",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
