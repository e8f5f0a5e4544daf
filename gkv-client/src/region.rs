//! # Region Proxy
//!
//! Purpose: A typed handle on a named remote region. It holds no data;
//! every read goes to the node.
//!
//! Keys and values are encoded with the client's codec. When the node
//! cannot be reached and no other server can be resolved, operations fail
//! with [`ClientError::RegionUnavailable`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use gkv_common::{
    decode_pair, RespValue, CMD_DESTROY, CMD_GET, CMD_INVALIDATE, CMD_PUT, CMD_REGION,
};
use tracing::debug;

use crate::client::{ClientError, ClientInner, ClientResult};
use crate::codec::{RegionKey, RegionValue};
use crate::cq::{CqHandle, CqListener};
use crate::query::{self, scoped_query, ResultSet};

/// Proxy for the region `name` holding `K -> V` entries.
pub struct Region<K, V> {
    name: String,
    client: Arc<ClientInner>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Region<K, V> {
    fn clone(&self) -> Self {
        Region {
            name: self.name.clone(),
            client: self.client.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for Region<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region").field("name", &self.name).finish()
    }
}

impl<K: RegionKey, V: RegionValue> Region<K, V> {
    /// Confirms the region exists on the node.
    pub(crate) fn open(client: Arc<ClientInner>, name: &str) -> ClientResult<Self> {
        let region = Region {
            name: name.to_string(),
            client,
            _types: PhantomData,
        };
        match region.exec(&[CMD_REGION, name.as_bytes()])? {
            RespValue::Simple(_) => {
                debug!(region = name, "region opened");
                Ok(region)
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &K, value: &V) -> ClientResult<()> {
        let key = key.to_wire();
        let value = value.encode(&self.client.codec)?;
        let reply = self.exec(&[
            CMD_PUT,
            self.name.as_bytes(),
            key.tag.as_bytes(),
            key.bytes.as_slice(),
            value.tag.as_bytes(),
            value.bytes.as_slice(),
        ])?;
        match reply {
            RespValue::Simple(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Reads the current value; `None` if absent or invalidated.
    pub fn get(&self, key: &K) -> ClientResult<Option<V>> {
        let key = key.to_wire();
        let reply = self.exec(&[
            CMD_GET,
            self.name.as_bytes(),
            key.tag.as_bytes(),
            key.bytes.as_slice(),
        ])?;
        match decode_pair(reply)? {
            Some(wire) => Ok(Some(V::decode(wire, &self.client.codec)?)),
            None => Ok(None),
        }
    }

    /// Deletes the entry; returns whether it existed.
    pub fn remove(&self, key: &K) -> ClientResult<bool> {
        self.keyed_flag(CMD_DESTROY, key)
    }

    /// Drops the value but keeps the key; returns whether a value was dropped.
    pub fn invalidate(&self, key: &K) -> ClientResult<bool> {
        self.keyed_flag(CMD_INVALIDATE, key)
    }

    /// Runs a query scoped to this region.
    ///
    /// A string starting with `SELECT` is sent verbatim; anything else is a
    /// predicate, e.g. `this.status = 'open'`.
    pub fn query<R: RegionValue>(&self, query: &str) -> ClientResult<ResultSet<R>> {
        if query.trim().is_empty() {
            return Err(ClientError::Query("empty query string".to_string()));
        }
        query::execute(&self.client, &scoped_query(&self.name, query))
            .map_err(|err| self.unavailable(err))
    }

    /// Creates a continuous query with a generated name.
    pub fn new_cq<L>(&self, query: &str, listener: L) -> ClientResult<CqHandle>
    where
        L: CqListener<K, V>,
    {
        let name = self.client.next_cq_name();
        self.new_named_cq(&name, query, listener)
    }

    /// Creates a continuous query; call [`CqHandle::execute`] to start it.
    pub fn new_named_cq<L>(&self, name: &str, query: &str, listener: L) -> ClientResult<CqHandle>
    where
        L: CqListener<K, V>,
    {
        if query.trim().is_empty() {
            return Err(ClientError::Query("empty query string".to_string()));
        }
        CqHandle::create::<K, V, L>(
            self.client.clone(),
            name.to_string(),
            scoped_query(&self.name, query),
            listener,
        )
    }

    fn keyed_flag(&self, command: &[u8], key: &K) -> ClientResult<bool> {
        let key = key.to_wire();
        let args = [command, self.name.as_bytes(), key.tag.as_bytes(), key.bytes.as_slice()];
        match self.exec(&args)? {
            RespValue::Integer(n) => Ok(n > 0),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sends a command, turning error replies and a lost grid into errors.
    fn exec(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        match self.client.exec(args) {
            Ok(RespValue::Error(message)) => Err(ClientError::from_reply(message)),
            Ok(reply) => Ok(reply),
            Err(err) => Err(self.unavailable(err)),
        }
    }

    fn unavailable(&self, err: ClientError) -> ClientError {
        match err {
            ClientError::Connection(reason) => ClientError::RegionUnavailable {
                region: self.name.clone(),
                reason,
            },
            other => other,
        }
    }
}
