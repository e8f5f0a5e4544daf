//! # Continuous Queries
//!
//! Purpose: Keep standing queries registered on the node and hand the
//! change events it pushes to application listeners.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: CREATED -> RUNNING -> CLOSED, one way only.
//! 2. **Single Delivery Thread**: Listeners are invoked from the client's one
//!    delivery thread, in the order frames arrive.
//! 3. **Close Is Immediate**: A closed CQ stops dispatching at once; frames
//!    still in flight for it are dropped.
//! 4. **Errors Close**: `on_error` fires at most once, and the CQ is CLOSED
//!    before it runs.
//!
//! ## Architecture
//!
//! ```text
//! CqHandle ──execute/close──► ClientInner ──CQ_REGISTER / CQ_CLOSE──► node
//!     │                                                               │
//!     └── Arc<CqShared> ◄── CqRegistry ◄── delivery thread ◄── push ──┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use gkv_common::{
    CodecResult, CqEventFrame, CqOperation, PushFrame, RespValue, CMD_CQ_CLOSE, CMD_CQ_REGISTER,
};

use crate::client::{ClientError, ClientInner, ClientResult};
use crate::codec::{Codec, RegionKey, RegionValue};

/// Lifecycle of a continuous query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqState {
    Created,
    Running,
    Closed,
}

impl fmt::Display for CqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CqState::Created => "CREATED",
            CqState::Running => "RUNNING",
            CqState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// A change observed by a continuous query.
#[derive(Debug, Clone, PartialEq)]
pub struct CqEvent<K, V> {
    cq_name: String,
    operation: CqOperation,
    key: Option<K>,
    new_value: Option<V>,
    old_value: Option<V>,
    error: Option<String>,
}

impl<K, V> CqEvent<K, V> {
    fn error(cq_name: &str, message: String) -> Self {
        CqEvent {
            cq_name: cq_name.to_string(),
            operation: CqOperation::Error,
            key: None,
            new_value: None,
            old_value: None,
            error: Some(message),
        }
    }

    pub fn cq_name(&self) -> &str {
        &self.cq_name
    }

    pub fn operation(&self) -> CqOperation {
        self.operation
    }

    /// Key of the changed entry; `None` only for error events.
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Value after the change; absent for DESTROY and INVALIDATE.
    pub fn new_value(&self) -> Option<&V> {
        self.new_value.as_ref()
    }

    pub fn old_value(&self) -> Option<&V> {
        self.old_value.as_ref()
    }

    /// Failure description; set only for error events.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_new_value(self) -> Option<V> {
        self.new_value
    }
}

/// Receives the events of one continuous query.
///
/// Both callbacks run on the client's delivery thread; state shared with
/// other threads must be synchronized.
pub trait CqListener<K, V>: Send + Sync + 'static {
    fn on_event(&self, event: CqEvent<K, V>);

    /// Called once when the CQ fails; the CQ is already CLOSED.
    fn on_error(&self, event: CqEvent<K, V>);
}

/// Listener forwarding every event, errors included, into a channel.
pub struct ChannelListener<K, V> {
    sender: Mutex<mpsc::Sender<CqEvent<K, V>>>,
}

impl<K, V> ChannelListener<K, V> {
    pub fn new() -> (Self, mpsc::Receiver<CqEvent<K, V>>) {
        let (sender, receiver) = mpsc::channel();
        (
            ChannelListener {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    fn forward(&self, event: CqEvent<K, V>) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.sender.lock().send(event);
    }
}

impl<K: Send + 'static, V: Send + 'static> CqListener<K, V> for ChannelListener<K, V> {
    fn on_event(&self, event: CqEvent<K, V>) {
        self.forward(event);
    }

    fn on_error(&self, event: CqEvent<K, V>) {
        self.forward(event);
    }
}

/// Type-erased bridge from wire frames to a typed listener.
trait CqDispatch: Send + Sync {
    fn event(&self, frame: CqEventFrame, codec: &Codec) -> CodecResult<()>;

    fn error(&self, cq_name: &str, message: String);
}

struct TypedDispatch<K, V, L> {
    listener: L,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V, L> CqDispatch for TypedDispatch<K, V, L>
where
    K: RegionKey,
    V: RegionValue,
    L: CqListener<K, V>,
{
    fn event(&self, frame: CqEventFrame, codec: &Codec) -> CodecResult<()> {
        let key = K::from_wire(&frame.key)?;
        let new_value = frame.new_value.map(|wire| V::decode(wire, codec)).transpose()?;
        let old_value = frame.old_value.map(|wire| V::decode(wire, codec)).transpose()?;
        self.listener.on_event(CqEvent {
            cq_name: frame.cq_name,
            operation: frame.operation,
            key: Some(key),
            new_value,
            old_value,
            error: None,
        });
        Ok(())
    }

    fn error(&self, cq_name: &str, message: String) {
        self.listener.on_error(CqEvent::error(cq_name, message));
    }
}

pub(crate) struct CqShared {
    name: String,
    query: String,
    state: Mutex<CqState>,
    dispatch: Box<dyn CqDispatch>,
}

impl CqShared {
    fn state(&self) -> CqState {
        *self.state.lock()
    }

    /// Moves `from` -> `to`; returns the state actually found.
    fn transition(&self, from: CqState, to: CqState) -> CqState {
        let mut state = self.state.lock();
        let found = *state;
        if found == from {
            *state = to;
        }
        found
    }

    /// Marks the CQ closed and returns the previous state.
    fn close_local(&self) -> CqState {
        std::mem::replace(&mut *self.state.lock(), CqState::Closed)
    }

    /// Closes a running CQ and fires `on_error`; false if it was not running.
    fn fail(&self, message: String) -> bool {
        if self.transition(CqState::Running, CqState::Closed) != CqState::Running {
            return false;
        }
        warn!(cq = %self.name, error = %message, "continuous query failed");
        self.dispatch.error(&self.name, message);
        true
    }
}

/// Every CQ of one client, by name.
pub(crate) struct CqRegistry {
    codec: Arc<Codec>,
    cqs: RwLock<HashMap<String, Arc<CqShared>>>,
}

impl CqRegistry {
    pub fn new(codec: Arc<Codec>) -> Self {
        CqRegistry {
            codec,
            cqs: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, shared: Arc<CqShared>) -> ClientResult<()> {
        let mut cqs = self.cqs.write();
        if cqs.contains_key(&shared.name) {
            return Err(ClientError::CqExists(shared.name.clone()));
        }
        cqs.insert(shared.name.clone(), shared);
        Ok(())
    }

    /// Removes `shared` unless the name has since been reused.
    fn remove(&self, shared: &Arc<CqShared>) {
        let mut cqs = self.cqs.write();
        if cqs
            .get(&shared.name)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            cqs.remove(&shared.name);
        }
    }

    fn get(&self, name: &str) -> Option<Arc<CqShared>> {
        self.cqs.read().get(name).cloned()
    }

    /// Routes one pushed frame to its CQ.
    pub fn deliver(&self, frame: PushFrame) {
        let shared = match self.get(frame.cq_name()) {
            Some(shared) => shared,
            None => {
                debug!(cq = frame.cq_name(), "frame for unknown continuous query dropped");
                return;
            }
        };

        match frame {
            PushFrame::Event(event) => {
                if shared.state() != CqState::Running {
                    debug!(cq = %shared.name, "frame for inactive continuous query dropped");
                    return;
                }
                if let Err(err) = shared.dispatch.event(event, &self.codec) {
                    if shared.fail(format!("cannot decode event: {}", err)) {
                        self.remove(&shared);
                    }
                }
            }
            PushFrame::Error { message, .. } => {
                if shared.fail(message) {
                    self.remove(&shared);
                }
            }
        }
    }

    /// Fails every running CQ, e.g. after the subscription channel is lost.
    pub fn fail_all(&self, message: &str) {
        let running: Vec<Arc<CqShared>> = {
            let mut cqs = self.cqs.write();
            let names: Vec<String> = cqs
                .values()
                .filter(|shared| shared.state() == CqState::Running)
                .map(|shared| shared.name.clone())
                .collect();
            names.iter().filter_map(|name| cqs.remove(name)).collect()
        };
        for shared in running {
            shared.fail(message.to_string());
        }
    }

    /// Closes every CQ without callbacks; returns the names that were running.
    pub fn close_all(&self) -> Vec<String> {
        let all: Vec<Arc<CqShared>> = self.cqs.write().drain().map(|(_, cq)| cq).collect();
        all.into_iter()
            .filter(|shared| shared.close_local() == CqState::Running)
            .map(|shared| shared.name.clone())
            .collect()
    }

    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cqs
            .read()
            .values()
            .filter(|shared| shared.state() == CqState::Running)
            .map(|shared| shared.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Handle to one continuous query.
///
/// Dropping the handle does not stop the query; call [`CqHandle::close`].
pub struct CqHandle {
    shared: Arc<CqShared>,
    client: Arc<ClientInner>,
}

impl CqHandle {
    /// Creates a CQ in the CREATED state.
    pub(crate) fn create<K, V, L>(
        client: Arc<ClientInner>,
        name: String,
        query: String,
        listener: L,
    ) -> ClientResult<Self>
    where
        K: RegionKey,
        V: RegionValue,
        L: CqListener<K, V>,
    {
        if client.is_closed() {
            return Err(ClientError::Closed);
        }
        let shared = Arc::new(CqShared {
            name,
            query,
            state: Mutex::new(CqState::Created),
            dispatch: Box::new(TypedDispatch {
                listener,
                _types: PhantomData,
            }),
        });
        client.cqs.insert(shared.clone())?;
        Ok(CqHandle { shared, client })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn query(&self) -> &str {
        &self.shared.query
    }

    pub fn state(&self) -> CqState {
        self.shared.state()
    }

    /// Registers the query on the node and starts delivering events.
    ///
    /// The CQ is RUNNING before the registration is sent, so events racing
    /// the acknowledgement are delivered. A failed registration leaves it
    /// CLOSED.
    pub fn execute(&self) -> ClientResult<()> {
        if self.client.is_closed() {
            return Err(ClientError::Closed);
        }
        self.client.ensure_subscription()?;
        let found = self.shared.transition(CqState::Created, CqState::Running);
        if found != CqState::Created {
            return Err(ClientError::InvalidCqState {
                name: self.shared.name.clone(),
                state: found,
            });
        }

        let reply = self.client.exec_counted(&[
            CMD_CQ_REGISTER,
            self.client.client_id().as_bytes(),
            self.shared.name.as_bytes(),
            self.shared.query.as_bytes(),
        ]);
        let outcome = match reply {
            Ok((RespValue::Simple(_), _)) => Ok(()),
            Ok((RespValue::Error(message), attempts)) => match ClientError::from_reply(message) {
                // The node took an earlier attempt whose reply was lost.
                ClientError::CqExists(_) if attempts > 1 => Ok(()),
                err => Err(err),
            },
            Ok(_) => Err(ClientError::UnexpectedResponse),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                info!(cq = %self.shared.name, query = %self.shared.query, "continuous query running");
                Ok(())
            }
            Err(err) => {
                self.shared.close_local();
                self.client.cqs.remove(&self.shared);
                Err(err)
            }
        }
    }

    /// Stops the query. Idempotent; frames still in flight are dropped.
    pub fn close(&self) -> ClientResult<()> {
        let previous = self.shared.close_local();
        self.client.cqs.remove(&self.shared);
        if previous != CqState::Running || self.client.is_closed() {
            return Ok(());
        }

        debug!(cq = %self.shared.name, "closing continuous query");
        match self.client.exec(&[
            CMD_CQ_CLOSE,
            self.client.client_id().as_bytes(),
            self.shared.name.as_bytes(),
        ])? {
            RespValue::Integer(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::from_reply(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

impl fmt::Debug for CqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CqHandle")
            .field("name", &self.shared.name)
            .field("query", &self.shared.query)
            .field("state", &self.shared.state())
            .finish()
    }
}
