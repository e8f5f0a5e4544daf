//! # Continuous Query Registry
//!
//! Purpose: Track subscribed clients and their standing queries, and turn
//! region changes into pushed `CQ_EVENT` / `CQ_ERROR` frames.
//!
//! ## Design Principles
//! 1. **Commit-Order Delivery**: Regions publish while still holding their
//!    write lock, and each subscriber drains a FIFO queue, so events for one
//!    key arrive in commit order.
//! 2. **Non-Blocking Publish**: Frames go to an unbounded queue per
//!    subscriber; a slow client never stalls a write.
//! 3. **Connection-Scoped**: A subscriber's CQs live exactly as long as its
//!    subscription connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use gkv_common::{CqEventFrame, CqOperation, PushFrame, WireValue};

use crate::error::ServerResult;
use crate::protocol::encode_reply;
use crate::query::{Projection, Query};

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Destroy,
    Invalidate,
}

/// One committed region write, as seen by CQ matching.
#[derive(Debug)]
pub struct Change<'a> {
    pub kind: ChangeKind,
    pub key: &'a WireValue,
    /// Value before the write; `None` for absent or invalidated entries.
    pub old: Option<&'a WireValue>,
    /// Value after the write; only set for puts.
    pub new: Option<&'a WireValue>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    NotSubscribed,
    Exists,
    Projection,
}

struct Subscriber {
    token: u64,
    sender: UnboundedSender<Vec<u8>>,
    cqs: HashMap<String, Arc<Query>>,
}

#[derive(Default)]
pub struct CqRegistry {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    next_token: AtomicU64,
}

impl CqRegistry {
    pub fn new() -> Self {
        CqRegistry::default()
    }

    /// Attaches a push queue for `client_id`; returns the connection token.
    ///
    /// A second subscription for the same client replaces the first, and
    /// the first connection's CQs go with it.
    pub fn subscribe(&self, client_id: &str, sender: UnboundedSender<Vec<u8>>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = self.subscribers.write().insert(
            client_id.to_string(),
            Subscriber {
                token,
                sender,
                cqs: HashMap::new(),
            },
        );
        if previous.is_some() {
            warn!(client_id, "subscription replaced by a newer connection");
        }
        info!(client_id, "client subscribed");
        token
    }

    /// Drops the subscriber if `token` is still its current connection.
    pub fn unsubscribe(&self, client_id: &str, token: u64) {
        let mut subscribers = self.subscribers.write();
        if subscribers
            .get(client_id)
            .is_some_and(|subscriber| subscriber.token == token)
        {
            if let Some(subscriber) = subscribers.remove(client_id) {
                info!(client_id, cqs = subscriber.cqs.len(), "client unsubscribed");
            }
        }
    }

    pub fn register(&self, client_id: &str, name: &str, query: Query) -> Result<(), RegisterError> {
        if query.projection() != &Projection::All {
            return Err(RegisterError::Projection);
        }
        let mut subscribers = self.subscribers.write();
        let subscriber = subscribers
            .get_mut(client_id)
            .ok_or(RegisterError::NotSubscribed)?;
        if subscriber.cqs.contains_key(name) {
            return Err(RegisterError::Exists);
        }
        info!(client_id, cq = name, region = query.region(), "continuous query registered");
        subscriber.cqs.insert(name.to_string(), Arc::new(query));
        Ok(())
    }

    /// Removes a CQ; returns whether it existed.
    pub fn close(&self, client_id: &str, name: &str) -> bool {
        let removed = self
            .subscribers
            .write()
            .get_mut(client_id)
            .and_then(|subscriber| subscriber.cqs.remove(name))
            .is_some();
        if removed {
            info!(client_id, cq = name, "continuous query closed");
        }
        removed
    }

    /// Pushes the frames `change` produces for CQs on `region`.
    ///
    /// A CQ that cannot evaluate the change gets a `CQ_ERROR` frame and is
    /// dropped.
    pub fn publish(&self, region: &str, change: &Change<'_>) {
        let mut failed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (client_id, subscriber) in subscribers.iter() {
                for (name, query) in &subscriber.cqs {
                    if query.region() != region {
                        continue;
                    }
                    let frame = match classify(query, change) {
                        Ok(Some((operation, new_value, old_value))) => {
                            PushFrame::Event(CqEventFrame {
                                cq_name: name.clone(),
                                operation,
                                key: change.key.clone(),
                                new_value,
                                old_value,
                            })
                        }
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(client_id = %client_id, cq = %name, error = %err, "continuous query failed");
                            failed.push((client_id.clone(), subscriber.token, name.clone()));
                            PushFrame::Error {
                                cq_name: name.clone(),
                                message: err.to_string(),
                            }
                        }
                    };
                    if subscriber.sender.send(encode_reply(&frame.to_resp())).is_err() {
                        debug!(client_id = %client_id, "subscriber queue closed");
                    }
                }
            }
        }

        if failed.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        for (client_id, token, name) in failed {
            if let Some(subscriber) = subscribers.get_mut(&client_id) {
                if subscriber.token == token {
                    subscriber.cqs.remove(&name);
                }
            }
        }
    }

    /// Number of CQs registered for `client_id`.
    pub fn cq_count(&self, client_id: &str) -> usize {
        self.subscribers
            .read()
            .get(client_id)
            .map_or(0, |subscriber| subscriber.cqs.len())
    }
}

type Classified = Option<(CqOperation, Option<WireValue>, Option<WireValue>)>;

/// Maps a change onto a CQ operation using result-set membership before
/// and after the write.
fn classify(query: &Query, change: &Change<'_>) -> ServerResult<Classified> {
    let was_in = match change.old {
        Some(old) => query.matches(old)?,
        None => false,
    };
    let old_value = if was_in { change.old.cloned() } else { None };

    let classified = match change.kind {
        ChangeKind::Put => {
            let is_in = match change.new {
                Some(new) => query.matches(new)?,
                None => false,
            };
            match (was_in, is_in) {
                (false, true) => Some((CqOperation::Create, change.new.cloned(), None)),
                (true, true) => Some((CqOperation::Update, change.new.cloned(), old_value)),
                (true, false) => Some((CqOperation::Destroy, None, old_value)),
                (false, false) => None,
            }
        }
        ChangeKind::Destroy if was_in => Some((CqOperation::Destroy, None, old_value)),
        ChangeKind::Invalidate if was_in => Some((CqOperation::Invalidate, None, old_value)),
        ChangeKind::Destroy | ChangeKind::Invalidate => None,
    };
    Ok(classified)
}
