//! # Region Store
//!
//! In-memory regions keyed by wire value. Each region has its own lock;
//! writes publish their CQ frames before releasing it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use gkv_common::WireValue;

use crate::cq::{Change, ChangeKind, CqRegistry};
use crate::error::{ServerError, ServerResult};
use crate::query::Query;

/// An entry whose value is `None` has been invalidated.
type Entries = HashMap<WireValue, Option<WireValue>>;

pub struct RegionStore {
    name: String,
    entries: RwLock<Entries>,
}

impl RegionStore {
    fn new(name: &str) -> Self {
        RegionStore {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&self, key: WireValue, value: WireValue, cqs: &CqRegistry) {
        let mut entries = self.entries.write();
        let old = entries.insert(key.clone(), Some(value.clone())).flatten();
        cqs.publish(
            &self.name,
            &Change {
                kind: ChangeKind::Put,
                key: &key,
                old: old.as_ref(),
                new: Some(&value),
            },
        );
    }

    pub fn get(&self, key: &WireValue) -> Option<WireValue> {
        self.entries.read().get(key).cloned().flatten()
    }

    /// Removes the entry; returns whether the key existed.
    pub fn destroy(&self, key: &WireValue, cqs: &CqRegistry) -> bool {
        let mut entries = self.entries.write();
        let old = match entries.remove(key) {
            Some(old) => old,
            None => return false,
        };
        cqs.publish(
            &self.name,
            &Change {
                kind: ChangeKind::Destroy,
                key,
                old: old.as_ref(),
                new: None,
            },
        );
        true
    }

    /// Drops the value but keeps the key; returns whether a value was dropped.
    pub fn invalidate(&self, key: &WireValue, cqs: &CqRegistry) -> bool {
        let mut entries = self.entries.write();
        let old = match entries.get_mut(key).and_then(Option::take) {
            Some(old) => old,
            None => return false,
        };
        cqs.publish(
            &self.name,
            &Change {
                kind: ChangeKind::Invalidate,
                key,
                old: Some(&old),
                new: None,
            },
        );
        true
    }

    /// Evaluates `query` over the current values.
    pub fn select(&self, query: &Query) -> ServerResult<Vec<Option<WireValue>>> {
        let entries = self.entries.read();
        let mut rows = Vec::new();
        for value in entries.values().flatten() {
            if query.matches(value)? {
                rows.push(query.project(value)?);
            }
        }
        Ok(rows)
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|value| value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All regions of the node, fixed at startup.
pub struct Store {
    regions: HashMap<String, Arc<RegionStore>>,
}

impl Store {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let regions = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                (name.to_string(), Arc::new(RegionStore::new(name)))
            })
            .collect();
        Store { regions }
    }

    pub fn region(&self, name: &str) -> ServerResult<&Arc<RegionStore>> {
        self.regions
            .get(name)
            .ok_or_else(|| ServerError::NoRegion(name.to_string()))
    }

    pub fn region_names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }
}
