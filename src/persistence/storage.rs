//! The key-value contract durable state is written through, plus the default
//! in-memory backend.
//!
//! A synchronous interface keeps usage ergonomic for the in-process backend
//! while still allowing different stores (files, embedded databases) to be
//! plugged in later. Batches run atomically and in submission order per store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{unavailable, DatabaseResult};

pub const SERVER_CACHE_STORE: &str = "server";
pub const USER_WRITE_STORE: &str = "user";
pub const TRACKED_QUERY_STORE: &str = "query";

#[derive(Clone, Debug)]
pub enum BatchOp {
    Set(String, Value),
    Remove(String),
    RemovePrefixed(String),
}

/// A queue of mutations against one store. `StorageAdapter::run_batch` applies
/// either all of them or none.
#[derive(Clone, Debug)]
pub struct WriteBatch {
    store: String,
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            ops: Vec::new(),
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.ops.push(BatchOp::Set(key.into(), value));
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Remove(key.into()));
    }

    pub fn remove_prefixed(&mut self, prefix: impl Into<String>) {
        self.ops.push(BatchOp::RemovePrefixed(prefix.into()));
    }

    /// Rough size of the data this batch writes, using the same heuristic as
    /// `estimate_entry_size`.
    pub fn estimated_size(&self) -> f64 {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Set(key, value) => estimate_entry_size(key, value),
                _ => 0.0,
            })
            .sum()
    }
}

/// Key-value storage typed by `(store, key)`. One logical database hosts the
/// `server`, `user`, and `query` stores. Initialization must be transparent:
/// callers may issue operations immediately after construction.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, store: &str, key: &str) -> DatabaseResult<Option<Value>>;
    /// All `(key, value)` pairs, optionally restricted to a key prefix, in
    /// key order.
    fn get_all(&self, store: &str, prefix: Option<&str>) -> DatabaseResult<Vec<(String, Value)>>;
    fn set(&self, store: &str, key: &str, value: Option<Value>) -> DatabaseResult<()>;
    fn remove(&self, store: &str, keys: &[String]) -> DatabaseResult<()>;
    fn remove_prefixed(&self, store: &str, prefix: &str) -> DatabaseResult<()>;
    fn clear(&self, store: &str) -> DatabaseResult<()>;
    fn keys(&self, store: &str, prefix: Option<&str>) -> DatabaseResult<Vec<String>>;
    fn count(&self, store: &str) -> DatabaseResult<usize>;
    /// Applies every queued mutation atomically, in submission order.
    fn run_batch(&self, batch: WriteBatch) -> DatabaseResult<()>;
    /// Closes one store; the database goes away once every store is closed.
    fn close(&self, store: &str) -> DatabaseResult<()>;

    /// Optional hint: how long callers should coalesce writes before flushing.
    fn write_throttle_time(&self) -> Option<std::time::Duration> {
        None
    }

    /// Optional hint: the cache size this adapter would like enforced, in
    /// bytes. Feeds the default eviction policy.
    fn max_server_cache_size(&self) -> Option<f64> {
        None
    }
}

/// Approximate byte cost of one persisted entry: half a byte per key
/// character plus the value payload (number = 8, bool = 0.5, string length,
/// containers recurse).
pub fn estimate_entry_size(key: &str, value: &Value) -> f64 {
    key.len() as f64 / 2.0 + estimate_value_size(value)
}

fn estimate_value_size(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(_) => 0.5,
        Value::Number(_) => 8.0,
        Value::String(s) => s.len() as f64,
        Value::Array(items) => items.iter().map(estimate_value_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() as f64 / 2.0 + estimate_value_size(v))
            .sum(),
    }
}

/// The default backend: sorted maps behind one mutex, so prefix scans come
/// back in key order and batches are trivially atomic.
#[derive(Default)]
pub struct MemoryStorageAdapter {
    stores: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    closed: Mutex<Vec<String>>,
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prefix_range<'a>(
    store: &'a BTreeMap<String, Value>,
    prefix: Option<&str>,
) -> Vec<(String, Value)> {
    match prefix {
        None => store.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(prefix) => store
            .range::<String, _>((Bound::Included(prefix.to_string()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

impl StorageAdapter for MemoryStorageAdapter {
    fn get(&self, store: &str, key: &str) -> DatabaseResult<Option<Value>> {
        let stores = self.stores.lock().unwrap();
        Ok(stores.get(store).and_then(|map| map.get(key).cloned()))
    }

    fn get_all(&self, store: &str, prefix: Option<&str>) -> DatabaseResult<Vec<(String, Value)>> {
        let stores = self.stores.lock().unwrap();
        Ok(stores
            .get(store)
            .map(|map| prefix_range(map, prefix))
            .unwrap_or_default())
    }

    fn set(&self, store: &str, key: &str, value: Option<Value>) -> DatabaseResult<()> {
        let mut stores = self.stores.lock().unwrap();
        let map = stores.entry(store.to_string()).or_default();
        match value {
            Some(value) => {
                map.insert(key.to_string(), value);
            }
            None => {
                map.remove(key);
            }
        }
        Ok(())
    }

    fn remove(&self, store: &str, keys: &[String]) -> DatabaseResult<()> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(map) = stores.get_mut(store) {
            for key in keys {
                map.remove(key);
            }
        }
        Ok(())
    }

    fn remove_prefixed(&self, store: &str, prefix: &str) -> DatabaseResult<()> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(map) = stores.get_mut(store) {
            map.retain(|key, _| !key.starts_with(prefix));
        }
        Ok(())
    }

    fn clear(&self, store: &str) -> DatabaseResult<()> {
        let mut stores = self.stores.lock().unwrap();
        stores.remove(store);
        Ok(())
    }

    fn keys(&self, store: &str, prefix: Option<&str>) -> DatabaseResult<Vec<String>> {
        Ok(self
            .get_all(store, prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    fn count(&self, store: &str) -> DatabaseResult<usize> {
        let stores = self.stores.lock().unwrap();
        Ok(stores.get(store).map(|map| map.len()).unwrap_or(0))
    }

    fn run_batch(&self, batch: WriteBatch) -> DatabaseResult<()> {
        let mut stores = self.stores.lock().unwrap();
        if self.closed.lock().unwrap().iter().any(|s| s == batch.store()) {
            return Err(unavailable(format!(
                "Store '{}' has been closed",
                batch.store()
            )));
        }
        let map = stores.entry(batch.store().to_string()).or_default();
        for op in batch.ops() {
            match op {
                BatchOp::Set(key, value) => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Remove(key) => {
                    map.remove(key);
                }
                BatchOp::RemovePrefixed(prefix) => {
                    map.retain(|key, _| !key.starts_with(prefix.as_str()));
                }
            }
        }
        Ok(())
    }

    fn close(&self, store: &str) -> DatabaseResult<()> {
        self.closed.lock().unwrap().push(store.to_string());
        Ok(())
    }
}
