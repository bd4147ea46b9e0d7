//! Tracked queries: the persistent record of every query ever registered,
//! used for completeness bookkeeping and LRU eviction of the server cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DatabaseResult;
use crate::path::Path;
use crate::persistence::cache_policy::CachePolicy;
use crate::persistence::prune_forest::PruneForest;
use crate::persistence::storage::{StorageAdapter, WriteBatch, TRACKED_QUERY_STORE};
use crate::query::QuerySpec;
use crate::tree::SparseTree;
use crate::util::hard_assert;

pub type QueryId = u64;

/// Millisecond clock, injectable so tests control `last_use` ordering.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackedQuery {
    pub id: QueryId,
    /// Normalized: a query that loads all data is tracked as the default
    /// query at its path.
    pub query: QuerySpec,
    pub last_use: i64,
    pub active: bool,
    pub complete: bool,
}

/// Wire form of a tracked query in the `query` store.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTrackedQuery {
    id: QueryId,
    query: Value,
    last_use: i64,
    active: bool,
    complete: bool,
}

impl TrackedQuery {
    pub fn to_json(&self) -> Value {
        let record = PersistedTrackedQuery {
            id: self.id,
            query: self.query.to_json(),
            last_use: self.last_use,
            active: self.active,
            complete: self.complete,
        };
        serde_json::to_value(record).expect("tracked query serializes")
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let record: PersistedTrackedQuery = serde_json::from_value(value.clone()).ok()?;
        Some(Self {
            id: record.id,
            query: QuerySpec::from_json(&record.query),
            last_use: record.last_use,
            active: record.active,
            complete: record.complete,
        })
    }
}

/// Persisted layout: `query/<id>` holds the serialized record; for each
/// completed filtered query, `key/<id>/<child>` holds `<child>` (a set).
pub struct TrackedQueryStore {
    adapter: Arc<dyn StorageAdapter>,
}

fn query_key(id: QueryId) -> String {
    format!("query/{id}")
}

fn keys_prefix(id: QueryId) -> String {
    format!("key/{id}/")
}

impl TrackedQueryStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub fn load_all(&self) -> DatabaseResult<Vec<TrackedQuery>> {
        Ok(self
            .adapter
            .get_all(TRACKED_QUERY_STORE, Some("query/"))?
            .into_iter()
            .filter_map(|(_, value)| TrackedQuery::from_json(&value))
            .collect())
    }

    pub fn save(&self, tracked: &TrackedQuery) -> DatabaseResult<()> {
        self.adapter
            .set(TRACKED_QUERY_STORE, &query_key(tracked.id), Some(tracked.to_json()))
    }

    pub fn remove(&self, id: QueryId) -> DatabaseResult<()> {
        let mut batch = WriteBatch::new(TRACKED_QUERY_STORE);
        batch.remove(query_key(id));
        batch.remove_prefixed(keys_prefix(id));
        self.adapter.run_batch(batch)
    }

    /// Replaces the whole tracked-key set for `id` in one atomic batch.
    pub fn set_keys(&self, id: QueryId, keys: &[String]) -> DatabaseResult<()> {
        let mut batch = WriteBatch::new(TRACKED_QUERY_STORE);
        batch.remove_prefixed(keys_prefix(id));
        for key in keys {
            batch.set(format!("key/{id}/{key}"), Value::String(key.clone()));
        }
        self.adapter.run_batch(batch)
    }

    pub fn update_keys(&self, id: QueryId, added: &[String], removed: &[String]) -> DatabaseResult<()> {
        let mut batch = WriteBatch::new(TRACKED_QUERY_STORE);
        for key in removed {
            batch.remove(format!("key/{id}/{key}"));
        }
        for key in added {
            batch.set(format!("key/{id}/{key}"), Value::String(key.clone()));
        }
        self.adapter.run_batch(batch)
    }

    pub fn load_keys(&self, id: QueryId) -> DatabaseResult<Vec<String>> {
        Ok(self
            .adapter
            .get_all(TRACKED_QUERY_STORE, Some(&keys_prefix(id)))?
            .into_iter()
            .filter_map(|(_, value)| value.as_str().map(|s| s.to_string()))
            .collect())
    }

    pub fn close(&self) -> DatabaseResult<()> {
        self.adapter.close(TRACKED_QUERY_STORE)
    }
}

/// In-memory index over the tracked-query store, keyed by path then query
/// identifier. Loaded once at construction; every mutation is written through.
pub struct TrackedQueryManager {
    store: TrackedQueryStore,
    tracked: SparseTree<BTreeMap<String, TrackedQuery>>,
    next_id: QueryId,
    clock: Clock,
}

impl TrackedQueryManager {
    /// Loads persisted state. Queries left `active` by a previous session did
    /// not deactivate cleanly; they are flipped inactive with a fresh
    /// `last_use` so the eviction order stays sane.
    pub fn new(store: TrackedQueryStore, clock: Clock) -> DatabaseResult<Self> {
        let mut manager = Self {
            store,
            tracked: SparseTree::new(),
            next_id: 0,
            clock,
        };
        let loaded = manager.store.load_all()?;
        let now = (manager.clock)();
        for mut tracked in loaded {
            manager.next_id = manager.next_id.max(tracked.id + 1);
            if tracked.active {
                tracked.active = false;
                tracked.last_use = now;
                manager.store.save(&tracked)?;
            }
            manager.insert(tracked);
        }
        Ok(manager)
    }

    fn insert(&mut self, tracked: TrackedQuery) {
        let path = tracked.query.path.clone();
        let identifier = tracked.query.identifier();
        match self.tracked.get_mut(&path) {
            Some(entries) => {
                entries.insert(identifier, tracked);
            }
            None => {
                let mut entries = BTreeMap::new();
                entries.insert(identifier, tracked);
                self.tracked.set(&path, entries);
            }
        }
    }

    fn normalize(query: &QuerySpec) -> QuerySpec {
        if query.loads_all_data() {
            QuerySpec::default_at(query.path.clone())
        } else {
            query.clone()
        }
    }

    pub fn find(&self, query: &QuerySpec) -> Option<&TrackedQuery> {
        let query = Self::normalize(query);
        self.tracked
            .get(&query.path)
            .and_then(|entries| entries.get(&query.identifier()))
    }

    pub fn remove(&mut self, query: &QuerySpec) -> DatabaseResult<()> {
        let query = Self::normalize(query);
        let mut removed = None;
        if let Some(entries) = self.tracked.get_mut(&query.path) {
            removed = entries.remove(&query.identifier());
            if entries.is_empty() {
                self.tracked.remove(&query.path);
            }
        }
        if let Some(removed) = removed {
            self.store.remove(removed.id)?;
        }
        Ok(())
    }

    pub fn set_active(&mut self, query: &QuerySpec) -> DatabaseResult<()> {
        self.set_activity(query, true)
    }

    pub fn set_inactive(&mut self, query: &QuerySpec) -> DatabaseResult<()> {
        self.set_activity(query, false)
    }

    fn set_activity(&mut self, query: &QuerySpec, active: bool) -> DatabaseResult<()> {
        let query = Self::normalize(query);
        let now = (self.clock)();
        let tracked = match self.find(&query) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.active = active;
                updated.last_use = now;
                updated
            }
            None => {
                hard_assert(active, "Query must exist to be marked inactive");
                let id = self.next_id;
                self.next_id += 1;
                TrackedQuery {
                    id,
                    query: query.clone(),
                    last_use: now,
                    active,
                    complete: false,
                }
            }
        };
        self.store.save(&tracked)?;
        self.insert(tracked);
        Ok(())
    }

    pub fn set_complete(&mut self, query: &QuerySpec) -> DatabaseResult<()> {
        let query = Self::normalize(query);
        let tracked = self.find(&query).cloned();
        hard_assert(
            tracked.is_some(),
            "Query must exist to be marked complete",
        );
        let mut tracked = tracked.unwrap();
        if !tracked.complete {
            tracked.complete = true;
            self.store.save(&tracked)?;
            self.insert(tracked);
        }
        Ok(())
    }

    /// Marks every tracked query at or below `path` complete.
    pub fn set_complete_path(&mut self, path: &Path) -> DatabaseResult<()> {
        let mut to_save = Vec::new();
        if let Some(subtree) = self.tracked.subtree(path) {
            subtree.for_each(&mut |_, entries| {
                for tracked in entries.values() {
                    if !tracked.complete {
                        let mut updated = tracked.clone();
                        updated.complete = true;
                        to_save.push(updated);
                    }
                }
            });
        }
        for tracked in to_save {
            self.store.save(&tracked)?;
            self.insert(tracked);
        }
        Ok(())
    }

    /// Creates or updates the default tracked query at `path` as complete.
    pub fn ensure_complete(&mut self, path: &Path) -> DatabaseResult<()> {
        let query = QuerySpec::default_at(path.clone());
        let tracked = match self.find(&query) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.complete = true;
                updated
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                TrackedQuery {
                    id,
                    query,
                    last_use: (self.clock)(),
                    active: false,
                    complete: true,
                }
            }
        };
        if self.find(&tracked.query) != Some(&tracked) {
            self.store.save(&tracked)?;
            self.insert(tracked);
        }
        Ok(())
    }

    /// Complete when an ancestor holds a complete default query, or the
    /// specific entry is complete.
    pub fn is_complete(&self, query: &QuerySpec) -> bool {
        if self.has_complete_default_covering(&query.path) {
            return true;
        }
        self.find(query).is_some_and(|tracked| tracked.complete)
    }

    fn has_complete_default_covering(&self, path: &Path) -> bool {
        let mut covered = false;
        self.tracked.for_each_on_path(path, &mut |_, entries| {
            if entries
                .get(crate::query::DEFAULT_IDENTIFIER)
                .is_some_and(|tracked| tracked.complete)
            {
                covered = true;
            }
        });
        covered
    }

    /// Whether an active default tracked query covers `path`.
    pub fn has_active_default(&self, path: &Path) -> bool {
        let mut active = false;
        self.tracked.for_each_on_path(path, &mut |_, entries| {
            if entries
                .get(crate::query::DEFAULT_IDENTIFIER)
                .is_some_and(|tracked| tracked.active)
            {
                active = true;
            }
        });
        active
    }

    /// Children of `path` known to be completely cached: the persisted key
    /// sets of complete filtered queries at `path`, plus immediate children
    /// with their own complete default query.
    pub fn known_complete_children(&self, path: &Path) -> DatabaseResult<Vec<String>> {
        let mut children = Vec::new();
        if let Some(entries) = self.tracked.get(path) {
            for tracked in entries.values() {
                if tracked.complete && !tracked.query.loads_all_data() {
                    for key in self.store.load_keys(tracked.id)? {
                        if !children.contains(&key) {
                            children.push(key);
                        }
                    }
                }
            }
        }
        if let Some(subtree) = self.tracked.subtree(path) {
            for (child_key, child_tree) in subtree.children() {
                let complete_default = child_tree.value().is_some_and(|entries| {
                    entries
                        .get(crate::query::DEFAULT_IDENTIFIER)
                        .is_some_and(|tracked| tracked.complete)
                });
                if complete_default && !children.contains(child_key) {
                    children.push(child_key.clone());
                }
            }
        }
        Ok(children)
    }

    pub fn store(&self) -> &TrackedQueryStore {
        &self.store
    }

    pub fn num_prunable_queries(&self) -> usize {
        let mut count = 0;
        self.tracked.for_each(&mut |_, entries| {
            count += entries.values().filter(|tracked| !tracked.active).count();
        });
        count
    }

    /// Evicts the least-recently-used inactive queries per the policy,
    /// returning the prune forest the server cache should be swept with.
    pub fn prune_old(&mut self, policy: &dyn CachePolicy) -> DatabaseResult<PruneForest> {
        let mut prunable: Vec<TrackedQuery> = Vec::new();
        let mut unprunable_paths: Vec<Path> = Vec::new();
        self.tracked.for_each(&mut |path, entries| {
            for tracked in entries.values() {
                if tracked.active {
                    unprunable_paths.push(path.clone());
                } else {
                    prunable.push(tracked.clone());
                }
            }
        });
        prunable.sort_by_key(|tracked| tracked.last_use);

        let num_prunable = prunable.len();
        let beyond_cap = num_prunable
            .saturating_sub(policy.max_number_of_prunable_queries_to_keep());
        let percent_batch =
            (num_prunable as f64 * policy.percent_of_queries_to_prune_at_once()).ceil() as usize;
        let num_to_prune = beyond_cap.max(percent_batch).min(num_prunable);

        let mut forest = PruneForest::new();
        for tracked in &prunable[..num_to_prune] {
            forest.prune_path(&tracked.query.path);
            self.remove(&tracked.query)?;
        }
        for tracked in &prunable[num_to_prune..] {
            forest.keep_path(&tracked.query.path);
        }
        for path in &unprunable_paths {
            forest.keep_path(path);
        }
        Ok(forest)
    }
}
