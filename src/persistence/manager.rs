//! Sequences durable operations across the three stores and triggers LRU
//! pruning of the server cache.
//!
//! Storage failures never block event propagation: writes are best-effort and
//! logged, reads fall back to empty data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use crate::error::DatabaseResult;
use crate::logger::Logger;
use crate::path::Path;
use crate::persistence::cache_policy::CachePolicy;
use crate::persistence::server_cache::ServerCacheStore;
use crate::persistence::storage::StorageAdapter;
use crate::persistence::tracked_query::{
    system_clock, Clock, TrackedQuery, TrackedQueryManager, TrackedQueryStore,
};
use crate::persistence::user_write::UserWriteStore;
use crate::query::QuerySpec;
use crate::snapshot::Node;
use crate::tree::SparseTree;
use crate::util::hard_assert;
use crate::view::CacheNode;
use crate::write_tree::{UserWriteRecord, WriteId};

static LOGGER: LazyLock<Logger> =
    LazyLock::new(|| Logger::new("@firebase/database-core/persistence"));

pub struct PersistenceManager {
    server_cache: ServerCacheStore,
    user_writes: UserWriteStore,
    tracked_queries: Mutex<TrackedQueryManager>,
    cache_policy: Box<dyn CachePolicy>,
    server_updates_since_check: AtomicU64,
}

impl PersistenceManager {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        cache_policy: Box<dyn CachePolicy>,
    ) -> DatabaseResult<Self> {
        Self::with_clock(adapter, cache_policy, system_clock())
    }

    pub fn with_clock(
        adapter: Arc<dyn StorageAdapter>,
        cache_policy: Box<dyn CachePolicy>,
        clock: Clock,
    ) -> DatabaseResult<Self> {
        let tracked =
            TrackedQueryManager::new(TrackedQueryStore::new(adapter.clone()), clock)?;
        Ok(Self {
            server_cache: ServerCacheStore::new(adapter.clone()),
            user_writes: UserWriteStore::new(adapter),
            tracked_queries: Mutex::new(tracked),
            cache_policy,
            server_updates_since_check: AtomicU64::new(0),
        })
    }

    fn tracked(&self) -> MutexGuard<'_, TrackedQueryManager> {
        self.tracked_queries.lock().unwrap()
    }

    fn note_failure<T>(operation: &str, result: DatabaseResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                LOGGER.warn(format!("{operation} failed: {err}"));
                None
            }
        }
    }

    pub fn save_user_overwrite(&self, path: &Path, node: &Node, write_id: WriteId) {
        Self::note_failure(
            "saveUserOverwrite",
            self.user_writes.save_overwrite(path, node, write_id),
        );
    }

    pub fn save_user_merge(&self, path: &Path, children: &SparseTree<Node>, write_id: WriteId) {
        Self::note_failure(
            "saveUserMerge",
            self.user_writes.save_merge(path, children, write_id),
        );
    }

    pub fn remove_user_write(&self, write_id: WriteId) {
        Self::note_failure("removeUserWrite", self.user_writes.remove(write_id));
    }

    /// Persisted pending writes, sorted by id. Empty on read failure.
    pub fn get_user_writes(&self) -> Vec<UserWriteRecord> {
        Self::note_failure("getUserWrites", self.user_writes.load_all()).unwrap_or_default()
    }

    /// Folds an acknowledged overwrite into the server cache when an active
    /// default listen makes the confirmed write canonical locally.
    pub fn apply_user_write(&self, node: &Node, path: &Path) {
        let mut tracked = self.tracked();
        if !tracked.has_active_default(path) {
            return;
        }
        Self::note_failure(
            "applyUserWrite",
            self.server_cache.overwrite(node, path, false),
        );
        Self::note_failure("applyUserWrite", tracked.ensure_complete(path));
    }

    pub fn apply_user_merge(&self, merge: &SparseTree<Node>, path: &Path) {
        let mut tracked = self.tracked();
        if !tracked.has_active_default(path) {
            return;
        }
        Self::note_failure("applyUserMerge", self.server_cache.merge(merge, path));
        Self::note_failure("applyUserMerge", tracked.ensure_complete(path));
    }

    /// Loads the best persisted server cache for `query`: the tracked key set
    /// for complete filtered queries, the full subtree when complete, and the
    /// known-complete children otherwise.
    pub fn get_server_cache(&self, query: &QuerySpec) -> CacheNode {
        let result = (|| -> DatabaseResult<CacheNode> {
            let tracked = self.tracked();
            if tracked.is_complete(query) {
                if query.loads_all_data() {
                    let node = self.server_cache.get_at_path(&query.path)?;
                    return Ok(CacheNode::new(node, true, false));
                }
                let keys = match tracked.find(query) {
                    Some(entry) => tracked.store().load_keys(entry.id)?,
                    None => Vec::new(),
                };
                let node = self.server_cache.get_for_keys(&keys, &query.path)?;
                return Ok(CacheNode::new(node, true, true));
            }
            let children = tracked.known_complete_children(&query.path)?;
            let node = self.server_cache.get_for_keys(&children, &query.path)?;
            Ok(CacheNode::new(node, false, false))
        })();
        Self::note_failure("getServerCache", result).unwrap_or_else(CacheNode::empty)
    }

    pub fn apply_server_overwrite(&self, node: &Node, query: &QuerySpec) {
        Self::note_failure(
            "applyServerOverwrite",
            self.server_cache
                .overwrite(node, &query.path, !query.loads_all_data()),
        );
        self.set_query_complete(query);
        self.prune_check();
    }

    pub fn apply_server_merge(&self, merge: &SparseTree<Node>, path: &Path) {
        Self::note_failure("applyServerMerge", self.server_cache.merge(merge, path));
        self.prune_check();
    }

    pub fn set_query_complete(&self, query: &QuerySpec) {
        let mut tracked = self.tracked();
        if query.loads_all_data() {
            Self::note_failure("setQueryComplete", tracked.set_complete_path(&query.path));
        } else {
            Self::note_failure("setQueryComplete", tracked.set_complete(query));
        }
    }

    pub fn set_query_active(&self, query: &QuerySpec) {
        Self::note_failure("setQueryActive", self.tracked().set_active(query));
    }

    pub fn set_query_inactive(&self, query: &QuerySpec) {
        Self::note_failure("setQueryInactive", self.tracked().set_inactive(query));
    }

    /// Replaces the tracked key set for a filtered query.
    pub fn set_tracked_query_keys(&self, query: &QuerySpec, keys: &[String]) {
        hard_assert(
            !query.loads_all_data(),
            "We should only track keys for filtered queries.",
        );
        let tracked = self.tracked();
        let entry = tracked.find(query).cloned();
        hard_assert(
            entry.is_some(),
            "We only expect tracked keys for currently-tracked queries.",
        );
        let entry = entry.unwrap();
        Self::note_failure(
            "setTrackedQueryKeys",
            tracked.store().set_keys(entry.id, keys),
        );
    }

    pub fn update_tracked_query_keys(&self, query: &QuerySpec, added: &[String], removed: &[String]) {
        hard_assert(
            !query.loads_all_data(),
            "We should only track keys for filtered queries.",
        );
        let tracked = self.tracked();
        let Some(entry) = tracked.find(query).cloned() else {
            // The query was evicted mid-flight; nothing to update.
            return;
        };
        Self::note_failure(
            "updateTrackedQueryKeys",
            tracked.store().update_keys(entry.id, added, removed),
        );
    }

    pub fn find_tracked_query(&self, query: &QuerySpec) -> Option<TrackedQuery> {
        self.tracked().find(query).cloned()
    }

    pub fn load_tracked_query_keys(&self, query: &QuerySpec) -> Vec<String> {
        let tracked = self.tracked();
        let Some(entry) = tracked.find(query) else {
            return Vec::new();
        };
        Self::note_failure("loadTrackedQueryKeys", tracked.store().load_keys(entry.id))
            .unwrap_or_default()
    }

    pub fn server_cache_estimated_size(&self) -> f64 {
        Self::note_failure("estimatedServerCacheSize", self.server_cache.estimated_size())
            .unwrap_or(0.0)
    }

    pub fn server_cache_at_path(&self, path: &Path) -> Node {
        Self::note_failure("serverCacheAtPath", self.server_cache.get_at_path(path))
            .unwrap_or_else(Node::empty)
    }

    fn prune_check(&self) {
        let updates = self.server_updates_since_check.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.cache_policy.should_check_cache_size(updates) {
            return;
        }
        self.server_updates_since_check.store(0, Ordering::SeqCst);
        self.recursive_prune_check();
    }

    fn recursive_prune_check(&self) {
        loop {
            let Some(size) = Self::note_failure("estimatedSize", self.server_cache.estimated_size())
            else {
                return;
            };
            let num_prunable = self.tracked().num_prunable_queries();
            if !self.cache_policy.should_prune(size, num_prunable) {
                return;
            }
            LOGGER.debug(format!(
                "Cache size {size} with {num_prunable} prunable queries; pruning"
            ));
            let forest = {
                let mut tracked = self.tracked();
                Self::note_failure("pruneOld", tracked.prune_old(self.cache_policy.as_ref()))
            };
            let Some(forest) = forest else {
                return;
            };
            if !forest.prunes_anything() {
                return;
            }
            if Self::note_failure(
                "pruneCache",
                self.server_cache.prune_cache(&forest, &Path::root()),
            )
            .is_none()
            {
                return;
            }
        }
    }

    pub fn close(&self) -> DatabaseResult<()> {
        self.server_cache.close()?;
        self.user_writes.close()?;
        self.tracked().store().close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::cache_policy::LruCachePolicy;
    use crate::persistence::storage::MemoryStorageAdapter;
    use crate::query::{QueryLimit, QueryParams};
    use crate::snapshot::Index;
    use serde_json::json;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn manager() -> PersistenceManager {
        PersistenceManager::new(
            Arc::new(MemoryStorageAdapter::new()),
            Box::new(LruCachePolicy::default()),
        )
        .unwrap()
    }

    fn filtered(path: &str) -> QuerySpec {
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        params.set_limit(QueryLimit::First(2)).unwrap();
        QuerySpec::new(p(path), params)
    }

    #[test]
    fn server_overwrite_marks_query_complete() {
        let manager = manager();
        let query = QuerySpec::default_at(p("a"));
        manager.set_query_active(&query);
        manager.apply_server_overwrite(&Node::from_json(&json!({ "x": 1 })), &query);

        let cache = manager.get_server_cache(&query);
        assert!(cache.is_fully_initialized());
        assert_eq!(cache.node().to_json(), json!({ "x": 1 }));
    }

    #[test]
    fn filtered_complete_query_reads_only_tracked_keys() {
        let manager = manager();
        let query = filtered("list");
        manager.set_query_active(&query);
        manager.apply_server_overwrite(
            &Node::from_json(&json!({ "a": 1, "b": 2 })),
            &query,
        );
        manager.set_tracked_query_keys(&query, &["a".to_string(), "b".to_string()]);
        // A stray sibling under the same path must not leak into the read.
        manager.apply_server_merge(
            &{
                let mut merge = SparseTree::new();
                merge.set(&p("z"), Node::leaf(json!(26)));
                merge
            },
            &p("list"),
        );

        let cache = manager.get_server_cache(&query);
        assert!(cache.is_fully_initialized());
        assert!(cache.is_filtered());
        assert_eq!(cache.node().to_json(), json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn incomplete_query_reads_known_children_without_claiming_completeness() {
        let manager = manager();
        let query = QuerySpec::default_at(p("top"));
        let child_query = QuerySpec::default_at(p("top/known"));
        manager.set_query_active(&child_query);
        manager.apply_server_overwrite(&Node::leaf(json!("v")), &child_query);

        let cache = manager.get_server_cache(&query);
        assert!(!cache.is_fully_initialized());
        assert_eq!(cache.node().to_json(), json!({ "known": "v" }));
    }

    #[test]
    fn acked_write_lands_in_server_cache_under_active_default() {
        let manager = manager();
        let covering = QuerySpec::default_at(p("a"));
        manager.set_query_active(&covering);
        manager.apply_user_write(&Node::leaf(json!("confirmed")), &p("a/b"));
        assert_eq!(
            manager.server_cache_at_path(&p("a/b")).to_json(),
            json!("confirmed")
        );

        // Without a covering active default, nothing is written.
        manager.apply_user_write(&Node::leaf(json!("ignored")), &p("elsewhere"));
        assert!(manager.server_cache_at_path(&p("elsewhere")).is_empty());
    }

    #[test]
    fn user_write_journal_round_trips() {
        let manager = manager();
        manager.save_user_overwrite(&p("a"), &Node::leaf(json!(1)), 5);
        manager.save_user_overwrite(&p("b"), &Node::leaf(json!(2)), 6);
        manager.remove_user_write(5);
        let writes = manager.get_user_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].write_id, 6);
    }
}
