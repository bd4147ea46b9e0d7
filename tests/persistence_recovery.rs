//! Durable-state scenarios: LRU eviction of tracked queries, tracked-key
//! bookkeeping through live views, and restart recovery.

use std::sync::{Arc, Mutex};

use serde_json::json;

use firebase_database_core::operation::Tag;
use firebase_database_core::path::Path;
use firebase_database_core::persistence::{
    CachePolicy, Clock, MemoryStorageAdapter, PersistenceManager, StorageAdapter,
    TrackedQueryStore, UserWriteStore, SERVER_CACHE_STORE,
};
use firebase_database_core::query::{QueryLimit, QueryParams, QuerySpec};
use firebase_database_core::repo::{Repo, WriteTransmitter};
use firebase_database_core::snapshot::{Index, Node};
use firebase_database_core::sync_tree::{ListenProvider, SyncTree};
use firebase_database_core::tree::SparseTree;
use firebase_database_core::view::{Event, EventInterest, EventRegistration};
use firebase_database_core::write_tree::WriteId;

fn p(raw: &str) -> Path {
    Path::parse(raw).unwrap()
}

fn n(json: serde_json::Value) -> Node {
    Node::from_json(&json)
}

#[derive(Default)]
struct QuietListenProvider;

impl ListenProvider for QuietListenProvider {
    fn start_listening(
        &self,
        _query: &QuerySpec,
        _tag: Option<Tag>,
        _hash_fn: Box<dyn Fn() -> String + Send + Sync>,
    ) -> Vec<Event> {
        Vec::new()
    }

    fn stop_listening(&self, _query: &QuerySpec, _tag: Option<Tag>) {}
}

fn limit_to_first(path: &str, count: u32) -> QuerySpec {
    let mut params = QueryParams::default();
    params.set_index(Index::Key).unwrap();
    params.set_limit(QueryLimit::First(count)).unwrap();
    QuerySpec::new(p(path), params)
}

/// Aggressive policy for eviction tests: check after every couple of server
/// updates, prune whenever more than one query is prunable, keep two.
struct EagerPolicy;

impl CachePolicy for EagerPolicy {
    fn percent_of_queries_to_prune_at_once(&self) -> f64 {
        0.0
    }

    fn max_number_of_prunable_queries_to_keep(&self) -> usize {
        2
    }

    fn should_prune(&self, _cache_size: f64, num_tracked_queries: usize) -> bool {
        num_tracked_queries > 1
    }

    fn should_check_cache_size(&self, server_updates_since_last_check: u64) -> bool {
        server_updates_since_last_check >= 2
    }
}

fn manual_clock() -> (Arc<Mutex<i64>>, Clock) {
    let now = Arc::new(Mutex::new(0));
    let handle = now.clone();
    let clock: Clock = Arc::new(move || *handle.lock().unwrap());
    (now, clock)
}

#[test]
fn lru_eviction_drops_the_least_recently_used_query() {
    let adapter = Arc::new(MemoryStorageAdapter::new());
    let (now, clock) = manual_clock();
    let manager = Arc::new(
        PersistenceManager::with_clock(adapter.clone(), Box::new(EagerPolicy), clock).unwrap(),
    );
    let mut tree = SyncTree::with_persistence(Arc::new(QuietListenProvider), manager.clone());

    let queries: Vec<QuerySpec> = ["q1", "q2", "q3"]
        .iter()
        .map(|path| limit_to_first(path, 10))
        .collect();
    for (i, query) in queries.iter().enumerate() {
        *now.lock().unwrap() = ((i + 1) * 100) as i64;
        let registration_id = (i + 1) as u64;
        tree.add_event_registration(
            query,
            EventRegistration::new(registration_id, EventInterest::All),
        );
        tree.apply_server_overwrite(query.path.clone(), n(json!({ "k": i })));
        tree.remove_event_registration(query, Some(registration_id), None);
    }

    // All three are inactive now, with lastUse 100 < 200 < 300. The next
    // server update trips the size check and evicts the oldest.
    tree.apply_server_overwrite(p("other"), n(json!(true)));

    assert!(manager.find_tracked_query(&queries[0]).is_none());
    assert!(manager.find_tracked_query(&queries[1]).is_some());
    assert!(manager.find_tracked_query(&queries[2]).is_some());

    // The evicted query's server-cache keys are gone, the survivors' remain.
    let keys = adapter.keys(SERVER_CACHE_STORE, Some("/q1/")).unwrap();
    assert!(keys.is_empty());
    assert!(!adapter
        .keys(SERVER_CACHE_STORE, Some("/q2/"))
        .unwrap()
        .is_empty());
}

#[test]
fn tracked_keys_follow_the_view_window() {
    let adapter = Arc::new(MemoryStorageAdapter::new());
    let manager = Arc::new(
        PersistenceManager::new(
            adapter,
            Box::new(firebase_database_core::persistence::LruCachePolicy::default()),
        )
        .unwrap(),
    );
    let mut tree = SyncTree::with_persistence(Arc::new(QuietListenProvider), manager.clone());

    let query = limit_to_first("list", 2);
    tree.add_event_registration(&query, EventRegistration::new(1, EventInterest::All));
    assert!(manager.load_tracked_query_keys(&query).is_empty());

    let tag = tree.tag_for_query(&query).unwrap();
    tree.apply_tagged_query_overwrite(p("list"), n(json!({ "a": 1, "b": 2 })), tag);
    let mut keys = manager.load_tracked_query_keys(&query);
    keys.sort();
    assert_eq!(keys, vec!["a", "b"]);

    // "_early" sorts before the window; "b" slides out.
    tree.apply_tagged_query_overwrite(p("list/_early"), n(json!(0)), tag);
    let mut keys = manager.load_tracked_query_keys(&query);
    keys.sort();
    assert_eq!(keys, vec!["_early", "a"]);
}

#[test]
fn pruned_store_never_keeps_a_prunable_key() {
    let adapter = Arc::new(MemoryStorageAdapter::new());
    let (now, clock) = manual_clock();
    let manager = Arc::new(
        PersistenceManager::with_clock(adapter.clone(), Box::new(EagerPolicy), clock).unwrap(),
    );
    let mut tree = SyncTree::with_persistence(Arc::new(QuietListenProvider), manager.clone());

    for (i, path) in ["x/one", "x/two", "y/three"].iter().enumerate() {
        *now.lock().unwrap() = (i as i64 + 1) * 10;
        let query = limit_to_first(path, 5);
        let registration_id = (i + 1) as u64;
        tree.add_event_registration(
            &query,
            EventRegistration::new(registration_id, EventInterest::All),
        );
        tree.apply_server_overwrite(p(path), n(json!({ "v": i })));
        tree.remove_event_registration(&query, Some(registration_id), None);
    }
    tree.apply_server_overwrite(p("z"), n(json!(1)));

    // Whatever survived must be covered by a surviving tracked query.
    let keys = adapter.keys(SERVER_CACHE_STORE, None).unwrap();
    for key in keys {
        assert!(
            !key.starts_with("/x/one/"),
            "evicted subtree still has key {key}"
        );
    }
}

#[derive(Default)]
struct RecordingTransmitter {
    sent: Mutex<Vec<WriteId>>,
}

impl WriteTransmitter for RecordingTransmitter {
    fn send_overwrite(&self, _path: &Path, _node: &Node, write_id: WriteId) {
        self.sent.lock().unwrap().push(write_id);
    }

    fn send_merge(&self, _path: &Path, _children: &SparseTree<Node>, write_id: WriteId) {
        self.sent.lock().unwrap().push(write_id);
    }
}

#[test]
fn restart_recovery_restores_writes_and_deactivates_queries() {
    let adapter: Arc<MemoryStorageAdapter> = Arc::new(MemoryStorageAdapter::new());

    // Simulate the debris of a crashed session: two unacknowledged writes and
    // a tracked query that was never cleanly deactivated.
    let user_writes = UserWriteStore::new(adapter.clone());
    user_writes
        .save_overwrite(&p("chat/m1"), &Node::leaf(json!("hello")), 5)
        .unwrap();
    user_writes
        .save_overwrite(&p("chat/m2"), &Node::leaf(json!("world")), 6)
        .unwrap();

    let query = limit_to_first("chat", 50);
    {
        let (_, clock) = manual_clock();
        let manager =
            PersistenceManager::with_clock(adapter.clone(), Box::new(EagerPolicy), clock).unwrap();
        manager.set_query_active(&query);
    }

    let transmitter = Arc::new(RecordingTransmitter::default());
    let mut repo = Repo::new(Arc::new(QuietListenProvider), transmitter.clone());
    repo.enable_persistence(adapter);

    assert_eq!(repo.next_write_id(), 7);
    assert_eq!(*transmitter.sent.lock().unwrap(), vec![5, 6]);
    let restored = repo
        .sync_tree()
        .persistence()
        .unwrap()
        .find_tracked_query(&query)
        .unwrap();
    assert!(!restored.active);

    // The restored writes are live in the overlay.
    assert_eq!(
        repo.sync_tree().calc_complete_event_cache(&p("chat/m1"), &[]),
        Some(Node::leaf(json!("hello")))
    );
    assert_eq!(repo.sync_tree().pending_write_ids(), vec![5, 6]);
}

#[test]
fn close_persistence_closes_every_store() {
    let adapter = Arc::new(MemoryStorageAdapter::new());
    let transmitter = Arc::new(RecordingTransmitter::default());
    let mut repo = Repo::new(Arc::new(QuietListenProvider), transmitter);
    repo.enable_persistence(adapter.clone());
    repo.close_persistence().unwrap();

    // Closed stores refuse further batches.
    let store = TrackedQueryStore::new(adapter);
    assert!(store.set_keys(1, &["k".to_string()]).is_err());
}
