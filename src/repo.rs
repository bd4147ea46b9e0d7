//! Thin lifecycle facade over the sync tree: write-id allocation, the
//! transport re-send seam, and enabling/closing durable persistence with
//! crash recovery for unacknowledged writes.

use std::sync::{Arc, LazyLock};

use serde_json::Value;

use crate::error::{DatabaseError, DatabaseResult};
use crate::logger::Logger;
use crate::path::Path;
use crate::persistence::{CachePolicy, LruCachePolicy, PersistenceManager, StorageAdapter};
use crate::query::QuerySpec;
use crate::server_values::resolve_deferred_node;
use crate::snapshot::Node;
use crate::sync_tree::{ListenProvider, SyncTree};
use crate::tree::SparseTree;
use crate::view::{Event, EventInterest, EventRegistration};
use crate::write_tree::{WriteId, WritePayload};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/database-core/repo"));

/// Seam through which pending writes are (re)transmitted to the backend.
pub trait WriteTransmitter: Send + Sync {
    fn send_overwrite(&self, path: &Path, node: &Node, write_id: WriteId);
    fn send_merge(&self, path: &Path, children: &SparseTree<Node>, write_id: WriteId);
}

pub struct Repo {
    sync_tree: SyncTree,
    transmitter: Arc<dyn WriteTransmitter>,
    next_write_id: WriteId,
    next_registration_id: u64,
    persistence_enabled: bool,
}

impl Repo {
    pub fn new(
        listen_provider: Arc<dyn ListenProvider>,
        transmitter: Arc<dyn WriteTransmitter>,
    ) -> Self {
        Self {
            sync_tree: SyncTree::new(listen_provider),
            transmitter,
            next_write_id: 1,
            next_registration_id: 1,
            persistence_enabled: false,
        }
    }

    pub fn sync_tree(&self) -> &SyncTree {
        &self.sync_tree
    }

    pub fn sync_tree_mut(&mut self) -> &mut SyncTree {
        &mut self.sync_tree
    }

    /// Turns on durable persistence with the default LRU policy, sized by the
    /// adapter's cache-size hint when it provides one.
    pub fn enable_persistence(&mut self, adapter: Arc<dyn StorageAdapter>) {
        let policy = match adapter.max_server_cache_size() {
            Some(max_size) => LruCachePolicy::new(max_size),
            None => LruCachePolicy::default(),
        };
        self.enable_persistence_with_policy(adapter, Box::new(policy));
    }

    /// Turns on durable persistence. Must run before any reference use; on
    /// initialization failure a warning is logged and the session stays
    /// memory-only. Pending writes from a previous session are re-applied
    /// visible and re-sent to the transport with their original ids, in order.
    pub fn enable_persistence_with_policy(
        &mut self,
        adapter: Arc<dyn StorageAdapter>,
        cache_policy: Box<dyn CachePolicy>,
    ) {
        if self.persistence_enabled {
            LOGGER.warn("Persistence is already enabled; ignoring repeated call");
            return;
        }
        let manager = match PersistenceManager::new(adapter, cache_policy) {
            Ok(manager) => Arc::new(manager),
            Err(err) => {
                LOGGER.warn(format!(
                    "Failed to initialize persistence, continuing in memory-only mode: {err}"
                ));
                return;
            }
        };

        let restored = manager.get_user_writes();
        self.sync_tree.enable_persistence(manager);
        self.persistence_enabled = true;

        for record in restored {
            self.next_write_id = self.next_write_id.max(record.write_id + 1);
            match &record.payload {
                WritePayload::Overwrite(node) => {
                    let existing = self
                        .sync_tree
                        .calc_complete_event_cache(&record.path, &[record.write_id]);
                    let resolved = resolve_deferred_node(node, existing.as_ref());
                    self.sync_tree.apply_user_overwrite(
                        record.path.clone(),
                        resolved,
                        record.write_id,
                        true,
                    );
                    self.transmitter
                        .send_overwrite(&record.path, node, record.write_id);
                }
                WritePayload::Merge(children) => {
                    let existing = self
                        .sync_tree
                        .calc_complete_event_cache(&record.path, &[record.write_id]);
                    let mut resolved = SparseTree::new();
                    children.for_each(&mut |relative, node| {
                        let existing_child =
                            existing.as_ref().map(|node| node.get_child(relative));
                        resolved.set(
                            relative,
                            resolve_deferred_node(node, existing_child.as_ref()),
                        );
                    });
                    self.sync_tree.apply_user_merge(
                        record.path.clone(),
                        resolved,
                        record.write_id,
                    );
                    self.transmitter
                        .send_merge(&record.path, children, record.write_id);
                }
            }
        }
    }

    pub fn close_persistence(&mut self) -> DatabaseResult<()> {
        match self.sync_tree.persistence() {
            Some(persistence) => persistence.close(),
            None => Ok(()),
        }
    }

    pub fn next_write_id(&self) -> WriteId {
        self.next_write_id
    }

    fn generate_write_id(&mut self) -> WriteId {
        let id = self.next_write_id;
        self.next_write_id += 1;
        id
    }

    fn generate_registration_id(&mut self) -> u64 {
        let id = self.next_registration_id;
        self.next_registration_id += 1;
        id
    }

    /// Overwrites `path` locally and hands the write to the transport.
    pub fn set(&mut self, path: Path, value: &Value) -> (WriteId, Vec<Event>) {
        let node = Node::from_json(value);
        let write_id = self.generate_write_id();
        let events =
            self.sync_tree
                .apply_user_overwrite(path.clone(), node.clone(), write_id, true);
        self.transmitter.send_overwrite(&path, &node, write_id);
        (write_id, events)
    }

    /// Applies a multi-location update relative to `path`.
    pub fn update(
        &mut self,
        path: Path,
        updates: impl IntoIterator<Item = (Path, Value)>,
    ) -> (WriteId, Vec<Event>) {
        let mut children = SparseTree::new();
        for (relative, value) in updates {
            children.set(&relative, Node::from_json(&value));
        }
        let write_id = self.generate_write_id();
        let events = self
            .sync_tree
            .apply_user_merge(path.clone(), children.clone(), write_id);
        self.transmitter.send_merge(&path, &children, write_id);
        (write_id, events)
    }

    /// Handles the backend's answer to a write: drop it from the overlay, or
    /// roll it back when the server rejected it.
    pub fn ack_write(&mut self, write_id: WriteId, revert: bool) -> Vec<Event> {
        self.sync_tree.ack_user_write(write_id, revert, true)
    }

    /// Routes a failed write by what its error code means: transient failures
    /// keep the write pending for the transport to retry, anything the
    /// backend rejected for good is reverted out of the overlay.
    pub fn handle_write_error(&mut self, write_id: WriteId, error: &DatabaseError) -> Vec<Event> {
        if error.retryable() && !error.causes_revert() {
            LOGGER.warn(format!(
                "Write {write_id} failed transiently, keeping it pending: {error}"
            ));
            return Vec::new();
        }
        LOGGER.warn(format!("Write {write_id} was rejected, reverting: {error}"));
        self.sync_tree.ack_user_write(write_id, true, true)
    }

    pub fn listen(&mut self, query: &QuerySpec, interest: EventInterest) -> (u64, Vec<Event>) {
        let registration_id = self.generate_registration_id();
        let events = self
            .sync_tree
            .add_event_registration(query, EventRegistration::new(registration_id, interest));
        (registration_id, events)
    }

    pub fn unlisten(&mut self, query: &QuerySpec, registration_id: u64) -> Vec<Event> {
        self.sync_tree
            .remove_event_registration(query, Some(registration_id), None)
    }

    /// Tears down every registration on `query`, yielding a cancel event per
    /// registration. Used when the backend reports a failed listen.
    pub fn cancel_listens(&mut self, query: &QuerySpec, error: DatabaseError) -> Vec<Event> {
        self.sync_tree
            .remove_event_registration(query, None, Some(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Tag;
    use crate::persistence::MemoryStorageAdapter;
    use serde_json::json;
    use std::sync::Mutex;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
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

    #[derive(Default)]
    struct NoopListenProvider;

    impl ListenProvider for NoopListenProvider {
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

    fn repo_with(transmitter: Arc<RecordingTransmitter>) -> Repo {
        Repo::new(Arc::new(NoopListenProvider), transmitter)
    }

    #[test]
    fn write_errors_revert_or_retry_by_code() {
        let transmitter = Arc::new(RecordingTransmitter::default());
        let mut repo = repo_with(transmitter);
        let (first, _) = repo.set(p("a"), &json!(1));
        let (second, _) = repo.set(p("b"), &json!(2));

        // Transient failure: the write stays pending for a retry.
        repo.handle_write_error(first, &crate::error::unavailable("socket dropped"));
        assert_eq!(repo.sync_tree().pending_write_ids(), vec![first, second]);

        // Hard rejection: the write is rolled out of the overlay.
        repo.handle_write_error(second, &crate::error::write_canceled("rules rejected it"));
        assert_eq!(repo.sync_tree().pending_write_ids(), vec![first]);
        assert_eq!(
            repo.sync_tree().calc_complete_event_cache(&p("b"), &[]),
            None
        );
    }

    #[test]
    fn writes_get_monotonic_ids_and_reach_the_transport() {
        let transmitter = Arc::new(RecordingTransmitter::default());
        let mut repo = repo_with(transmitter.clone());
        let (first, _) = repo.set(p("a"), &json!(1));
        let (second, _) = repo.set(p("b"), &json!(2));
        assert!(second > first);
        assert_eq!(*transmitter.sent.lock().unwrap(), vec![first, second]);
    }

    #[test]
    fn restart_restores_and_resends_pending_writes_in_order() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        {
            let transmitter = Arc::new(RecordingTransmitter::default());
            let mut repo = repo_with(transmitter);
            repo.enable_persistence(adapter.clone());
            repo.set(p("a"), &json!("one"));
            repo.set(p("b"), &json!("two"));
            // Neither write was acked before the "crash".
        }

        let transmitter = Arc::new(RecordingTransmitter::default());
        let mut repo = repo_with(transmitter.clone());
        repo.enable_persistence(adapter);

        assert_eq!(*transmitter.sent.lock().unwrap(), vec![1, 2]);
        assert_eq!(repo.next_write_id(), 3);
        assert_eq!(
            repo.sync_tree().calc_complete_event_cache(&p("a"), &[]),
            Some(Node::leaf(json!("one")))
        );
    }

    #[test]
    fn acked_writes_do_not_survive_restart() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        {
            let transmitter = Arc::new(RecordingTransmitter::default());
            let mut repo = repo_with(transmitter);
            repo.enable_persistence(adapter.clone());
            let (write_id, _) = repo.set(p("a"), &json!(1));
            repo.ack_write(write_id, false);
        }

        let transmitter = Arc::new(RecordingTransmitter::default());
        let mut repo = repo_with(transmitter.clone());
        repo.enable_persistence(adapter);
        assert!(transmitter.sent.lock().unwrap().is_empty());
        assert_eq!(repo.next_write_id(), 1);
    }
}
