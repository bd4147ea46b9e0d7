//! The central entry point of the sync core: a tree of sync points fed by
//! server frames and user writes, de-duplicating backend listens so a default
//! listener at an ancestor shadows everything beneath it.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::error::DatabaseError;
use crate::logger::Logger;
use crate::operation::{Operation, OperationSource, Tag};
use crate::path::Path;
use crate::persistence::PersistenceManager;
use crate::query::QuerySpec;
use crate::server_values::resolve_deferred_node;
use crate::snapshot::Node;
use crate::sync_point::SyncPoint;
use crate::tree::SparseTree;
use crate::util::hard_assert;
use crate::view::{CacheNode, Event, EventRegistration};
use crate::write_tree::{WriteId, WritePayload, WriteTree};

/// Seam to the backend transport. `hash_fn` produces a content hash of the
/// current server cache for listen revalidation. Listen completion and listen
/// failure are routed back through `apply_listen_complete` /
/// `apply_tagged_listen_complete` / `remove_event_registration` with a cancel
/// error.
pub trait ListenProvider: Send + Sync {
    fn start_listening(
        &self,
        query: &QuerySpec,
        tag: Option<Tag>,
        hash_fn: Box<dyn Fn() -> String + Send + Sync>,
    ) -> Vec<Event>;

    fn stop_listening(&self, query: &QuerySpec, tag: Option<Tag>);
}

pub struct SyncTree {
    sync_point_tree: SparseTree<SyncPoint>,
    pending_write_tree: WriteTree,
    tag_to_query: HashMap<Tag, QuerySpec>,
    query_to_tag: HashMap<String, Tag>,
    next_tag: Tag,
    listen_provider: Arc<dyn ListenProvider>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl SyncTree {
    pub fn new(listen_provider: Arc<dyn ListenProvider>) -> Self {
        Self {
            sync_point_tree: SparseTree::new(),
            pending_write_tree: WriteTree::new(),
            tag_to_query: HashMap::new(),
            query_to_tag: HashMap::new(),
            next_tag: 1,
            listen_provider,
            persistence: None,
        }
    }

    pub fn with_persistence(
        listen_provider: Arc<dyn ListenProvider>,
        persistence: Arc<PersistenceManager>,
    ) -> Self {
        let mut tree = Self::new(listen_provider);
        tree.persistence = Some(persistence);
        tree
    }

    pub fn persistence(&self) -> Option<&Arc<PersistenceManager>> {
        self.persistence.as_ref()
    }

    /// Attaches durable storage. Must happen exactly once, before any
    /// registration or write flows through the tree.
    pub fn enable_persistence(&mut self, persistence: Arc<PersistenceManager>) {
        hard_assert(
            self.persistence.is_none(),
            "Persistence can only be enabled once",
        );
        self.persistence = Some(persistence);
    }

    // ---------------------------------------------------------------- writes

    /// Records a user overwrite and recomputes affected views when visible.
    pub fn apply_user_overwrite(
        &mut self,
        path: Path,
        new_data: Node,
        write_id: WriteId,
        visible: bool,
    ) -> Vec<Event> {
        if let Some(persistence) = &self.persistence {
            persistence.save_user_overwrite(&path, &new_data, write_id);
        }
        self.pending_write_tree
            .add_overwrite(path.clone(), new_data.clone(), write_id, visible);
        if !visible {
            return Vec::new();
        }
        self.apply_operation_to_sync_points(&Operation::Overwrite {
            source: OperationSource::User,
            path,
            snap: new_data,
        })
    }

    pub fn apply_user_merge(
        &mut self,
        path: Path,
        changed_children: SparseTree<Node>,
        write_id: WriteId,
    ) -> Vec<Event> {
        if let Some(persistence) = &self.persistence {
            persistence.save_user_merge(&path, &changed_children, write_id);
        }
        self.pending_write_tree
            .add_merge(path.clone(), changed_children.clone(), write_id);
        self.apply_operation_to_sync_points(&Operation::Merge {
            source: OperationSource::User,
            path,
            children: changed_children,
        })
    }

    /// Acknowledges (or reverts) a pending write. Acking an id that was never
    /// recorded is a no-op.
    pub fn ack_user_write(&mut self, write_id: WriteId, revert: bool, persist: bool) -> Vec<Event> {
        let Some(write) = self.pending_write_tree.get_write(write_id).cloned() else {
            return Vec::new();
        };

        if let Some(persistence) = &self.persistence {
            if write.visible && persist {
                persistence.remove_user_write(write_id);
            }
            if !revert {
                // The confirmed write is canonical now; integrate it durably
                // with deferred server values resolved.
                let existing = self.calc_complete_event_cache(&write.path, &[write_id]);
                match &write.payload {
                    WritePayload::Overwrite(snap) => {
                        let resolved = resolve_deferred_node(snap, existing.as_ref());
                        persistence.apply_user_write(&resolved, &write.path);
                    }
                    WritePayload::Merge(children) => {
                        let mut resolved = SparseTree::new();
                        children.for_each(&mut |relative, node| {
                            let existing_child =
                                existing.as_ref().map(|node| node.get_child(relative));
                            resolved
                                .set(relative, resolve_deferred_node(node, existing_child.as_ref()));
                        });
                        persistence.apply_user_merge(&resolved, &write.path);
                    }
                }
            }
        }

        if !self.pending_write_tree.remove_write(write_id) {
            return Vec::new();
        }
        let mut affected_tree = SparseTree::new();
        match &write.payload {
            WritePayload::Overwrite(_) => affected_tree.set(&Path::root(), true),
            WritePayload::Merge(children) => {
                children.for_each(&mut |relative, _| affected_tree.set(relative, true));
            }
        }
        self.apply_operation_to_sync_points(&Operation::AckUserWrite {
            path: write.path,
            affected_tree,
            revert,
        })
    }

    pub fn pending_write_ids(&self) -> Vec<WriteId> {
        self.pending_write_tree.pending_write_ids()
    }

    // -------------------------------------------------- untagged server data

    pub fn apply_server_overwrite(&mut self, path: Path, new_data: Node) -> Vec<Event> {
        if let Some(persistence) = &self.persistence {
            persistence
                .apply_server_overwrite(&new_data, &QuerySpec::default_at(path.clone()));
        }
        self.apply_operation_to_sync_points(&Operation::Overwrite {
            source: OperationSource::Server,
            path,
            snap: new_data,
        })
    }

    pub fn apply_server_merge(
        &mut self,
        path: Path,
        changed_children: SparseTree<Node>,
    ) -> Vec<Event> {
        if let Some(persistence) = &self.persistence {
            persistence.apply_server_merge(&changed_children, &path);
        }
        self.apply_operation_to_sync_points(&Operation::Merge {
            source: OperationSource::Server,
            path,
            children: changed_children,
        })
    }

    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<Event> {
        if let Some(persistence) = &self.persistence {
            persistence.set_query_complete(&QuerySpec::default_at(path.clone()));
        }
        self.apply_operation_to_sync_points(&Operation::ListenComplete {
            source: OperationSource::Server,
            path,
        })
    }

    // ---------------------------------------------------- tagged server data

    /// A server update scoped to one filtered listen. Updates for tags we no
    /// longer know about are dropped silently (the query was forgotten while
    /// the frame was in flight).
    pub fn apply_tagged_query_overwrite(
        &mut self,
        path: Path,
        snap: Node,
        tag: Tag,
    ) -> Vec<Event> {
        let Some(query) = self.query_for_tag(tag) else {
            LOGGER.debug(format!("Dropping tagged overwrite for unknown tag {tag}"));
            return Vec::new();
        };
        let relative_path = relative_to_query(&query, &path);
        if let Some(persistence) = &self.persistence {
            if relative_path.is_empty() {
                persistence.apply_server_overwrite(&snap, &query);
            } else {
                persistence.apply_server_overwrite(&snap, &QuerySpec::default_at(path));
            }
        }
        let op = Operation::Overwrite {
            source: OperationSource::TaggedServer(query.identifier()),
            path: relative_path,
            snap,
        };
        self.apply_tagged_operation(&query.path, &op)
    }

    pub fn apply_tagged_query_merge(
        &mut self,
        path: Path,
        changed_children: SparseTree<Node>,
        tag: Tag,
    ) -> Vec<Event> {
        let Some(query) = self.query_for_tag(tag) else {
            return Vec::new();
        };
        let relative_path = relative_to_query(&query, &path);
        if let Some(persistence) = &self.persistence {
            persistence.apply_server_merge(&changed_children, &path);
        }
        let op = Operation::Merge {
            source: OperationSource::TaggedServer(query.identifier()),
            path: relative_path,
            children: changed_children,
        };
        self.apply_tagged_operation(&query.path, &op)
    }

    pub fn apply_tagged_listen_complete(&mut self, path: Path, tag: Tag) -> Vec<Event> {
        let Some(query) = self.query_for_tag(tag) else {
            return Vec::new();
        };
        let relative_path = relative_to_query(&query, &path);
        if let Some(persistence) = &self.persistence {
            persistence.set_query_complete(&query);
        }
        let op = Operation::ListenComplete {
            source: OperationSource::TaggedServer(query.identifier()),
            path: relative_path,
        };
        self.apply_tagged_operation(&query.path, &op)
    }

    // ---------------------------------------------------------- registration

    /// Attaches a registration, wiring up caches, tags, and backend listens.
    /// Returns the initial events for the registration.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
    ) -> Vec<Event> {
        let path = query.path.clone();

        let mut found_server_cache: Option<Node> = None;
        let mut found_ancestor_default_view = false;
        self.sync_point_tree.for_each_on_path(&path, &mut |sp_path, point| {
            if found_server_cache.is_none() {
                let relative = sp_path.relative_to(&path).expect("walk stays above path");
                found_server_cache = point.get_complete_server_cache(&relative);
            }
            found_ancestor_default_view =
                found_ancestor_default_view || point.has_complete_view();
        });

        if let Some(persistence) = &self.persistence {
            persistence.set_query_active(query);
        }

        let view_already_exists = self
            .sync_point_tree
            .get(&path)
            .is_some_and(|point| point.view_exists_for_query(query));
        if !view_already_exists && !query.loads_all_data() {
            // New filtered view: assign its routing tag.
            let query_key = query.query_key();
            hard_assert(
                !self.query_to_tag.contains_key(&query_key),
                "View does not exist but we have a tag",
            );
            let tag = self.next_tag;
            self.next_tag += 1;
            self.query_to_tag.insert(query_key, tag);
            self.tag_to_query.insert(tag, query.clone());
        }

        let server_cache = match found_server_cache {
            Some(node) => CacheNode::new(node, true, false),
            None => match &self.persistence {
                Some(persistence) => persistence.get_server_cache(query),
                None => {
                    let mut node = Node::empty();
                    if let Some(subtree) = self.sync_point_tree.subtree(&path) {
                        for (child_key, child_tree) in subtree.children() {
                            if let Some(point) = child_tree.value() {
                                if let Some(complete) =
                                    point.get_complete_server_cache(&Path::root())
                                {
                                    node = node.update_immediate_child(child_key, complete);
                                }
                            }
                        }
                    }
                    CacheNode::new(node, false, false)
                }
            },
        };

        let subtree = self.sync_point_tree.ensure_subtree(&path);
        if subtree.value().is_none() {
            subtree.set_root_value(SyncPoint::new());
        }
        let point = subtree.value_mut().expect("sync point just ensured");
        let writes = self.pending_write_tree.child_writes(path.clone());
        let mut events = point.add_event_registration(
            query,
            registration,
            &writes,
            server_cache,
            self.persistence.as_deref(),
        );

        if !view_already_exists && !found_ancestor_default_view {
            events.extend(self.setup_listener(query));
        }
        events
    }

    /// Detaches registrations and tears down or re-arranges backend listens so
    /// coverage is preserved. Returns cancel events when `cancel_error` is set.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration_id: Option<u64>,
        cancel_error: Option<DatabaseError>,
    ) -> Vec<Event> {
        let path = query.path.clone();
        let Some(point) = self.sync_point_tree.get_mut(&path) else {
            return Vec::new();
        };
        // The default query matches even when no explicit default view exists.
        if !query.is_default() && !point.view_exists_for_query(query) {
            return Vec::new();
        }

        let (removed, cancel_events) =
            point.remove_event_registration(query, registration_id, cancel_error.as_ref());
        if point.is_empty() {
            self.sync_point_tree.remove(&path);
        }

        if let Some(persistence) = &self.persistence {
            for removed_query in &removed {
                persistence.set_query_inactive(removed_query);
            }
        }

        let removing_default = removed
            .iter()
            .any(|removed_query| removed_query.loads_all_data());
        let mut covered = false;
        self.sync_point_tree.for_each_on_path(&path, &mut |_, point| {
            covered = covered || point.has_complete_view();
        });

        if removing_default && !covered {
            // Descendant views lose their umbrella listen; give each its own
            // before the default listen goes away.
            let orphaned = self
                .sync_point_tree
                .subtree(&path)
                .map(collect_distinct_views)
                .unwrap_or_default();
            for (orphan_query, server_node) in orphaned {
                let _ = self.start_listen_for(&orphan_query, server_node);
            }
        }

        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                self.listen_provider
                    .stop_listening(&query.for_listening(), None);
            } else {
                for removed_query in &removed {
                    let tag = self.tag_for_query(removed_query);
                    hard_assert(tag.is_some(), "We should have a tag for this removed query");
                    self.listen_provider
                        .stop_listening(&removed_query.for_listening(), tag);
                }
            }
        }

        for removed_query in &removed {
            if !removed_query.loads_all_data() {
                if let Some(tag) = self.query_to_tag.remove(&removed_query.query_key()) {
                    self.tag_to_query.remove(&tag);
                }
            }
        }

        cancel_events
    }

    // --------------------------------------------------------------- queries

    /// The deepest complete server cache on `path`, overlaid with pending
    /// writes (hidden ones included), excluding the given write ids.
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        exclude_write_ids: &[WriteId],
    ) -> Option<Node> {
        let mut server_cache: Option<Node> = None;
        self.sync_point_tree.for_each_on_path(path, &mut |sp_path, point| {
            let relative = sp_path.relative_to(path).expect("walk stays above path");
            if let Some(cache) = point.get_complete_server_cache(&relative) {
                server_cache = Some(cache);
            }
        });
        self.pending_write_tree.calc_complete_event_cache(
            path,
            server_cache.as_ref(),
            exclude_write_ids,
            true,
        )
    }

    pub fn tag_for_query(&self, query: &QuerySpec) -> Option<Tag> {
        self.query_to_tag.get(&query.query_key()).copied()
    }

    pub fn query_for_tag(&self, tag: Tag) -> Option<QuerySpec> {
        self.tag_to_query.get(&tag).cloned()
    }

    pub fn num_sync_points(&self) -> usize {
        let mut count = 0;
        self.sync_point_tree.for_each(&mut |_, _| count += 1);
        count
    }

    pub fn num_tags(&self) -> usize {
        self.tag_to_query.len()
    }

    // ------------------------------------------------------------- internals

    fn apply_tagged_operation(&mut self, query_path: &Path, operation: &Operation) -> Vec<Event> {
        let Self {
            sync_point_tree,
            pending_write_tree,
            persistence,
            ..
        } = self;
        let point = sync_point_tree.get_mut(query_path);
        hard_assert(
            point.is_some(),
            "Missing sync point for query tag that we're tracking",
        );
        let writes = pending_write_tree.child_writes(query_path.clone());
        point
            .unwrap()
            .apply_operation(operation, &writes, None, persistence.as_deref())
    }

    fn apply_operation_to_sync_points(&mut self, operation: &Operation) -> Vec<Event> {
        let Self {
            sync_point_tree,
            pending_write_tree,
            persistence,
            ..
        } = self;
        apply_operation_helper(
            sync_point_tree,
            operation,
            &Path::root(),
            pending_write_tree,
            None,
            persistence.as_deref(),
        )
    }

    /// Opens the backend listen for a newly created view, tearing down any
    /// listens a new default listen shadows.
    fn setup_listener(&mut self, query: &QuerySpec) -> Vec<Event> {
        let server_node = self
            .sync_point_tree
            .get(&query.path)
            .and_then(|point| point.view_for_query(query))
            .map(|view| view.view_cache().server_cache().node().clone())
            .unwrap_or_else(Node::empty);
        let (tag, events) = self.start_listen_for(query, server_node);

        if tag.is_none() {
            let shadowed = self
                .sync_point_tree
                .subtree(&query.path)
                .map(|subtree| collect_shadowed_queries(subtree, true))
                .unwrap_or_default();
            for shadowed_query in shadowed {
                let shadowed_tag = self.tag_for_query(&shadowed_query);
                self.listen_provider
                    .stop_listening(&shadowed_query.for_listening(), shadowed_tag);
            }
        }
        events
    }

    fn start_listen_for(&mut self, query: &QuerySpec, server_node: Node) -> (Option<Tag>, Vec<Event>) {
        let tag = self.tag_for_query(query);
        let events = self.listen_provider.start_listening(
            &query.for_listening(),
            tag,
            Box::new(move || server_node.hash()),
        );
        (tag, events)
    }
}

fn relative_to_query(query: &QuerySpec, path: &Path) -> Path {
    let relative = query.path.relative_to(path);
    hard_assert(
        relative.is_some(),
        "Tagged update path must fall under its query",
    );
    relative.unwrap()
}

/// Views in a subtree that need their own listens once an umbrella listen goes
/// away: one complete view per branch when present, else every filtered view.
fn collect_distinct_views(tree: &SparseTree<SyncPoint>) -> Vec<(QuerySpec, Node)> {
    if let Some(point) = tree.value() {
        if let Some(view) = point.get_complete_view() {
            return vec![(
                view.query().clone(),
                view.view_cache().server_cache().node().clone(),
            )];
        }
    }
    let mut views = Vec::new();
    if let Some(point) = tree.value() {
        for view in point.query_views() {
            views.push((
                view.query().clone(),
                view.view_cache().server_cache().node().clone(),
            ));
        }
    }
    for (_, child) in tree.children() {
        views.extend(collect_distinct_views(child));
    }
    views
}

/// Queries whose listens a fresh default listen at the subtree root shadows:
/// filtered queries at the root itself, and below it one complete view per
/// branch (which in turn shadows its own descendants) or all filtered views.
fn collect_shadowed_queries(tree: &SparseTree<SyncPoint>, at_root: bool) -> Vec<QuerySpec> {
    if !at_root {
        if let Some(point) = tree.value() {
            if let Some(view) = point.get_complete_view() {
                return vec![view.query().clone()];
            }
        }
    }
    let mut queries = Vec::new();
    if let Some(point) = tree.value() {
        queries.extend(point.query_views().map(|view| view.query().clone()));
    }
    for (_, child) in tree.children() {
        queries.extend(collect_shadowed_queries(child, false));
    }
    queries
}

fn apply_operation_helper(
    tree: &mut SparseTree<SyncPoint>,
    operation: &Operation,
    tree_path: &Path,
    writes: &WriteTree,
    server_cache: Option<Node>,
    persistence: Option<&PersistenceManager>,
) -> Vec<Event> {
    if operation.path().is_empty() {
        return apply_operation_descendants(
            tree, operation, tree_path, writes, server_cache, persistence,
        );
    }

    let server_cache = match (server_cache, tree.value()) {
        (None, Some(point)) => point.get_complete_server_cache(&Path::root()),
        (cache, _) => cache,
    };

    let mut events = Vec::new();
    let child_key = operation
        .path()
        .front()
        .expect("non-empty operation path")
        .to_string();
    if let Some(child_operation) = operation.operation_for_child(&child_key) {
        if let Some(child_tree) = tree.child_mut(&child_key) {
            let child_server = server_cache
                .as_ref()
                .map(|node| node.get_immediate_child(&child_key));
            events.extend(apply_operation_helper(
                child_tree,
                &child_operation,
                &tree_path.child(child_key.clone()),
                writes,
                child_server,
                persistence,
            ));
        }
    }
    if let Some(point) = tree.value_mut() {
        let writes_ref = writes.child_writes(tree_path.clone());
        events.extend(point.apply_operation(
            operation,
            &writes_ref,
            server_cache.as_ref(),
            persistence,
        ));
    }
    events
}

fn apply_operation_descendants(
    tree: &mut SparseTree<SyncPoint>,
    operation: &Operation,
    tree_path: &Path,
    writes: &WriteTree,
    server_cache: Option<Node>,
    persistence: Option<&PersistenceManager>,
) -> Vec<Event> {
    let server_cache = match (server_cache, tree.value()) {
        (None, Some(point)) => point.get_complete_server_cache(&Path::root()),
        (cache, _) => cache,
    };

    let mut events = Vec::new();
    let child_keys: Vec<String> = tree.children().map(|(key, _)| key.clone()).collect();
    for child_key in child_keys {
        if let Some(child_operation) = operation.operation_for_child(&child_key) {
            let child_server = server_cache
                .as_ref()
                .map(|node| node.get_immediate_child(&child_key));
            if let Some(child_tree) = tree.child_mut(&child_key) {
                events.extend(apply_operation_descendants(
                    child_tree,
                    &child_operation,
                    &tree_path.child(child_key.clone()),
                    writes,
                    child_server,
                    persistence,
                ));
            }
        }
    }
    if let Some(point) = tree.value_mut() {
        let writes_ref = writes.child_writes(tree_path.clone());
        events.extend(point.apply_operation(
            operation,
            &writes_ref,
            server_cache.as_ref(),
            persistence,
        ));
    }
    events
}

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/database-core/sync"));
