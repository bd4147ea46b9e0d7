//! A view is the cached, filtered projection of one query: it applies
//! operations against its caches, diffs the result, and maps the resulting
//! changes to events for its registrations.

mod cache;
mod event;

pub use cache::{CacheNode, ViewCache};
pub use event::{CancelEvent, Change, ChangeType, DataEvent, Event, EventInterest, EventRegistration};

use std::collections::BTreeMap;

use crate::error::DatabaseError;
use crate::operation::Operation;
use crate::query::QuerySpec;
use crate::snapshot::Node;
use crate::write_tree::WriteTreeRef;

pub struct View {
    query: QuerySpec,
    view_cache: ViewCache,
    registrations: Vec<EventRegistration>,
}

impl View {
    /// Builds a view over an initial cache. The event side is re-filtered
    /// through the query parameters so a seeded cache can be handed in raw.
    pub fn new(query: QuerySpec, initial: ViewCache) -> Self {
        let event_cache = CacheNode::new(
            query.params.filter_node(initial.event_cache().node()),
            initial.event_cache().is_fully_initialized(),
            query.params.is_limited(),
        );
        let view_cache = ViewCache::new(event_cache, initial.server_cache().clone());
        Self {
            query,
            view_cache,
            registrations: Vec::new(),
        }
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub fn view_cache(&self) -> &ViewCache {
        &self.view_cache
    }

    pub fn event_cache_node(&self) -> &Node {
        self.view_cache.event_cache().node()
    }

    /// The server cache restricted to `path`, when it is authoritative there.
    pub fn get_complete_server_cache(&self, path: &crate::path::Path) -> Option<Node> {
        let cache = self.view_cache.server_cache();
        if cache.is_fully_initialized()
            && (self.query.loads_all_data() || cache.is_complete_for_path(path))
        {
            return Some(cache.node().get_child(path));
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn add_event_registration(&mut self, registration: EventRegistration) {
        self.registrations.push(registration);
    }

    /// Removes matching registrations (all of them when `registration_id` is
    /// `None`). With a cancel error, one cancel event per removed registration
    /// is returned.
    pub fn remove_event_registration(
        &mut self,
        registration_id: Option<u64>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<Event> {
        let removed: Vec<EventRegistration> = match registration_id {
            Some(id) => {
                let mut removed = Vec::new();
                self.registrations.retain(|registration| {
                    if registration.id() == id {
                        removed.push(registration.clone());
                        false
                    } else {
                        true
                    }
                });
                removed
            }
            None => std::mem::take(&mut self.registrations),
        };
        match cancel_error {
            None => Vec::new(),
            Some(error) => removed
                .into_iter()
                .map(|registration| {
                    Event::Cancel(CancelEvent {
                        query: self.query.clone(),
                        registration_id: registration.id(),
                        error: error.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Synthetic events bringing a fresh registration up to date with the
    /// current event cache.
    pub fn get_initial_events(&self, registration: &EventRegistration) -> Vec<Event> {
        let mut changes = Vec::new();
        for (key, child) in self.query.params.index.sort_children(self.event_cache_node()) {
            changes.push(Change::child_added(key.as_str(), child.clone()));
        }
        if self.view_cache.event_cache().is_fully_initialized() {
            changes.push(Change::value(self.event_cache_node().clone()));
        }
        self.events_for_changes(&changes, std::slice::from_ref(registration))
    }

    /// Applies an operation, updating both caches, and returns the raw changes
    /// (for tracked-query bookkeeping) plus the events to raise.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Node>,
    ) -> (Vec<Change>, Vec<Event>) {
        if let Operation::AckUserWrite {
            path,
            affected_tree,
            revert: false,
        } = operation
        {
            return self.ack_user_write(path, affected_tree, writes);
        }

        let old_event_cache = self.view_cache.event_cache().clone();
        let new_server_cache = self.apply_to_server_cache(operation);

        let complete_server = if new_server_cache.is_fully_initialized()
            && !new_server_cache.is_filtered()
        {
            Some(new_server_cache.node().clone())
        } else {
            opt_complete_server_cache.cloned()
        };

        let (event_node, event_complete) =
            match writes.calc_complete_event_cache(complete_server.as_ref()) {
                Some(node) => (node, true),
                None => (
                    writes.calc_complete_event_children(new_server_cache.node()),
                    false,
                ),
            };
        let new_event_cache = CacheNode::new(
            self.query.params.filter_node(&event_node),
            event_complete || new_server_cache.is_fully_initialized(),
            self.query.params.is_limited(),
        );

        let changes = diff_caches(&self.query, &old_event_cache, &new_event_cache);
        self.view_cache = ViewCache::new(new_event_cache, new_server_cache);

        let events = self.events_for_changes(&changes, &self.registrations);
        (changes, events)
    }

    /// A confirmed (non-reverted) write: the overlay entry is already gone,
    /// so re-derive the affected positions from authoritative server data.
    /// Without a complete server cache the confirmed data simply keeps
    /// showing; nothing changes until the server echoes it back.
    fn ack_user_write(
        &mut self,
        path: &crate::path::Path,
        affected_tree: &crate::tree::SparseTree<bool>,
        writes: &WriteTreeRef<'_>,
    ) -> (Vec<Change>, Vec<Event>) {
        let server = self.view_cache.server_cache().clone();
        if !server.is_fully_initialized() {
            return (Vec::new(), Vec::new());
        }
        let old_event_cache = self.view_cache.event_cache().clone();
        let mut event_node = old_event_cache.node().clone();
        affected_tree.for_each(&mut |relative, _| {
            let target = path.child_path(relative);
            let server_child = server.node().get_child(&target);
            let overlaid = writes
                .child_path(&target)
                .calc_complete_event_cache(Some(&server_child))
                .unwrap_or(server_child);
            event_node = event_node.update_child(&target, overlaid);
        });
        let new_event_cache = CacheNode::new(
            self.query.params.filter_node(&event_node),
            true,
            self.query.params.is_limited(),
        );
        let changes = diff_caches(&self.query, &old_event_cache, &new_event_cache);
        self.view_cache = ViewCache::new(new_event_cache, server);
        let events = self.events_for_changes(&changes, &self.registrations);
        (changes, events)
    }

    fn apply_to_server_cache(&self, operation: &Operation) -> CacheNode {
        let server = self.view_cache.server_cache();
        match operation {
            Operation::Overwrite { path, snap, source } => {
                let node = server.node().update_child(path, snap.clone());
                let fully_initialized = server.is_fully_initialized() || path.is_empty();
                let filtered = if path.is_empty() {
                    source.query_id().is_some() && self.query.params.is_limited()
                } else {
                    server.is_filtered()
                };
                CacheNode::new(node, fully_initialized, filtered)
            }
            Operation::Merge { path, children, .. } => {
                let mut node = server.node().clone();
                children.for_each(&mut |relative, child| {
                    node = node.update_child(&path.child_path(relative), child.clone());
                });
                CacheNode::new(node, server.is_fully_initialized(), server.is_filtered())
            }
            Operation::AckUserWrite { .. } => server.clone(),
            Operation::ListenComplete { .. } => {
                CacheNode::new(server.node().clone(), true, server.is_filtered())
            }
        }
    }

    fn events_for_changes(
        &self,
        changes: &[Change],
        registrations: &[EventRegistration],
    ) -> Vec<Event> {
        let mut events = Vec::new();
        for change in changes {
            for registration in registrations {
                if registration.responds_to(change.kind) {
                    events.push(Event::Data(DataEvent {
                        kind: change.kind,
                        query: self.query.clone(),
                        registration_id: registration.id(),
                        child_key: change.child_key.clone(),
                        snapshot: change.node.clone(),
                        old_snapshot: change.old_node.clone(),
                    }));
                }
            }
        }
        events
    }
}

/// Diffs two event caches into minimal changes, ordered removed, added,
/// moved, changed, then a trailing value change when warranted.
fn diff_caches(query: &QuerySpec, old: &CacheNode, new: &CacheNode) -> Vec<Change> {
    let old_children: BTreeMap<String, &Node> = old
        .node()
        .children()
        .map(|(key, node)| (key.as_str().to_string(), node))
        .collect();
    let new_children: BTreeMap<String, &Node> = new
        .node()
        .children()
        .map(|(key, node)| (key.as_str().to_string(), node))
        .collect();

    let mut removed = Vec::new();
    let mut added = Vec::new();
    let mut moved = Vec::new();
    let mut changed = Vec::new();

    for (key, old_child) in &old_children {
        if !new_children.contains_key(key) {
            removed.push(Change::child_removed(key.clone(), (*old_child).clone()));
        }
    }
    for (key, new_child) in &new_children {
        match old_children.get(key) {
            None => added.push(Change::child_added(key.clone(), (*new_child).clone())),
            Some(old_child) => {
                let index = &query.params.index;
                let child_key = crate::snapshot::ChildKey::from(key.as_str());
                if index.extract(&child_key, old_child) != index.extract(&child_key, new_child) {
                    moved.push(Change::child_moved(key.clone(), (*new_child).clone()));
                }
                if old_child != new_child {
                    changed.push(Change::child_changed(
                        key.clone(),
                        (*new_child).clone(),
                        (*old_child).clone(),
                    ));
                }
            }
        }
    }

    let mut changes = removed;
    changes.append(&mut added);
    changes.append(&mut moved);
    changes.append(&mut changed);

    let data_changed = old.node() != new.node();
    let became_complete = !old.is_fully_initialized() && new.is_fully_initialized();
    let value_allowed = !query.params.filters_nodes() || new.is_fully_initialized();
    if (data_changed || became_complete) && value_allowed {
        changes.push(Change::value(new.node().clone()));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationSource;
    use crate::path::Path;
    use crate::query::{QueryLimit, QueryParams};
    use crate::snapshot::Index;
    use crate::write_tree::WriteTree;
    use serde_json::json;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn n(json: serde_json::Value) -> Node {
        Node::from_json(&json)
    }

    fn default_view(path: &str) -> View {
        View::new(
            QuerySpec::default_at(p(path)),
            ViewCache::new(CacheNode::empty(), CacheNode::empty()),
        )
    }

    fn kinds(events: &[Event]) -> Vec<ChangeType> {
        events
            .iter()
            .filter_map(Event::as_data)
            .map(|event| event.kind)
            .collect()
    }

    #[test]
    fn server_overwrite_emits_adds_then_value() {
        let mut view = default_view("a");
        view.add_event_registration(EventRegistration::new(1, EventInterest::All));
        let writes = WriteTree::new();
        let op = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::root(),
            snap: n(json!({ "x": 1, "y": 2 })),
        };
        let (_, events) = view.apply_operation(&op, &writes.child_writes(p("a")), None);
        assert_eq!(
            kinds(&events),
            vec![ChangeType::ChildAdded, ChangeType::ChildAdded, ChangeType::Value]
        );
    }

    #[test]
    fn listen_complete_on_empty_location_emits_value() {
        let mut view = default_view("a");
        view.add_event_registration(EventRegistration::new(1, EventInterest::All));
        let writes = WriteTree::new();
        let op = Operation::ListenComplete {
            source: OperationSource::Server,
            path: Path::root(),
        };
        let (_, events) = view.apply_operation(&op, &writes.child_writes(p("a")), None);
        assert_eq!(kinds(&events), vec![ChangeType::Value]);
        let value = events[0].as_data().unwrap();
        assert!(value.snapshot.is_empty());
    }

    #[test]
    fn user_write_layers_over_server_data() {
        let mut view = default_view("a");
        view.add_event_registration(EventRegistration::new(1, EventInterest::All));
        let mut writes = WriteTree::new();

        let server = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::root(),
            snap: n(json!({ "x": 1 })),
        };
        view.apply_operation(&server, &writes.child_writes(p("a")), None);

        writes.add_overwrite(p("a/y"), n(json!("local")), 1, true);
        let user = Operation::Overwrite {
            source: OperationSource::User,
            path: p("y"),
            snap: n(json!("local")),
        };
        let (_, events) = view.apply_operation(&user, &writes.child_writes(p("a")), None);
        assert_eq!(kinds(&events), vec![ChangeType::ChildAdded, ChangeType::Value]);
        assert_eq!(
            view.event_cache_node().to_json(),
            json!({ "x": 1, "y": "local" })
        );
        // The server cache is untouched by the pending write.
        assert_eq!(
            view.view_cache().server_cache().node().to_json(),
            json!({ "x": 1 })
        );
    }

    #[test]
    fn limited_view_slides_children_in_and_out() {
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        params.set_limit(QueryLimit::First(2)).unwrap();
        let mut view = View::new(
            QuerySpec::new(p("list"), params),
            ViewCache::new(CacheNode::empty(), CacheNode::empty()),
        );
        view.add_event_registration(EventRegistration::new(1, EventInterest::All));
        let writes = WriteTree::new();

        let seed = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::root(),
            snap: n(json!({ "b": 1, "c": 2 })),
        };
        view.apply_operation(&seed, &writes.child_writes(p("list")), None);
        assert_eq!(view.event_cache_node().to_json(), json!({ "b": 1, "c": 2 }));

        // "a" sorts before the window: it slides in, "c" drops out.
        let update = Operation::Overwrite {
            source: OperationSource::Server,
            path: p("a"),
            snap: n(json!(0)),
        };
        let (_, events) = view.apply_operation(&update, &writes.child_writes(p("list")), None);
        assert_eq!(
            kinds(&events),
            vec![ChangeType::ChildRemoved, ChangeType::ChildAdded, ChangeType::Value]
        );
        assert_eq!(view.event_cache_node().to_json(), json!({ "a": 0, "b": 1 }));
    }

    #[test]
    fn moved_child_is_reported_before_changes() {
        let mut params = QueryParams::default();
        params
            .set_index(Index::Child(p("rank")))
            .unwrap();
        params.set_limit(QueryLimit::First(10)).unwrap();
        let mut view = View::new(
            QuerySpec::new(p("list"), params),
            ViewCache::new(CacheNode::empty(), CacheNode::empty()),
        );
        view.add_event_registration(EventRegistration::new(1, EventInterest::All));
        let writes = WriteTree::new();

        let seed = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::root(),
            snap: n(json!({ "a": { "rank": 1 }, "b": { "rank": 2 } })),
        };
        view.apply_operation(&seed, &writes.child_writes(p("list")), None);

        let update = Operation::Overwrite {
            source: OperationSource::Server,
            path: p("a/rank"),
            snap: n(json!(3)),
        };
        let (_, events) = view.apply_operation(&update, &writes.child_writes(p("list")), None);
        assert_eq!(
            kinds(&events),
            vec![ChangeType::ChildMoved, ChangeType::ChildChanged, ChangeType::Value]
        );
    }

    #[test]
    fn initial_events_replay_current_children() {
        let mut view = default_view("a");
        let writes = WriteTree::new();
        let seed = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::root(),
            snap: n(json!({ "x": 1 })),
        };
        view.apply_operation(&seed, &writes.child_writes(p("a")), None);

        let registration = EventRegistration::new(7, EventInterest::All);
        let events = view.get_initial_events(&registration);
        assert_eq!(kinds(&events), vec![ChangeType::ChildAdded, ChangeType::Value]);
        assert!(events
            .iter()
            .filter_map(Event::as_data)
            .all(|event| event.registration_id == 7));
    }

    #[test]
    fn cancel_events_cover_every_removed_registration() {
        let mut view = default_view("a");
        view.add_event_registration(EventRegistration::new(1, EventInterest::All));
        view.add_event_registration(EventRegistration::new(2, EventInterest::Value));
        let error = crate::error::unavailable("listen failed");
        let events = view.remove_event_registration(None, Some(&error));
        assert_eq!(events.len(), 2);
        assert!(view.is_empty());
        assert!(events.iter().all(|event| event.as_cancel().is_some()));
    }
}
