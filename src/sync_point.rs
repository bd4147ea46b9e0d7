//! A sync point owns every view registered at one path and fans operations
//! out to them, or to exactly one view when the operation is server-tagged.

use std::collections::BTreeMap;

use crate::error::DatabaseError;
use crate::operation::Operation;
use crate::path::Path;
use crate::persistence::PersistenceManager;
use crate::query::QuerySpec;
use crate::snapshot::Node;
use crate::util::hard_assert;
use crate::view::{CacheNode, ChangeType, Event, EventRegistration, View, ViewCache};
use crate::write_tree::WriteTreeRef;

#[derive(Default)]
pub struct SyncPoint {
    /// Views keyed by query identifier.
    views: BTreeMap<String, View>,
}

impl SyncPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Node>,
        persistence: Option<&PersistenceManager>,
    ) -> Vec<Event> {
        if let Some(query_id) = operation.source().query_id() {
            let view = self.views.get_mut(query_id);
            hard_assert(
                view.is_some(),
                "SyncTree gave us an op for an invalid query.",
            );
            let view = view.unwrap();
            return apply_to_view(view, operation, writes, opt_complete_server_cache, persistence);
        }

        let mut events = Vec::new();
        for view in self.views.values_mut() {
            events.extend(apply_to_view(
                view,
                operation,
                writes,
                opt_complete_server_cache,
                persistence,
            ));
        }
        events
    }

    /// Attaches a registration, creating the view if the query is new here.
    /// Returns the initial events for the registration.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
        writes: &WriteTreeRef<'_>,
        server_cache: CacheNode,
        persistence: Option<&PersistenceManager>,
    ) -> Vec<Event> {
        let query_id = query.identifier();
        if !self.views.contains_key(&query_id) {
            // Seed the event cache from whatever data is complete.
            let complete_server = if server_cache.is_fully_initialized() && !server_cache.is_filtered()
            {
                Some(server_cache.node().clone())
            } else {
                None
            };
            let (event_node, event_complete) =
                match writes.calc_complete_event_cache(complete_server.as_ref()) {
                    Some(node) => (node, true),
                    None => (
                        writes.calc_complete_event_children(server_cache.node()),
                        false,
                    ),
                };
            let event_cache = CacheNode::new(
                event_node,
                event_complete || server_cache.is_fully_initialized(),
                query.params.is_limited(),
            );
            let view = View::new(query.clone(), ViewCache::new(event_cache, server_cache));
            if query.params.filters_nodes() {
                if let Some(persistence) = persistence {
                    let keys: Vec<String> = view
                        .event_cache_node()
                        .children()
                        .map(|(key, _)| key.as_str().to_string())
                        .collect();
                    persistence.set_tracked_query_keys(query, &keys);
                }
            }
            self.views.insert(query_id.clone(), view);
        }

        let view = self.views.get_mut(&query_id).expect("view just ensured");
        let initial_events = view.get_initial_events(&registration);
        view.add_event_registration(registration);
        initial_events
    }

    /// Detaches registrations for `query`. Returns the queries whose views
    /// were dropped (their listens need stopping) plus any cancel events.
    /// Dropping the last complete view also reports the default query at this
    /// path so callers can re-establish coverage.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration_id: Option<u64>,
        cancel_error: Option<&DatabaseError>,
    ) -> (Vec<QuerySpec>, Vec<Event>) {
        let mut removed = Vec::new();
        let mut cancel_events = Vec::new();
        let had_complete_view = self.has_complete_view();

        if query.is_default() {
            // A default removal detaches from every view at the path.
            let mut emptied = Vec::new();
            for (query_id, view) in self.views.iter_mut() {
                cancel_events.extend(view.remove_event_registration(registration_id, cancel_error));
                if view.is_empty() {
                    emptied.push(query_id.clone());
                    if !view.query().loads_all_data() {
                        removed.push(view.query().clone());
                    }
                }
            }
            for query_id in emptied {
                self.views.remove(&query_id);
            }
        } else if let Some(view) = self.views.get_mut(&query.identifier()) {
            cancel_events.extend(view.remove_event_registration(registration_id, cancel_error));
            if view.is_empty() {
                let view_query = view.query().clone();
                self.views.remove(&query.identifier());
                if !view_query.loads_all_data() {
                    removed.push(view_query);
                }
            }
        }

        if had_complete_view && !self.has_complete_view() {
            removed.push(QuerySpec::default_at(query.path.clone()));
        }
        (removed, cancel_events)
    }

    pub fn get_complete_server_cache(&self, path: &Path) -> Option<Node> {
        self.views
            .values()
            .find_map(|view| view.get_complete_server_cache(path))
    }

    pub fn get_complete_view(&self) -> Option<&View> {
        self.views
            .values()
            .find(|view| view.query().loads_all_data())
    }

    pub fn has_complete_view(&self) -> bool {
        self.get_complete_view().is_some()
    }

    pub fn view_for_query(&self, query: &QuerySpec) -> Option<&View> {
        self.views.get(&query.identifier())
    }

    pub fn view_exists_for_query(&self, query: &QuerySpec) -> bool {
        self.views.contains_key(&query.identifier())
    }

    /// The filtered views at this point (queries that do not load all data).
    pub fn query_views(&self) -> impl Iterator<Item = &View> {
        self.views
            .values()
            .filter(|view| !view.query().loads_all_data())
    }

    pub fn view_queries(&self) -> Vec<QuerySpec> {
        self.views.values().map(|view| view.query().clone()).collect()
    }
}

fn apply_to_view(
    view: &mut View,
    operation: &Operation,
    writes: &WriteTreeRef<'_>,
    opt_complete_server_cache: Option<&Node>,
    persistence: Option<&PersistenceManager>,
) -> Vec<Event> {
    let (changes, events) = view.apply_operation(operation, writes, opt_complete_server_cache);
    if view.query().params.filters_nodes() {
        if let Some(persistence) = persistence {
            let mut added = Vec::new();
            let mut removed = Vec::new();
            for change in &changes {
                match change.kind {
                    ChangeType::ChildAdded => added.extend(change.child_key.clone()),
                    ChangeType::ChildRemoved => removed.extend(change.child_key.clone()),
                    _ => {}
                }
            }
            if !added.is_empty() || !removed.is_empty() {
                persistence.update_tracked_query_keys(view.query(), &added, &removed);
            }
        }
    }
    events
}
