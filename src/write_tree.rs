//! The ledger of pending user writes, layered over server data when views
//! compute what the user should see.
//!
//! Writes are totally ordered by write id. Visible writes feed the event
//! cache; hidden writes only participate when a caller explicitly asks for
//! them (`include_hidden`).

use crate::compound_write::CompoundWrite;
use crate::path::Path;
use crate::snapshot::Node;
use crate::tree::SparseTree;
use crate::util::hard_assert;

pub type WriteId = i64;

#[derive(Clone, Debug)]
pub enum WritePayload {
    Overwrite(Node),
    Merge(SparseTree<Node>),
}

#[derive(Clone, Debug)]
pub struct UserWriteRecord {
    pub write_id: WriteId,
    pub path: Path,
    pub payload: WritePayload,
    pub visible: bool,
}

#[derive(Default)]
pub struct WriteTree {
    /// Composite of all visible writes, kept current as records come and go.
    visible_writes: CompoundWrite,
    all_writes: Vec<UserWriteRecord>,
    last_write_id: Option<WriteId>,
}

impl WriteTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_overwrite(&mut self, path: Path, snap: Node, write_id: WriteId, visible: bool) {
        self.assert_ordered(write_id);
        if visible {
            self.visible_writes.add_write(&path, snap.clone());
        }
        self.all_writes.push(UserWriteRecord {
            write_id,
            path,
            payload: WritePayload::Overwrite(snap),
            visible,
        });
        self.last_write_id = Some(write_id);
    }

    pub fn add_merge(&mut self, path: Path, children: SparseTree<Node>, write_id: WriteId) {
        self.assert_ordered(write_id);
        self.visible_writes.add_merge(&path, &children);
        self.all_writes.push(UserWriteRecord {
            write_id,
            path,
            payload: WritePayload::Merge(children),
            visible: true,
        });
        self.last_write_id = Some(write_id);
    }

    fn assert_ordered(&self, write_id: WriteId) {
        hard_assert(
            self.last_write_id.map_or(true, |last| write_id > last),
            "Stacking an older write on top of newer ones",
        );
    }

    pub fn get_write(&self, write_id: WriteId) -> Option<&UserWriteRecord> {
        self.all_writes
            .iter()
            .find(|record| record.write_id == write_id)
    }

    pub fn pending_write_ids(&self) -> Vec<WriteId> {
        self.all_writes.iter().map(|record| record.write_id).collect()
    }

    /// Removes the record for `write_id`. Returns whether the visible overlay
    /// may have changed anywhere, in which case affected sync points must be
    /// recomputed. Unknown ids are a no-op.
    pub fn remove_write(&mut self, write_id: WriteId) -> bool {
        let Some(index) = self
            .all_writes
            .iter()
            .position(|record| record.write_id == write_id)
        else {
            return false;
        };
        let removed = self.all_writes.remove(index);
        if !removed.visible {
            return false;
        }
        self.visible_writes = layer_records(&self.all_writes, &Path::root(), &[], false);
        true
    }

    /// The complete node pinned by visible writes at `path`, if any.
    pub fn get_complete_write_data(&self, path: &Path) -> Option<Node> {
        self.visible_writes.get_complete_node(path)
    }

    pub fn child_writes(&self, path: Path) -> WriteTreeRef<'_> {
        WriteTreeRef { path, writes: self }
    }

    /// Visible user data at `tree_path` given an optional complete server
    /// snapshot. `None` when neither the server nor the writes cover the path.
    pub fn calc_complete_event_cache(
        &self,
        tree_path: &Path,
        complete_server_cache: Option<&Node>,
        exclude_write_ids: &[WriteId],
        include_hidden_writes: bool,
    ) -> Option<Node> {
        if exclude_write_ids.is_empty() && !include_hidden_writes {
            if let Some(node) = self.visible_writes.get_complete_node(tree_path) {
                return Some(node);
            }
            let merge = self.visible_writes.child_compound_write(tree_path);
            return finish_layering(&merge, complete_server_cache);
        }
        let merge = layer_records(
            &self.all_writes,
            tree_path,
            exclude_write_ids,
            include_hidden_writes,
        );
        if let Some(node) = merge.get_complete_node(&Path::root()) {
            return Some(node);
        }
        finish_layering(&merge, complete_server_cache)
    }

    /// Children-only variant used when a complete event cache cannot be
    /// computed: every returned child is individually complete.
    pub fn calc_complete_event_children(&self, tree_path: &Path, server_children: &Node) -> Node {
        if let Some(top_level_set) = self.visible_writes.get_complete_node(tree_path) {
            if top_level_set.is_leaf() {
                return Node::empty();
            }
            return top_level_set;
        }
        let merge = self.visible_writes.child_compound_write(tree_path);
        let mut complete = Node::empty();
        for (key, node) in merge.complete_children() {
            complete = complete.update_immediate_child(&key, node);
        }
        for (key, child) in server_children.children() {
            let overlaid = merge
                .child_compound_write(&Path::root().child(key.as_str()))
                .apply(child);
            complete = complete.update_immediate_child(key.as_str(), overlaid);
        }
        complete
    }

    /// A complete visible write shadowing `path`, if one exists.
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.visible_writes.get_complete_node(path)
    }
}

fn finish_layering(merge: &CompoundWrite, complete_server_cache: Option<&Node>) -> Option<Node> {
    if merge.is_empty() {
        return complete_server_cache.cloned();
    }
    match complete_server_cache {
        Some(server) => Some(merge.apply(server)),
        None => {
            if merge.has_complete_write(&Path::root()) {
                Some(merge.apply(&Node::empty()))
            } else {
                None
            }
        }
    }
}

/// Rebuilds a compound write from raw records, scoped to `tree_path`.
fn layer_records(
    records: &[UserWriteRecord],
    tree_path: &Path,
    exclude_write_ids: &[WriteId],
    include_hidden_writes: bool,
) -> CompoundWrite {
    let mut merge = CompoundWrite::new();
    for record in records {
        if !record.visible && !include_hidden_writes {
            continue;
        }
        if exclude_write_ids.contains(&record.write_id) {
            continue;
        }
        let write_within = tree_path.contains(&record.path);
        let write_above = record.path.contains(tree_path);
        if !write_within && !write_above {
            continue;
        }
        match &record.payload {
            WritePayload::Overwrite(snap) => {
                if write_within {
                    let relative = tree_path.relative_to(&record.path).expect("within tree");
                    merge.add_write(&relative, snap.clone());
                } else {
                    let relative = record.path.relative_to(tree_path).expect("above tree");
                    merge.add_write(&Path::root(), snap.get_child(&relative));
                }
            }
            WritePayload::Merge(children) => {
                if write_within {
                    let relative = tree_path.relative_to(&record.path).expect("within tree");
                    merge.add_merge(&relative, children);
                } else {
                    let relative = record.path.relative_to(tree_path).expect("above tree");
                    if relative.is_empty() {
                        merge.add_merge(&Path::root(), children);
                    } else if let Some((covering, node)) = children.find_root_most(&relative) {
                        let remaining = covering.relative_to(&relative).expect("covering above");
                        merge.add_write(&Path::root(), node.get_child(&remaining));
                    } else if let Some(subtree) = children.subtree(&relative) {
                        merge.add_merge(&Path::root(), subtree);
                    }
                }
            }
        }
    }
    merge
}

/// A view of the write tree scoped below one path; handed to views so all of
/// their lookups stay relative.
pub struct WriteTreeRef<'a> {
    path: Path,
    writes: &'a WriteTree,
}

impl<'a> WriteTreeRef<'a> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn calc_complete_event_cache(&self, complete_server_cache: Option<&Node>) -> Option<Node> {
        self.writes
            .calc_complete_event_cache(&self.path, complete_server_cache, &[], false)
    }

    pub fn calc_complete_event_children(&self, server_children: &Node) -> Node {
        self.writes
            .calc_complete_event_children(&self.path, server_children)
    }

    pub fn shadowing_write(&self, relative: &Path) -> Option<Node> {
        self.writes.shadowing_write(&self.path.child_path(relative))
    }

    pub fn child(&self, key: &str) -> WriteTreeRef<'a> {
        WriteTreeRef {
            path: self.path.child(key),
            writes: self.writes,
        }
    }

    pub fn child_path(&self, relative: &Path) -> WriteTreeRef<'a> {
        WriteTreeRef {
            path: self.path.child_path(relative),
            writes: self.writes,
        }
    }
}
