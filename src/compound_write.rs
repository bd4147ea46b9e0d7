//! A set of pending overwrites organized by path, applied as an overlay onto
//! server data. A write at a path shadows everything recorded deeper.

use crate::path::Path;
use crate::snapshot::Node;
use crate::tree::SparseTree;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompoundWrite {
    writes: SparseTree<Node>,
}

impl CompoundWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Records a complete overwrite at `path`. When an ancestor already holds
    /// a complete write the new data is folded into it, keeping the shallowest
    /// write authoritative.
    pub fn add_write(&mut self, path: &Path, node: Node) {
        if let Some((root_path, existing)) = self.writes.find_root_most(path) {
            let relative = root_path.relative_to(path).expect("root-most lies above");
            let updated = existing.update_child(&relative, node);
            let root_path = root_path.clone();
            self.writes.set(&root_path, updated);
        } else {
            self.writes.set(path, node);
        }
    }

    /// Records one overwrite per entry of a (possibly deep) merge.
    pub fn add_merge(&mut self, path: &Path, merge: &SparseTree<Node>) {
        merge.for_each(&mut |relative, node| {
            self.add_write(&path.child_path(relative), node.clone());
        });
    }

    /// Drops the write recorded exactly at `path`. Deeper writes resurface.
    pub fn remove_write(&mut self, path: &Path) {
        self.writes.remove(path);
    }

    /// The complete node this overlay pins at `path`, when one exists at or
    /// above it.
    pub fn get_complete_node(&self, path: &Path) -> Option<Node> {
        let (root_path, node) = self.writes.find_root_most(path)?;
        let relative = root_path.relative_to(path)?;
        Some(node.get_child(&relative))
    }

    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.get_complete_node(path).is_some()
    }

    /// The overlay restricted to the subtree below `path`.
    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        if let Some(node) = self.get_complete_node(path) {
            let mut child = CompoundWrite::new();
            child.writes.set_root_value(node);
            return child;
        }
        CompoundWrite {
            writes: self
                .writes
                .subtree(path)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Immediate children of the overlay root that are completely written.
    pub fn complete_children(&self) -> Vec<(String, Node)> {
        if let Some(root) = self.writes.value() {
            return root
                .children()
                .map(|(key, node)| (key.as_str().to_string(), node.clone()))
                .collect();
        }
        self.writes
            .children()
            .filter_map(|(key, subtree)| {
                subtree
                    .value()
                    .map(|node| (key.clone(), node.clone()))
            })
            .collect()
    }

    /// Applies every write onto `node`. Shallower writes win over anything
    /// recorded beneath them.
    pub fn apply(&self, node: &Node) -> Node {
        apply_subtree(&self.writes, &Path::root(), node.clone())
    }
}

fn apply_subtree(writes: &SparseTree<Node>, relative: &Path, target: Node) -> Node {
    if let Some(value) = writes.value() {
        return target.update_child(relative, value.clone());
    }
    let mut target = target;
    for (key, child) in writes.children() {
        target = apply_subtree(child, &relative.child(key.clone()), target);
    }
    target
}
