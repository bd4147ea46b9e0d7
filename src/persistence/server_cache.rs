//! Durable mirror of server snapshots, flattened to one key per primitive
//! leaf: `"/a/b/"` holds the primitive at `/a/b`. Interior nodes store
//! nothing; reads reassemble the subtree from a prefix scan.

use std::sync::Arc;

use crate::error::DatabaseResult;
use crate::path::Path;
use crate::persistence::prune_forest::PruneForest;
use crate::persistence::storage::{
    estimate_entry_size, StorageAdapter, WriteBatch, SERVER_CACHE_STORE,
};
use crate::snapshot::Node;
use crate::tree::SparseTree;

pub struct ServerCacheStore {
    adapter: Arc<dyn StorageAdapter>,
}

fn leaf_key(path: &Path) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        format!("{}/", path.slash_string())
    }
}

fn flatten_into(batch: &mut WriteBatch, path: &Path, node: &Node) {
    match node.leaf_value() {
        Some(value) => batch.set(leaf_key(path), value.clone()),
        None => {
            for (key, child) in node.children() {
                flatten_into(batch, &path.child(key.as_str()), child);
            }
        }
    }
}

/// Removing every ancestor leaf key preserves the invariant that a path never
/// simultaneously holds a leaf entry and a prefixed children entry.
fn remove_ancestor_leaves(batch: &mut WriteBatch, path: &Path) {
    let mut ancestor = Path::root();
    batch.remove(leaf_key(&ancestor));
    for segment in path.iter() {
        ancestor = ancestor.child(segment);
        batch.remove(leaf_key(&ancestor));
    }
}

fn parse_relative(key: &str, prefix: &str) -> Option<Path> {
    let remainder = key.strip_prefix(prefix)?;
    let segments: Vec<String> = remainder
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
        .collect();
    Some(Path::new(segments))
}

impl ServerCacheStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Replaces the cache below `path`. A partial overwrite only replaces the
    /// immediate children named in `node`, leaving siblings alone.
    pub fn overwrite(&self, node: &Node, path: &Path, partial: bool) -> DatabaseResult<()> {
        let mut batch = WriteBatch::new(SERVER_CACHE_STORE);
        remove_ancestor_leaves(&mut batch, path);
        if partial {
            for (key, child) in node.children() {
                let child_path = path.child(key.as_str());
                batch.remove_prefixed(leaf_key(&child_path));
                flatten_into(&mut batch, &child_path, child);
            }
        } else {
            batch.remove_prefixed(leaf_key(path));
            flatten_into(&mut batch, path, node);
        }
        self.adapter.run_batch(batch)
    }

    /// Applies a deep merge: each written location replaces its own subtree.
    pub fn merge(&self, merge: &SparseTree<Node>, path: &Path) -> DatabaseResult<()> {
        let mut batch = WriteBatch::new(SERVER_CACHE_STORE);
        remove_ancestor_leaves(&mut batch, path);
        merge.for_each(&mut |relative, node| {
            let target = path.child_path(relative);
            batch.remove_prefixed(leaf_key(&target));
            flatten_into(&mut batch, &target, node);
        });
        self.adapter.run_batch(batch)
    }

    /// Reassembles the subtree at `path` from the flattened leaves.
    pub fn get_at_path(&self, path: &Path) -> DatabaseResult<Node> {
        let prefix = leaf_key(path);
        let entries = self.adapter.get_all(SERVER_CACHE_STORE, Some(&prefix))?;
        let mut node = Node::empty();
        for (key, value) in entries {
            let Some(relative) = parse_relative(&key, &prefix) else {
                continue;
            };
            node = node.update_child(&relative, Node::from_json(&value));
        }
        Ok(node)
    }

    /// Reads only the named children of `path`, assembled into one node.
    pub fn get_for_keys(&self, keys: &[String], path: &Path) -> DatabaseResult<Node> {
        let mut node = Node::empty();
        for key in keys {
            let child = self.get_at_path(&path.child(key.clone()))?;
            node = node.update_immediate_child(key, child);
        }
        Ok(node)
    }

    /// Deletes every leaf whose relative path the forest marks as prunable.
    pub fn prune_cache(&self, forest: &PruneForest, path: &Path) -> DatabaseResult<()> {
        let prefix = leaf_key(path);
        let keys = self.adapter.keys(SERVER_CACHE_STORE, Some(&prefix))?;
        let mut batch = WriteBatch::new(SERVER_CACHE_STORE);
        for key in keys {
            let Some(relative) = parse_relative(&key, &prefix) else {
                continue;
            };
            if forest.should_prune_unkept_descendants(&relative) {
                batch.remove(key);
            }
        }
        if !batch.is_empty() {
            self.adapter.run_batch(batch)?;
        }
        Ok(())
    }

    pub fn estimated_size(&self) -> DatabaseResult<f64> {
        let entries = self.adapter.get_all(SERVER_CACHE_STORE, None)?;
        Ok(entries
            .iter()
            .map(|(key, value)| estimate_entry_size(key, value))
            .sum())
    }

    pub fn close(&self) -> DatabaseResult<()> {
        self.adapter.close(SERVER_CACHE_STORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::storage::MemoryStorageAdapter;
    use serde_json::json;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn store() -> ServerCacheStore {
        ServerCacheStore::new(Arc::new(MemoryStorageAdapter::new()))
    }

    #[test]
    fn overwrite_then_read_round_trips() {
        let store = store();
        let node = Node::from_json(&json!({ "a": 1, "b": { "c": "x" } }));
        store.overwrite(&node, &p("root"), false).unwrap();
        assert_eq!(store.get_at_path(&p("root")).unwrap(), node);
        assert_eq!(
            store.get_at_path(&p("root/b")).unwrap().to_json(),
            json!({ "c": "x" })
        );
    }

    #[test]
    fn overwrite_at_root_replaces_everything() {
        let store = store();
        store
            .overwrite(&Node::from_json(&json!({ "old": 1 })), &Path::root(), false)
            .unwrap();
        store
            .overwrite(&Node::from_json(&json!({ "new": 2 })), &Path::root(), false)
            .unwrap();
        assert_eq!(
            store.get_at_path(&Path::root()).unwrap().to_json(),
            json!({ "new": 2 })
        );
    }

    #[test]
    fn partial_overwrite_leaves_siblings() {
        let store = store();
        store
            .overwrite(
                &Node::from_json(&json!({ "a": 1, "b": 2, "c": 3 })),
                &p("list"),
                false,
            )
            .unwrap();
        store
            .overwrite(
                &Node::from_json(&json!({ "a": 10 })),
                &p("list"),
                true,
            )
            .unwrap();
        assert_eq!(
            store.get_at_path(&p("list")).unwrap().to_json(),
            json!({ "a": 10, "b": 2, "c": 3 })
        );
    }

    #[test]
    fn writing_under_a_leaf_clears_the_ancestor_leaf() {
        let store = store();
        store
            .overwrite(&Node::leaf(json!("scalar")), &p("x"), false)
            .unwrap();
        store
            .overwrite(&Node::leaf(json!(1)), &p("x/deep"), false)
            .unwrap();
        assert_eq!(
            store.get_at_path(&p("x")).unwrap().to_json(),
            json!({ "deep": 1 })
        );
    }

    #[test]
    fn get_for_keys_reads_selected_children() {
        let store = store();
        store
            .overwrite(
                &Node::from_json(&json!({ "a": 1, "b": 2, "c": 3 })),
                &p("list"),
                false,
            )
            .unwrap();
        let node = store
            .get_for_keys(&["a".to_string(), "c".to_string()], &p("list"))
            .unwrap();
        assert_eq!(node.to_json(), json!({ "a": 1, "c": 3 }));
    }

    #[test]
    fn prune_removes_unkept_subtrees_only() {
        let store = store();
        store
            .overwrite(
                &Node::from_json(&json!({ "evict": { "x": 1 }, "keep": { "y": 2 } })),
                &Path::root(),
                false,
            )
            .unwrap();
        let mut forest = PruneForest::new();
        forest.prune_path(&p("evict"));
        forest.keep_path(&p("keep"));
        store.prune_cache(&forest, &Path::root()).unwrap();
        assert_eq!(
            store.get_at_path(&Path::root()).unwrap().to_json(),
            json!({ "keep": { "y": 2 } })
        );
    }

    #[test]
    fn estimated_size_reflects_stored_leaves() {
        let store = store();
        assert_eq!(store.estimated_size().unwrap(), 0.0);
        store
            .overwrite(&Node::leaf(json!("abcd")), &p("k"), false)
            .unwrap();
        // Key "/k/" is 3 chars, value is a 4-char string.
        assert_eq!(store.estimated_size().unwrap(), 3.0 / 2.0 + 4.0);
    }
}
