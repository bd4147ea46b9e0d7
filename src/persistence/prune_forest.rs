//! A decision tree labeling subtrees of the server cache as prune or keep.
//! The leaf-most label on the way to a key decides its fate, so a kept
//! subtree survives inside a pruned one.

use crate::path::Path;
use crate::tree::SparseTree;
use crate::util::hard_assert;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PruneForest {
    /// `true` = keep, `false` = prune, absent = unset.
    tree: SparseTree<bool>,
}

impl PruneForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prunes_anything(&self) -> bool {
        self.tree.any(&mut |_, keep| !keep)
    }

    /// Marks `path` for pruning. Attempting to prune under a kept subtree is a
    /// programming error.
    pub fn prune_path(&mut self, path: &Path) {
        let kept_above = {
            let mut kept = false;
            self.tree.for_each_on_path(path, &mut |_, keep| {
                if *keep {
                    kept = true;
                }
            });
            kept
        };
        hard_assert(!kept_above, "Can't prune path that was kept previously!");
        self.tree.remove_subtree(path);
        self.tree.set(path, false);
    }

    /// Marks `path` as kept, overriding any prune labels beneath it.
    pub fn keep_path(&mut self, path: &Path) {
        self.tree.remove_subtree(path);
        self.tree.set(path, true);
    }

    /// Whether unkept data at or below `path` should be evicted: the
    /// leaf-most label on the walk to `path` is a prune label.
    pub fn should_prune_unkept_descendants(&self, path: &Path) -> bool {
        match self.tree.leaf_most_on_path(path) {
            Some((_, keep)) => !*keep,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[test]
    fn prune_marks_whole_subtree() {
        let mut forest = PruneForest::new();
        forest.prune_path(&p("a"));
        assert!(forest.prunes_anything());
        assert!(forest.should_prune_unkept_descendants(&p("a")));
        assert!(forest.should_prune_unkept_descendants(&p("a/deep/leaf")));
        assert!(!forest.should_prune_unkept_descendants(&p("b")));
    }

    #[test]
    fn keep_inside_prune_survives() {
        let mut forest = PruneForest::new();
        forest.prune_path(&p("a"));
        forest.keep_path(&p("a/keep"));
        assert!(forest.should_prune_unkept_descendants(&p("a/other")));
        assert!(!forest.should_prune_unkept_descendants(&p("a/keep")));
        assert!(!forest.should_prune_unkept_descendants(&p("a/keep/child")));
    }

    #[test]
    fn keep_clears_earlier_prunes_below() {
        let mut forest = PruneForest::new();
        forest.prune_path(&p("a/b"));
        forest.keep_path(&p("a"));
        assert!(!forest.prunes_anything());
        assert!(!forest.should_prune_unkept_descendants(&p("a/b/c")));
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn pruning_under_a_kept_path_is_fatal() {
        let mut forest = PruneForest::new();
        forest.keep_path(&p("a"));
        forest.prune_path(&p("a/b"));
    }
}
