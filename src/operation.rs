//! Operations flowing through the sync tree, tagged with where they came from.
//! Paths inside an operation are relative to the node the operation is applied
//! to; `operation_for_child` performs the descent.

use crate::path::Path;
use crate::snapshot::Node;
use crate::tree::SparseTree;
use crate::util::hard_assert;

/// Routing tag for a filtered server listen.
pub type Tag = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationSource {
    User,
    Server,
    /// A server update scoped to one view, addressed by query identifier.
    TaggedServer(String),
}

impl OperationSource {
    pub fn is_from_user(&self) -> bool {
        matches!(self, OperationSource::User)
    }

    pub fn is_from_server(&self) -> bool {
        !self.is_from_user()
    }

    pub fn query_id(&self) -> Option<&str> {
        match self {
            OperationSource::TaggedServer(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Operation {
    Overwrite {
        source: OperationSource,
        path: Path,
        snap: Node,
    },
    Merge {
        source: OperationSource,
        path: Path,
        children: SparseTree<Node>,
    },
    AckUserWrite {
        path: Path,
        /// Subtrees affected by the acked write; `true` at a node means the
        /// entire subtree below it was covered by the write.
        affected_tree: SparseTree<bool>,
        revert: bool,
    },
    ListenComplete {
        source: OperationSource,
        path: Path,
    },
}

impl Operation {
    pub fn source(&self) -> &OperationSource {
        match self {
            Operation::Overwrite { source, .. } => source,
            Operation::Merge { source, .. } => source,
            Operation::AckUserWrite { .. } => &OperationSource::User,
            Operation::ListenComplete { source, .. } => source,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. } => path,
            Operation::Merge { path, .. } => path,
            Operation::AckUserWrite { path, .. } => path,
            Operation::ListenComplete { path, .. } => path,
        }
    }

    /// The operation restricted to the named child, or `None` when the child
    /// is unaffected.
    pub fn operation_for_child(&self, key: &str) -> Option<Operation> {
        match self {
            Operation::Overwrite { source, path, snap } => match path.front() {
                None => Some(Operation::Overwrite {
                    source: source.clone(),
                    path: Path::root(),
                    snap: snap.get_immediate_child(key),
                }),
                Some(front) if front == key => Some(Operation::Overwrite {
                    source: source.clone(),
                    path: path.pop_front(),
                    snap: snap.clone(),
                }),
                Some(_) => None,
            },
            Operation::Merge {
                source,
                path,
                children,
            } => match path.front() {
                None => {
                    let child_tree = children.subtree(&Path::root().child(key))?;
                    if child_tree.is_empty() {
                        None
                    } else if let Some(node) = child_tree.value() {
                        Some(Operation::Overwrite {
                            source: source.clone(),
                            path: Path::root(),
                            snap: node.clone(),
                        })
                    } else {
                        Some(Operation::Merge {
                            source: source.clone(),
                            path: Path::root(),
                            children: child_tree.clone(),
                        })
                    }
                }
                Some(front) if front == key => Some(Operation::Merge {
                    source: source.clone(),
                    path: path.pop_front(),
                    children: children.clone(),
                }),
                Some(_) => None,
            },
            Operation::AckUserWrite {
                path,
                affected_tree,
                revert,
            } => match path.front() {
                None => {
                    if affected_tree.value().is_some() {
                        hard_assert(
                            affected_tree.children().next().is_none(),
                            "affectedTree should not have overlapping affected paths",
                        );
                        Some(self.clone())
                    } else {
                        let child_tree = affected_tree.subtree(&Path::root().child(key))?;
                        if child_tree.is_empty() {
                            None
                        } else {
                            Some(Operation::AckUserWrite {
                                path: Path::root(),
                                affected_tree: child_tree.clone(),
                                revert: *revert,
                            })
                        }
                    }
                }
                Some(front) if front == key => Some(Operation::AckUserWrite {
                    path: path.pop_front(),
                    affected_tree: affected_tree.clone(),
                    revert: *revert,
                }),
                Some(_) => None,
            },
            Operation::ListenComplete { source, path } => match path.front() {
                None => Some(Operation::ListenComplete {
                    source: source.clone(),
                    path: Path::root(),
                }),
                Some(front) if front == key => Some(Operation::ListenComplete {
                    source: source.clone(),
                    path: path.pop_front(),
                }),
                Some(_) => None,
            },
        }
    }
}
