use crate::path::Path;
use crate::snapshot::Node;

/// A node plus what we know about it: whether the backing data was complete,
/// and whether a server-side limit shaped it.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheNode {
    node: Node,
    fully_initialized: bool,
    filtered: bool,
}

impl CacheNode {
    pub fn new(node: Node, fully_initialized: bool, filtered: bool) -> Self {
        Self {
            node,
            fully_initialized,
            filtered,
        }
    }

    pub fn empty() -> Self {
        Self::new(Node::empty(), false, false)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// Whether this cache can answer for `path` completely.
    pub fn is_complete_for_path(&self, path: &Path) -> bool {
        if !self.fully_initialized {
            return false;
        }
        match path.front() {
            None => !self.filtered,
            Some(front) => !self.filtered || self.node.has_child(front),
        }
    }
}

/// The pair of caches a view maintains: what the user sees (server data with
/// pending writes layered on) and the authoritative server snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewCache {
    event_cache: CacheNode,
    server_cache: CacheNode,
}

impl ViewCache {
    pub fn new(event_cache: CacheNode, server_cache: CacheNode) -> Self {
        Self {
            event_cache,
            server_cache,
        }
    }

    pub fn event_cache(&self) -> &CacheNode {
        &self.event_cache
    }

    pub fn server_cache(&self) -> &CacheNode {
        &self.server_cache
    }

    pub fn complete_event_snap(&self) -> Option<&Node> {
        if self.event_cache.is_fully_initialized() {
            Some(self.event_cache.node())
        } else {
            None
        }
    }

    pub fn complete_server_snap(&self) -> Option<&Node> {
        if self.server_cache.is_fully_initialized() {
            Some(self.server_cache.node())
        } else {
            None
        }
    }
}
