//! The persistent JSON tree held by caches and views.
//!
//! A `Node` is either a leaf carrying a primitive plus an optional priority,
//! or a children node holding a sorted map from child key to `Node`. The empty
//! children node stands in for "no data".

mod index;

pub use index::{compare_index_values, Index};

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use base64::engine::general_purpose::STANDARD;
use base64::engine::Engine as _;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::path::Path;

/// A child name with the realtime-database ordering: keys that parse as
/// canonical 32-bit integers sort numerically before every string key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChildKey(String);

impl ChildKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChildKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChildKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ChildKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_child_keys(&self.0, &other.0)
    }
}

/// Canonical 32-bit integer interpretation of a key, when it has one.
fn parse_int_key(key: &str) -> Option<i64> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let value: i64 = key.parse().ok()?;
    if (-2147483648..=2147483647).contains(&value) {
        Some(value)
    } else {
        None
    }
}

pub fn compare_child_keys(a: &str, b: &str) -> Ordering {
    match (parse_int_key(a), parse_int_key(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ChildrenNode {
    children: BTreeMap<ChildKey, Node>,
    priority: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
    value: Value,
    priority: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Children(ChildrenNode),
}

impl Default for Node {
    fn default() -> Self {
        Node::empty()
    }
}

impl Node {
    /// The empty children node.
    pub fn empty() -> Self {
        Node::Children(ChildrenNode::default())
    }

    pub fn leaf(value: Value) -> Self {
        Node::Leaf(LeafNode {
            value,
            priority: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Children(children) if children.children.is_empty())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn priority(&self) -> Option<&Value> {
        match self {
            Node::Leaf(leaf) => leaf.priority.as_ref(),
            Node::Children(children) => children.priority.as_ref(),
        }
    }

    pub fn with_priority(mut self, priority: Option<Value>) -> Self {
        match &mut self {
            Node::Leaf(leaf) => leaf.priority = priority,
            Node::Children(children) => {
                if !children.children.is_empty() {
                    children.priority = priority;
                }
            }
        }
        self
    }

    pub fn leaf_value(&self) -> Option<&Value> {
        match self {
            Node::Leaf(leaf) => Some(&leaf.value),
            Node::Children(_) => None,
        }
    }

    pub fn num_children(&self) -> usize {
        match self {
            Node::Leaf(_) => 0,
            Node::Children(children) => children.children.len(),
        }
    }

    /// Iterates children in key order. Leaves have no children.
    pub fn children(&self) -> impl Iterator<Item = (&ChildKey, &Node)> {
        match self {
            Node::Leaf(_) => None,
            Node::Children(children) => Some(children.children.iter()),
        }
        .into_iter()
        .flatten()
    }

    pub fn has_child(&self, key: &str) -> bool {
        match self {
            Node::Leaf(_) => false,
            Node::Children(children) => children.children.contains_key(&ChildKey::from(key)),
        }
    }

    /// The named child, or the empty node when absent (leaves have no children).
    pub fn get_immediate_child(&self, key: &str) -> Node {
        match self {
            Node::Leaf(_) => Node::empty(),
            Node::Children(children) => children
                .children
                .get(&ChildKey::from(key))
                .cloned()
                .unwrap_or_else(Node::empty),
        }
    }

    pub fn get_child(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for segment in path.iter() {
            current = current.get_immediate_child(segment);
        }
        current
    }

    /// Returns a copy with the named child replaced. Writing an empty node
    /// removes the child; writing a real child into a leaf discards the leaf
    /// value, while removing a child a leaf never had keeps the leaf.
    pub fn update_immediate_child(&self, key: &str, child: Node) -> Node {
        if self.is_leaf() && child.is_empty() {
            return self.clone();
        }
        let mut children = match self {
            Node::Children(existing) => existing.clone(),
            Node::Leaf(_) => ChildrenNode::default(),
        };
        if child.is_empty() {
            children.children.remove(&ChildKey::from(key));
        } else {
            children.children.insert(ChildKey::from(key), child);
        }
        if children.children.is_empty() {
            children.priority = None;
        }
        Node::Children(children)
    }

    pub fn update_child(&self, path: &Path, value: Node) -> Node {
        match path.front() {
            None => value,
            Some(front) => {
                let updated = self
                    .get_immediate_child(front)
                    .update_child(&path.pop_front(), value);
                self.update_immediate_child(front, updated)
            }
        }
    }

    /// Parses the realtime-database JSON wire form, including the exported
    /// `.value` / `.priority` wrapper shape. `null` becomes the empty node.
    pub fn from_json(json: &Value) -> Node {
        match json {
            Value::Null => Node::empty(),
            Value::Bool(_) | Value::Number(_) | Value::String(_) => Node::leaf(json.clone()),
            Value::Array(items) => {
                let mut children = ChildrenNode::default();
                for (i, item) in items.iter().enumerate() {
                    let child = Node::from_json(item);
                    if !child.is_empty() {
                        children.children.insert(ChildKey::new(i.to_string()), child);
                    }
                }
                Node::Children(children)
            }
            Value::Object(map) => {
                if map.contains_key(".sv") {
                    // Deferred server value placeholder; kept opaque until
                    // resolution.
                    return Node::leaf(json.clone());
                }
                let priority = map.get(".priority").filter(|p| !p.is_null()).cloned();
                if let Some(value) = map.get(".value") {
                    if !value.is_null() {
                        return Node::from_json(value).with_priority(priority);
                    }
                    return Node::empty();
                }
                let mut children = ChildrenNode::default();
                for (key, value) in map {
                    if key.starts_with('.') {
                        continue;
                    }
                    let child = Node::from_json(value);
                    if !child.is_empty() {
                        children.children.insert(ChildKey::new(key.clone()), child);
                    }
                }
                Node::Children(children).with_priority(priority)
            }
        }
    }

    /// Plain JSON rendering; priorities are dropped. The empty node is `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Leaf(leaf) => leaf.value.clone(),
            Node::Children(children) => {
                if children.children.is_empty() {
                    Value::Null
                } else {
                    let mut map = Map::new();
                    for (key, child) in &children.children {
                        map.insert(key.as_str().to_string(), child.to_json());
                    }
                    Value::Object(map)
                }
            }
        }
    }

    /// Priority-preserving JSON rendering (the `format=export` shape).
    pub fn export_json(&self) -> Value {
        match self {
            Node::Leaf(leaf) => match &leaf.priority {
                None => leaf.value.clone(),
                Some(priority) => {
                    let mut map = Map::new();
                    map.insert(".value".to_string(), leaf.value.clone());
                    map.insert(".priority".to_string(), priority.clone());
                    Value::Object(map)
                }
            },
            Node::Children(children) => {
                if children.children.is_empty() {
                    return Value::Null;
                }
                let mut map = Map::new();
                if let Some(priority) = &children.priority {
                    map.insert(".priority".to_string(), priority.clone());
                }
                for (key, child) in &children.children {
                    map.insert(key.as_str().to_string(), child.export_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Content hash used for listen revalidation: base64 of the sha1 digest of
    /// the canonical representation. The empty node hashes to the empty string.
    pub fn hash(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut hasher = Sha1::new();
        hasher.update(self.hash_repr().as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    fn hash_repr(&self) -> String {
        let mut repr = String::new();
        if let Some(priority) = self.priority() {
            repr.push_str("priority:");
            repr.push_str(&value_hash_repr(priority));
            repr.push(':');
        }
        match self {
            Node::Leaf(leaf) => repr.push_str(&value_hash_repr(&leaf.value)),
            Node::Children(_) => {
                for (key, child) in Index::Priority.sort_children(self) {
                    if !child.is_empty() {
                        repr.push(':');
                        repr.push_str(key.as_str());
                        repr.push(':');
                        repr.push_str(&child.hash());
                    }
                }
            }
        }
        repr
    }
}

fn value_hash_repr(value: &Value) -> String {
    match value {
        Value::Bool(b) => format!("boolean:{b}"),
        Value::Number(n) => {
            let double = n.as_f64().unwrap_or(0.0);
            format!("number:{:016x}", double.to_bits())
        }
        Value::String(s) => format!("string:{s}"),
        other => format!("json:{other}"),
    }
}
