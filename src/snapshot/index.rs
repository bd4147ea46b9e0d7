use std::cmp::Ordering;

use serde_json::Value;

use crate::path::Path;
use crate::snapshot::{compare_child_keys, ChildKey, Node};

/// The ordering a query imposes on the children of a location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Index {
    Priority,
    Key,
    Value,
    Child(Path),
}

impl Index {
    /// The value this index extracts from a child for ordering purposes.
    pub fn extract(&self, key: &ChildKey, node: &Node) -> Value {
        match self {
            Index::Priority => node.priority().cloned().unwrap_or(Value::Null),
            Index::Key => Value::String(key.as_str().to_string()),
            Index::Value => node.to_json(),
            Index::Child(path) => node.get_child(path).to_json(),
        }
    }

    pub fn compare(&self, a: (&ChildKey, &Node), b: (&ChildKey, &Node)) -> Ordering {
        match self {
            Index::Key => a.0.cmp(b.0),
            _ => compare_index_values(&self.extract(a.0, a.1), &self.extract(b.0, b.1))
                .then_with(|| a.0.cmp(b.0)),
        }
    }

    /// Compares a query bound `(value, optional key)` against a child. An
    /// absent bound key means "minimal key" so that an inclusive bound admits
    /// every child sharing the bound value.
    pub fn compare_bound(
        &self,
        bound_value: &Value,
        bound_key: Option<&str>,
        child: (&ChildKey, &Node),
    ) -> Ordering {
        let child_value = self.extract(child.0, child.1);
        match self {
            Index::Key => {
                let bound_key = match bound_value {
                    Value::String(s) => s.as_str(),
                    _ => bound_key.unwrap_or(""),
                };
                compare_child_keys(bound_key, child.0.as_str())
            }
            _ => compare_index_values(bound_value, &child_value).then_with(|| match bound_key {
                Some(key) => compare_child_keys(key, child.0.as_str()),
                None => Ordering::Less,
            }),
        }
    }

    /// Children of `node` sorted by this index.
    pub fn sort_children<'a>(&self, node: &'a Node) -> Vec<(&'a ChildKey, &'a Node)> {
        let mut children: Vec<(&ChildKey, &Node)> = node.children().collect();
        children.sort_by(|a, b| self.compare(*a, *b));
        children
    }
}

fn value_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) | Value::Object(_) => 5,
    }
}

/// Total order over leaf-ish JSON values:
/// `null < false < true < numbers < strings < objects`.
pub fn compare_index_values(a: &Value, b: &Value) -> Ordering {
    let rank = value_rank(a).cmp(&value_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn children_of(json: Value) -> Node {
        Node::from_json(&json)
    }

    #[test]
    fn value_index_orders_mixed_types() {
        let node = children_of(json!({
            "s": "zed",
            "n": 4,
            "t": true,
            "f": false,
        }));
        let sorted: Vec<&str> = Index::Value
            .sort_children(&node)
            .into_iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(sorted, vec!["f", "t", "n", "s"]);
    }

    #[test]
    fn child_index_orders_by_nested_value() {
        let node = children_of(json!({
            "a": { "score": 30 },
            "b": { "score": 10 },
            "c": { "score": 20 },
        }));
        let index = Index::Child(Path::parse("score").unwrap());
        let sorted: Vec<&str> = index
            .sort_children(&node)
            .into_iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(sorted, vec!["b", "c", "a"]);
    }

    #[test]
    fn missing_index_value_sorts_first_then_by_key() {
        let node = children_of(json!({
            "x": { "score": 1 },
            "b": { "other": true },
            "a": { "other": true },
        }));
        let index = Index::Child(Path::parse("score").unwrap());
        let sorted: Vec<&str> = index
            .sort_children(&node)
            .into_iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(sorted, vec!["a", "b", "x"]);
    }

    #[test]
    fn bound_comparison_respects_named_bounds() {
        let node = children_of(json!({ "a": 1, "b": 1, "c": 2 }));
        let children = Index::Value.sort_children(&node);
        // Bound (1, "b") sits after ("a", 1) and before ("b", 1).
        assert_eq!(
            Index::Value.compare_bound(&json!(1), Some("b"), children[0]),
            Ordering::Greater
        );
        assert_eq!(
            Index::Value.compare_bound(&json!(1), Some("b"), children[1]),
            Ordering::Equal
        );
        assert_eq!(
            Index::Value.compare_bound(&json!(1), Some("b"), children[2]),
            Ordering::Less
        );
    }
}
