//! Deferred server values (`{".sv": …}` placeholders) and their resolution
//! against the data they land on.

use chrono::Utc;
use serde_json::{json, Value};

use crate::snapshot::Node;

/// Placeholder replaced by the server's arrival time, in epoch milliseconds.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Placeholder atomically adding `delta` to the current value.
pub fn increment(delta: f64) -> Value {
    json!({
        ".sv": {
            "increment": delta,
        }
    })
}

pub fn is_deferred_value(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key(".sv"))
}

fn resolve_value(value: &Value, existing: Option<&Value>) -> Value {
    let Some(sv) = value.as_object().and_then(|map| map.get(".sv")) else {
        return value.clone();
    };
    match sv {
        Value::String(name) if name == "timestamp" => json!(Utc::now().timestamp_millis()),
        Value::Object(op) => match op.get("increment").and_then(Value::as_f64) {
            Some(delta) => {
                let base = existing.and_then(Value::as_f64).unwrap_or(0.0);
                json!(base + delta)
            }
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

/// Replaces every deferred-value leaf in `node`, resolving increments against
/// the corresponding location of `existing`.
pub fn resolve_deferred_node(node: &Node, existing: Option<&Node>) -> Node {
    if let Some(value) = node.leaf_value() {
        if is_deferred_value(value) {
            let existing_value = existing.and_then(|node| node.leaf_value());
            return Node::leaf(resolve_value(value, existing_value));
        }
        return node.clone();
    }
    let mut resolved = node.clone();
    for (key, child) in node.children() {
        let existing_child = existing.map(|node| node.get_immediate_child(key.as_str()));
        resolved = resolved.update_immediate_child(
            key.as_str(),
            resolve_deferred_node(child, existing_child.as_ref()),
        );
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_placeholder_resolves_to_millis() {
        let node = Node::from_json(&server_timestamp());
        assert!(node.is_leaf());
        let resolved = resolve_deferred_node(&node, None);
        assert!(resolved.leaf_value().unwrap().as_i64().unwrap() > 1_500_000_000_000);
    }

    #[test]
    fn increment_resolves_against_existing_value() {
        let node = Node::from_json(&increment(5.0));
        let existing = Node::leaf(json!(37));
        let resolved = resolve_deferred_node(&node, Some(&existing));
        assert_eq!(resolved.leaf_value(), Some(&json!(42.0)));
        // No base value means the increment starts from zero.
        let from_zero = resolve_deferred_node(&node, None);
        assert_eq!(from_zero.leaf_value(), Some(&json!(5.0)));
    }

    #[test]
    fn nested_placeholders_resolve_in_place() {
        let node = Node::from_json(&json!({
            "plain": 1,
            "stamp": server_timestamp(),
        }));
        let resolved = resolve_deferred_node(&node, None);
        assert_eq!(
            resolved.get_immediate_child("plain").to_json(),
            json!(1)
        );
        assert!(resolved
            .get_immediate_child("stamp")
            .leaf_value()
            .unwrap()
            .is_number());
    }
}
