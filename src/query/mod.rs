//! Query parameters and the deterministic identifiers used to key views,
//! listens, and tracked queries.

use serde_json::{json, Map, Value};
use std::cmp::Ordering;

use crate::error::{invalid_argument, DatabaseResult};
use crate::path::Path;
use crate::snapshot::{ChildKey, Index, Node};

/// Identifier reserved for the parameterless query at a path.
pub const DEFAULT_IDENTIFIER: &str = "default";

#[derive(Clone, Debug, PartialEq)]
pub struct QueryBound {
    pub value: Value,
    pub name: Option<String>,
    pub inclusive: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryLimit {
    First(u32),
    Last(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryParams {
    pub index: Index,
    pub start: Option<QueryBound>,
    pub end: Option<QueryBound>,
    pub limit: Option<QueryLimit>,
    order_by_called: bool,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            index: Index::Priority,
            start: None,
            end: None,
            limit: None,
            order_by_called: false,
        }
    }
}

impl QueryParams {
    pub fn set_index(&mut self, index: Index) -> DatabaseResult<()> {
        if self.order_by_called {
            return Err(invalid_argument("orderBy has already been specified"));
        }
        self.index = index;
        self.order_by_called = true;
        Ok(())
    }

    pub fn set_start(&mut self, bound: QueryBound) -> DatabaseResult<()> {
        if self.start.is_some() {
            return Err(invalid_argument(
                "startAt/startAfter has already been specified",
            ));
        }
        self.start = Some(bound);
        Ok(())
    }

    pub fn set_end(&mut self, bound: QueryBound) -> DatabaseResult<()> {
        if self.end.is_some() {
            return Err(invalid_argument(
                "endAt/endBefore has already been specified",
            ));
        }
        self.end = Some(bound);
        Ok(())
    }

    pub fn set_limit(&mut self, limit: QueryLimit) -> DatabaseResult<()> {
        if self.limit.is_some() {
            return Err(invalid_argument("limit has already been specified"));
        }
        self.limit = Some(limit);
        Ok(())
    }

    /// True when no parameter was supplied at all.
    pub fn is_default(&self) -> bool {
        !self.order_by_called && self.loads_all_data()
    }

    /// True when the parameters select the whole node at the path (an
    /// ordering alone does not restrict the data).
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    /// True when applying these parameters can drop children.
    pub fn filters_nodes(&self) -> bool {
        !self.loads_all_data()
    }

    /// True when a limit can slide children in and out of the result window.
    pub fn is_limited(&self) -> bool {
        self.limit.is_some()
    }

    /// Deterministic fingerprint of the parameters. `"default"` is reserved
    /// for the parameterless query.
    pub fn identifier(&self) -> String {
        if self.is_default() {
            return DEFAULT_IDENTIFIER.to_string();
        }
        self.query_pairs()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();

        let order_by = match &self.index {
            Index::Priority => "$priority".to_string(),
            Index::Key => "$key".to_string(),
            Index::Value => "$value".to_string(),
            Index::Child(child) => child.segments().join("/"),
        };
        pairs.push(("orderBy".to_string(), order_by));

        if let Some(bound) = &self.start {
            let key = if bound.inclusive {
                "startAt"
            } else {
                "startAfter"
            };
            pairs.push((key.to_string(), encode_bound(bound)));
        }

        if let Some(bound) = &self.end {
            let key = if bound.inclusive { "endAt" } else { "endBefore" };
            pairs.push((key.to_string(), encode_bound(bound)));
        }

        match &self.limit {
            Some(QueryLimit::First(count)) => {
                pairs.push(("limitToFirst".to_string(), count.to_string()));
            }
            Some(QueryLimit::Last(count)) => {
                pairs.push(("limitToLast".to_string(), count.to_string()));
            }
            None => {}
        }

        pairs
    }

    /// Applies ordering, bounds, and limit to the children of `node`. Leaves
    /// pass through untouched; bounds and limits only act on children.
    pub fn filter_node(&self, node: &Node) -> Node {
        if self.loads_all_data() || node.is_leaf() || node.is_empty() {
            return node.clone();
        }

        let mut retained: Vec<(&ChildKey, &Node)> = self
            .index
            .sort_children(node)
            .into_iter()
            .filter(|child| self.bounds_admit(*child))
            .collect();

        match &self.limit {
            Some(QueryLimit::First(count)) => retained.truncate(*count as usize),
            Some(QueryLimit::Last(count)) => {
                let count = *count as usize;
                if retained.len() > count {
                    retained.drain(..retained.len() - count);
                }
            }
            None => {}
        }

        let mut filtered = Node::empty();
        for (key, child) in retained {
            filtered = filtered.update_immediate_child(key.as_str(), child.clone());
        }
        filtered
    }

    fn bounds_admit(&self, child: (&ChildKey, &Node)) -> bool {
        if let Some(start) = &self.start {
            let cmp = self
                .index
                .compare_bound(&start.value, start.name.as_deref(), child);
            let admitted = if start.inclusive {
                cmp != Ordering::Greater
            } else {
                cmp == Ordering::Less
            };
            if !admitted {
                return false;
            }
        }
        if let Some(end) = &self.end {
            let cmp = self
                .index
                .compare_bound(&end.value, end.name.as_deref(), child);
            let admitted = if end.inclusive {
                cmp != Ordering::Less
            } else {
                cmp == Ordering::Greater
            };
            if !admitted {
                return false;
            }
        }
        true
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in self.query_pairs() {
            map.insert(key, Value::String(value));
        }
        if !self.order_by_called {
            map.remove("orderBy");
        }
        Value::Object(map)
    }

    pub fn from_json(json: &Value) -> Self {
        let mut params = QueryParams::default();
        let Some(map) = json.as_object() else {
            return params;
        };
        if let Some(Value::String(order_by)) = map.get("orderBy") {
            let index = match order_by.as_str() {
                "$priority" => Index::Priority,
                "$key" => Index::Key,
                "$value" => Index::Value,
                child => Index::Child(Path::parse(child).unwrap_or_else(|_| Path::root())),
            };
            let _ = params.set_index(index);
        }
        for (key, inclusive) in [("startAt", true), ("startAfter", false)] {
            if let Some(Value::String(encoded)) = map.get(key) {
                let _ = params.set_start(decode_bound(encoded, inclusive));
            }
        }
        for (key, inclusive) in [("endAt", true), ("endBefore", false)] {
            if let Some(Value::String(encoded)) = map.get(key) {
                let _ = params.set_end(decode_bound(encoded, inclusive));
            }
        }
        if let Some(Value::String(count)) = map.get("limitToFirst") {
            if let Ok(count) = count.parse() {
                let _ = params.set_limit(QueryLimit::First(count));
            }
        }
        if let Some(Value::String(count)) = map.get("limitToLast") {
            if let Ok(count) = count.parse() {
                let _ = params.set_limit(QueryLimit::Last(count));
            }
        }
        params
    }
}

fn encode_bound(bound: &QueryBound) -> String {
    let mut encoded = bound.value.to_string();
    if let Some(name) = &bound.name {
        encoded.push(',');
        encoded.push_str(&Value::String(name.clone()).to_string());
    }
    encoded
}

fn decode_bound(encoded: &str, inclusive: bool) -> QueryBound {
    let (value_part, name) = match encoded.rsplit_once(",\"") {
        Some((value, name_tail)) => {
            let name = name_tail.trim_end_matches('"').to_string();
            (value, Some(name))
        }
        None => (encoded, None),
    };
    let value = serde_json::from_str(value_part).unwrap_or(Value::Null);
    QueryBound {
        value,
        name,
        inclusive,
    }
}

/// A `(path, parameters)` pair. Two specs with equal path and identifier are
/// interchangeable.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    pub path: Path,
    pub params: QueryParams,
}

impl QuerySpec {
    pub fn new(path: Path, params: QueryParams) -> Self {
        Self { path, params }
    }

    pub fn default_at(path: Path) -> Self {
        Self {
            path,
            params: QueryParams::default(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    pub fn identifier(&self) -> String {
        self.params.identifier()
    }

    /// Key identifying this query across the tag maps and tracked-query
    /// records: `path + "$" + identifier`.
    pub fn query_key(&self) -> String {
        format!("{}${}", self.path.slash_string(), self.identifier())
    }

    /// The query actually sent to the backend: a non-default query that loads
    /// all data listens as the default query at its path.
    pub fn for_listening(&self) -> QuerySpec {
        if self.loads_all_data() && !self.is_default() {
            QuerySpec::default_at(self.path.clone())
        } else {
            self.clone()
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "path": self.path.slash_string(),
            "params": self.params.to_json(),
        })
    }

    pub fn from_json(json: &Value) -> Self {
        let path = json
            .get("path")
            .and_then(Value::as_str)
            .and_then(|raw| Path::parse(raw).ok())
            .unwrap_or_else(Path::root);
        let params = json
            .get("params")
            .map(QueryParams::from_json)
            .unwrap_or_default();
        Self { path, params }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limit_to_first(count: u32) -> QueryParams {
        let mut params = QueryParams::default();
        params.set_limit(QueryLimit::First(count)).unwrap();
        params
    }

    #[test]
    fn default_params_have_reserved_identifier() {
        assert_eq!(QueryParams::default().identifier(), DEFAULT_IDENTIFIER);
        assert!(QueryParams::default().loads_all_data());
    }

    #[test]
    fn identifier_is_deterministic() {
        let mut a = QueryParams::default();
        a.set_index(Index::Value).unwrap();
        a.set_limit(QueryLimit::Last(5)).unwrap();
        let mut b = QueryParams::default();
        b.set_index(Index::Value).unwrap();
        b.set_limit(QueryLimit::Last(5)).unwrap();
        assert_eq!(a.identifier(), b.identifier());
        assert_ne!(a.identifier(), limit_to_first(5).identifier());
    }

    #[test]
    fn ordered_query_without_bounds_loads_all_data() {
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        assert!(params.loads_all_data());
        assert!(!params.is_default());
    }

    #[test]
    fn duplicate_constraints_are_rejected() {
        let mut params = limit_to_first(2);
        assert!(params.set_limit(QueryLimit::Last(3)).is_err());
        params.set_index(Index::Key).unwrap();
        assert!(params.set_index(Index::Value).is_err());
    }

    #[test]
    fn filter_applies_limit_to_first() {
        let node = Node::from_json(&json!({ "a": 1, "b": 2, "c": 3 }));
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        params.set_limit(QueryLimit::First(2)).unwrap();
        assert_eq!(params.filter_node(&node).to_json(), json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn filter_applies_bounds_over_value_index() {
        let node = Node::from_json(&json!({ "a": 10, "b": 20, "c": 30, "d": 40 }));
        let mut params = QueryParams::default();
        params.set_index(Index::Value).unwrap();
        params
            .set_start(QueryBound {
                value: json!(20),
                name: None,
                inclusive: true,
            })
            .unwrap();
        params
            .set_end(QueryBound {
                value: json!(30),
                name: None,
                inclusive: false,
            })
            .unwrap();
        assert_eq!(params.filter_node(&node).to_json(), json!({ "b": 20 }));
    }

    #[test]
    fn filter_limit_to_last_keeps_tail() {
        let node = Node::from_json(&json!({ "a": 1, "b": 2, "c": 3 }));
        let mut params = QueryParams::default();
        params.set_index(Index::Key).unwrap();
        params.set_limit(QueryLimit::Last(2)).unwrap();
        assert_eq!(params.filter_node(&node).to_json(), json!({ "b": 2, "c": 3 }));
    }

    #[test]
    fn params_json_round_trip() {
        let mut params = QueryParams::default();
        params.set_index(Index::Child(Path::parse("score").unwrap())).unwrap();
        params
            .set_start(QueryBound {
                value: json!(10),
                name: Some("k1".into()),
                inclusive: true,
            })
            .unwrap();
        params.set_limit(QueryLimit::Last(3)).unwrap();
        let decoded = QueryParams::from_json(&params.to_json());
        assert_eq!(decoded.identifier(), params.identifier());
    }

    #[test]
    fn promoted_listen_query_is_default() {
        let mut params = QueryParams::default();
        params.set_index(Index::Value).unwrap();
        let spec = QuerySpec::new(Path::parse("scores").unwrap(), params);
        assert!(!spec.is_default());
        assert!(spec.for_listening().is_default());
        assert_eq!(spec.for_listening().path, spec.path);
    }

    #[test]
    fn query_key_combines_path_and_identifier() {
        let spec = QuerySpec::default_at(Path::parse("a/b").unwrap());
        assert_eq!(spec.query_key(), "/a/b$default");
    }
}
