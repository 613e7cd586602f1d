//! Structured state shared between auth checks and rate limit stages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Namespace under which authorization state is published to later stages.
pub const AUTHZ_NAMESPACE: &str = "envoy.filters.http.ext_authz";

/// Arbitrary structured key-value data emitted by checks and passthrough links.
pub type State = Map<String, Value>;

/// Overwrite or add every key of `source` into `target`.
pub fn merge_state(target: &mut State, source: &State) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

/// Render a metadata value as a descriptor value.
///
/// Only scalars have a stable textual form; lists and maps are rejected.
pub fn value_to_descriptor(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Per-request metadata, keyed by filter namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicMetadata {
    #[serde(flatten)]
    namespaces: BTreeMap<String, State>,
}

impl DynamicMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the state stored under a namespace.
    pub fn namespace(&self, namespace: &str) -> Option<&State> {
        self.namespaces.get(namespace)
    }

    /// Merge `state` into the given namespace, creating it if needed.
    pub fn merge(&mut self, namespace: &str, state: &State) {
        let entry = self.namespaces.entry(namespace.to_string()).or_default();
        merge_state(entry, state);
    }

    /// Insert a single value under a namespace.
    pub fn insert(&mut self, namespace: &str, key: impl Into<String>, value: Value) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn remove_namespace(&mut self, namespace: &str) -> Option<State> {
        self.namespaces.remove(namespace)
    }

    /// Resolve a value by namespace and a path of nested keys.
    pub fn lookup(&self, namespace: &str, path: &[String]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.namespace(namespace)?.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_path() {
        let mut metadata = DynamicMetadata::new();
        let state = json!({"user": {"id": "alice", "tier": 3}});
        metadata.merge(AUTHZ_NAMESPACE, state.as_object().unwrap());

        let path = vec!["user".to_string(), "id".to_string()];
        assert_eq!(metadata.lookup(AUTHZ_NAMESPACE, &path), Some(&json!("alice")));

        let missing = vec!["user".to_string(), "email".to_string()];
        assert_eq!(metadata.lookup(AUTHZ_NAMESPACE, &missing), None);
        assert_eq!(metadata.lookup("other", &path), None);
        assert_eq!(metadata.lookup(AUTHZ_NAMESPACE, &[]), None);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut target = json!({"a": 1, "b": 2}).as_object().unwrap().clone();
        let source = json!({"b": 3, "c": 4}).as_object().unwrap().clone();
        merge_state(&mut target, &source);
        assert_eq!(Value::Object(target), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_value_to_descriptor() {
        assert_eq!(value_to_descriptor(&json!("x")), Some("x".to_string()));
        assert_eq!(value_to_descriptor(&json!(9)), Some("9".to_string()));
        assert_eq!(value_to_descriptor(&json!(true)), Some("true".to_string()));
        assert_eq!(value_to_descriptor(&json!(["x"])), None);
        assert_eq!(value_to_descriptor(&Value::Null), None);
    }
}
