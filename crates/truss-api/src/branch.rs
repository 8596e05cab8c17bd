//! Structural differ used by sync-mode listeners.
//!
//! A [`Branch`] remembers the last value it saw under every path it was
//! asked to diff. Given a new value for a path, [`Branch::diff`] returns the
//! minimal set of `path → value` writes that turn the remembered value into
//! the new one, then remembers the new value.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::path;

/// Set of absolute-path writes; `null` deletes.
pub type Updates = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct Branch {
    root: Value,
}

impl Branch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The remembered value at `path`, `null` when absent.
    pub fn get(&self, at: &str) -> Value {
        path::get(&self.root, at)
    }

    /// Diff `value` against the remembered value at `at` and remember it.
    ///
    /// Diffing the same value twice yields an empty update set the second
    /// time.
    pub fn diff(&mut self, value: &Value, at: &str) -> Updates {
        let at = path::normalize(at);
        let next = path::prune(value.clone());
        let previous = self.get(&at);

        let mut updates = Updates::new();
        diff_into(&previous, &next, &at, &mut updates);
        path::set(&mut self.root, &at, next);
        updates
    }

    /// Forget everything remembered under `at`.
    pub fn clear(&mut self, at: &str) {
        path::set(&mut self.root, at, Value::Null);
    }
}

fn as_children(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::Array(items) => Some(path::array_to_map(items.clone())),
        _ => None,
    }
}

fn diff_into(old: &Value, new: &Value, at: &str, out: &mut Updates) {
    if old == new {
        return;
    }
    // Both containers: recurse into children, deleting the ones that vanished.
    if let (Some(old_children), Some(new_children)) = (as_children(old), as_children(new)) {
        for (key, new_child) in &new_children {
            let old_child = old_children.get(key).unwrap_or(&Value::Null);
            diff_into(old_child, new_child, &path::join_raw(at, key), out);
        }
        for key in old_children.keys().filter(|k| !new_children.contains_key(*k)) {
            out.insert(path::join_raw(at, key), Value::Null);
        }
        return;
    }
    out.insert(at.to_owned(), new.clone());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn updates(pairs: &[(&str, Value)]) -> Updates {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    #[test]
    fn first_diff_replaces_whole_value() {
        let mut branch = Branch::new();
        let value = json!({"a": 1, "b": {"c": 2}});
        assert_eq!(branch.diff(&value, "/root"), updates(&[("/root", value.clone())]));
        assert_eq!(branch.get("/root"), value);
    }

    #[test]
    fn identical_diff_is_empty() {
        let mut branch = Branch::new();
        let value = json!({"a": {"b": [1, 2, 3]}});
        branch.diff(&value, "/x");
        assert!(branch.diff(&value, "/x").is_empty());
    }

    #[test]
    fn only_changed_leaves_are_emitted() {
        let mut branch = Branch::new();
        branch.diff(&json!({"a": 1, "b": {"c": 2, "d": 3}}), "/");
        let changes = branch.diff(&json!({"a": 1, "b": {"c": 5, "d": 3}, "e": true}), "/");
        assert_eq!(changes, updates(&[("/b/c", json!(5)), ("/e", json!(true))]));
    }

    #[test]
    fn removed_keys_become_null() {
        let mut branch = Branch::new();
        branch.diff(&json!({"a": 1, "b": 2}), "/p");
        let changes = branch.diff(&json!({"a": 1}), "/p");
        assert_eq!(changes, updates(&[("/p/b", Value::Null)]));
    }

    #[test]
    fn kind_change_replaces_subtree() {
        let mut branch = Branch::new();
        branch.diff(&json!({"a": {"x": 1}}), "/");
        let changes = branch.diff(&json!({"a": "flat"}), "/");
        assert_eq!(changes, updates(&[("/a", json!("flat"))]));
    }

    #[test]
    fn deleting_an_object_emits_single_null() {
        let mut branch = Branch::new();
        branch.diff(&json!({"a": 1, "b": 2}), "/p");
        assert_eq!(branch.diff(&Value::Null, "/p"), updates(&[("/p", Value::Null)]));
        assert_eq!(branch.get("/p"), Value::Null);
    }

    #[test]
    fn nulls_in_new_value_are_pruned_before_diffing() {
        let mut branch = Branch::new();
        branch.diff(&json!({"a": 1}), "/");
        assert!(branch.diff(&json!({"a": 1, "gone": null}), "/").is_empty());
    }

    #[test]
    fn reserved_characters_in_keys_are_escaped_in_paths() {
        let mut branch = Branch::new();
        branch.diff(&json!({"a/b": 1, "c.d": {"e": 1}}), "/x");
        let changes = branch.diff(&json!({"a/b": 2, "c.d": {"e": 2}}), "/x");
        assert_eq!(
            changes,
            updates(&[("/x/a\\2fb", json!(2)), ("/x/c\\2ed/e", json!(2))])
        );
        assert_eq!(branch.get("/x/a\\2fb"), json!(2));
    }
}
