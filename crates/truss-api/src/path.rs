// ── Path helpers ──
//
// Paths are `/`-separated sequences of escaped keys. The root is `/`.
// Values follow the store's model: `null` means absent, and containers
// that become empty cease to exist.

use serde_json::{Map, Value};

use crate::escape::{escape_key, unescape_key};

/// The root path.
pub const ROOT: &str = "/";

/// Split a path into its (still escaped) segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Normalize a path: leading slash, no trailing or duplicate slashes.
pub fn normalize(path: &str) -> String {
    let joined: Vec<&str> = segments(path).collect();
    if joined.is_empty() {
        ROOT.to_owned()
    } else {
        format!("/{}", joined.join("/"))
    }
}

/// Join an already escaped child key onto a path.
pub fn join(parent: &str, key: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{key}")
    } else {
        format!("{parent}/{key}")
    }
}

/// Join a raw (unescaped) key onto a path.
pub fn join_raw(parent: &str, raw_key: &str) -> String {
    join(parent, &escape_key(raw_key))
}

/// Parent path, or `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    let mut segs: Vec<&str> = segments(path).collect();
    segs.pop()?;
    if segs.is_empty() {
        Some(ROOT.to_owned())
    } else {
        Some(format!("/{}", segs.join("/")))
    }
}

/// Last segment of a path, or `None` for the root.
pub fn last_key(path: &str) -> Option<&str> {
    segments(path).last()
}

/// Returns `true` if `ancestor` equals `path` or contains it.
pub fn contains(ancestor: &str, path: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Returns `true` if one path contains the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    contains(a, b) || contains(b, a)
}

/// Path of `path` relative to `base`, or `None` if `base` does not contain it.
pub fn relative<'a>(base: &str, path: &'a str) -> Option<&'a str> {
    if !contains(base, path) {
        return None;
    }
    if base == ROOT {
        return Some(path.trim_start_matches('/'));
    }
    Some(path[base.len()..].trim_start_matches('/'))
}

/// Borrow the value at `path` inside `root`, if present. Segments are
/// unescaped before they are looked up.
pub fn value_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for seg in segments(path) {
        current = match current {
            Value::Object(map) => map.get(&unescape_key(seg))?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// Clone the value at `path`, `null` when absent.
pub fn get(root: &Value, path: &str) -> Value {
    value_at(root, path).cloned().unwrap_or(Value::Null)
}

/// Replace the value at `path`, creating intermediate objects and pruning
/// containers left empty by a `null` write.
pub fn set(root: &mut Value, path: &str, value: Value) {
    let segs: Vec<&str> = segments(path).collect();
    set_segments(root, &segs, prune(value));
}

fn set_segments(node: &mut Value, segs: &[&str], value: Value) {
    let Some((first, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    if value.is_null() && !node.is_object() && !node.is_array() {
        return;
    }
    if let Value::Array(items) = node {
        *node = Value::Object(array_to_map(std::mem::take(items)));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else { return };
    let key = unescape_key(first);
    let child = map.entry(key.clone()).or_insert(Value::Null);
    set_segments(child, rest, value);
    if child.is_null() {
        map.remove(&key);
    }
    if map.is_empty() {
        *node = Value::Null;
    }
}

/// Drop nulls and empty containers from a value, the way the store would
/// persist it.
pub fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() { Value::Null } else { Value::Object(pruned) }
        }
        Value::Array(items) => {
            let pruned: Vec<Value> = items.into_iter().map(prune).collect();
            if pruned.iter().all(Value::is_null) {
                Value::Null
            } else {
                Value::Array(pruned)
            }
        }
        other => other,
    }
}

/// View an array as an index-keyed object.
pub fn array_to_map(items: Vec<Value>) -> Map<String, Value> {
    items
        .into_iter()
        .enumerate()
        .filter(|(_, v)| !v.is_null())
        .map(|(i, v)| (i.to_string(), v))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn joins_and_splits() {
        assert_eq!(join(ROOT, "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join_raw("/a", "x/y"), "/a/x\\2fy");
        assert_eq!(parent("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent("/a").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(last_key("/a/b"), Some("b"));
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn containment_respects_segment_boundaries() {
        assert!(contains("/a", "/a/b"));
        assert!(contains("/a", "/a"));
        assert!(!contains("/a", "/ab"));
        assert!(contains(ROOT, "/anything"));
        assert!(overlaps("/a/b", "/a"));
        assert_eq!(relative("/a", "/a/b/c"), Some("b/c"));
        assert_eq!(relative(ROOT, "/a"), Some("a"));
        assert_eq!(relative("/a", "/b"), None);
    }

    #[test]
    fn set_creates_and_prunes() {
        let mut root = Value::Null;
        set(&mut root, "/a/b", json!(1));
        assert_eq!(root, json!({"a": {"b": 1}}));
        set(&mut root, "/a/c", json!({"d": null}));
        assert_eq!(root, json!({"a": {"b": 1}}));
        set(&mut root, "/a/b", Value::Null);
        assert_eq!(root, Value::Null);
    }

    #[test]
    fn escaped_segments_address_raw_keys() {
        let mut root = json!({"a/b": {"c.d": 1}});
        assert_eq!(get(&root, "/a\\2fb/c\\2ed"), json!(1));
        assert_eq!(get(&root, "/a/b"), Value::Null);
        set(&mut root, "/a\\2fb/e\\5c", json!(2));
        assert_eq!(root, json!({"a/b": {"c.d": 1, "e\\": 2}}));
    }

    #[test]
    fn get_reads_arrays_by_index() {
        let root = json!({"list": ["x", "y"]});
        assert_eq!(get(&root, "/list/1"), json!("y"));
        assert_eq!(get(&root, "/list/5"), Value::Null);
        assert_eq!(get(&root, "/"), root);
    }
}
