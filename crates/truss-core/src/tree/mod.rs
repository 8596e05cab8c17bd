// ── Reactive mirror ──
//
// The tree is an arena of nodes materialized from remote JSON. Remote data
// enters only through `plant`; local fields through `assign`; computed
// fields only through their own watcher. Each mutation collects the paths
// it changed, invalidates the watchers whose read logs overlap them and
// recomputes to a fixpoint.

mod computed;
mod mount;
mod stats;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use truss_api::{escape_key, path, unescape_key};

pub use computed::{ComputeScope, ComputedValue};
pub use mount::{ComputeFn, ComputedDescriptor, MountRule, TeardownFn};
pub use stats::{ComputedStats, PropertyStats};

use computed::{WatchKey, Watcher};
use mount::CompiledRule;

/// Recompute rounds allowed per mutation before giving up.
const MAX_RECOMPUTE_ROUNDS: usize = 64;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TreeError {
    #[error("Invalid mount template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("'{0}' is a reserved name")]
    ReservedName(String),

    #[error("Computed property {class}.{name} is declared twice")]
    DuplicateComputed { class: String, name: String },

    #[error("No node at {0}")]
    NotFound(String),

    #[error("{path} mirrors remote data and cannot be assigned")]
    RemoteField { path: String },

    #[error("Computed property {path} cannot be assigned")]
    ComputedField { path: String },

    #[error("Cannot plant a scalar at the root")]
    ScalarAtRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One field of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Scalar mirrored from the remote store.
    Remote(Value),
    /// Child node mirrored from the remote store.
    Child(NodeId),
    /// Value assigned locally, never sent to the store.
    Local(Value),
    Computed(ComputedValue),
}

impl Field {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Child(_))
    }
}

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    key: String,
    path: String,
    vars: BTreeMap<String, String>,
    class: Option<Arc<str>>,
    rule: Option<usize>,
    fields: IndexMap<String, Field>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Escaped key under the parent; empty for the root.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mounted class, `None` for bare nodes.
    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    fn children(&self) -> Vec<NodeId> {
        self.fields
            .values()
            .filter_map(|f| match f {
                Field::Child(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
    rules: Vec<CompiledRule>,
    watchers: BTreeMap<WatchKey, Watcher>,
    dirty: BTreeSet<WatchKey>,
    stats: Arc<ComputedStats>,
    version: watch::Sender<u64>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.nodes.len())
            .field("rules", &self.rules.len())
            .field("watchers", &self.watchers.len())
            .field("version", &*self.version.borrow())
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// Build an empty mirror. Rules are matched in declaration order.
    pub fn new(rules: Vec<MountRule>, stats: Arc<ComputedStats>) -> Result<Self, TreeError> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let (version, _) = watch::channel(0);
        let mut tree = Self {
            nodes: HashMap::new(),
            root: NodeId(0),
            next_id: 0,
            rules,
            watchers: BTreeMap::new(),
            dirty: BTreeSet::new(),
            stats,
            version,
        };
        let mut changed = Vec::new();
        tree.root = tree.create_node(None, String::new(), path::ROOT.to_owned());
        tree.plant_placeholders(tree.root, &mut changed);
        tree.after_mutation(&changed);
        Ok(tree)
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1 && self.nodes.get(&self.root).is_none_or(|n| n.fields.is_empty())
    }

    /// Node mounted at `path`, if any.
    pub fn node_at(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for seg in path::segments(path) {
            match self.nodes.get(&current)?.fields.get(seg)? {
                Field::Child(id) => current = *id,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Field at `path`, resolved through its parent node.
    pub fn field(&self, path: &str) -> Option<&Field> {
        let parent = path::parent(path)?;
        let key = path::last_key(path)?;
        let id = self.node_at(&parent)?;
        self.nodes.get(&id)?.fields.get(key)
    }

    pub fn computed(&self, node_path: &str, name: &str) -> Option<&ComputedValue> {
        match self.node_at(node_path).and_then(|id| self.nodes.get(&id)?.fields.get(name)) {
            Some(Field::Computed(value)) => Some(value),
            _ => None,
        }
    }

    /// JSON view of `path`, including local and computed fields.
    pub fn value(&self, path: &str) -> Value {
        if path::segments(path).next().is_none() {
            return self.node_json(self.root);
        }
        match self.field(path) {
            Some(field) => self.field_json(field),
            None => Value::Null,
        }
    }

    fn field_json(&self, field: &Field) -> Value {
        match field {
            Field::Remote(v) | Field::Local(v) => v.clone(),
            Field::Child(id) => self.node_json(*id),
            Field::Computed(c) => c.to_json(self),
        }
    }

    fn node_json(&self, id: NodeId) -> Value {
        let Some(node) = self.nodes.get(&id) else {
            return Value::Null;
        };
        let map: Map<String, Value> = node
            .fields
            .iter()
            .map(|(k, f)| (unescape_key(k), self.field_json(f)))
            .collect();
        Value::Object(map)
    }

    pub fn stats(&self) -> &Arc<ComputedStats> {
        &self.stats
    }

    /// Mutation counter.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Mirror a remote value at `path`. `null` removes whatever is there.
    pub fn plant(&mut self, path: &str, value: &Value) -> Result<(), TreeError> {
        let path = path::normalize(path);
        let mut changed = Vec::new();
        match (path::parent(&path), path::last_key(&path)) {
            (Some(parent), Some(key)) => {
                let parent_id = if value.is_null() {
                    match self.node_at(&parent) {
                        Some(id) => id,
                        None => return Ok(()),
                    }
                } else {
                    self.ensure_node(&parent, &mut changed)?
                };
                self.plant_field(parent_id, key, value, &mut changed);
            }
            _ => match value {
                Value::Null => self.plant_children(self.root, &Value::Object(Map::new()), &mut changed),
                Value::Object(_) | Value::Array(_) => self.plant_children(self.root, value, &mut changed),
                _ => return Err(TreeError::ScalarAtRoot),
            },
        }
        trace!(path = %path, changed = changed.len(), "planted");
        self.after_mutation(&changed);
        Ok(())
    }

    /// Assign a local field on the node at `node_path`. `name` is a raw key.
    pub fn assign(&mut self, node_path: &str, name: &str, value: Value) -> Result<(), TreeError> {
        if name.starts_with('$') {
            return Err(TreeError::ReservedName(name.to_owned()));
        }
        let node_path = path::normalize(node_path);
        let id = self
            .node_at(&node_path)
            .ok_or_else(|| TreeError::NotFound(node_path.clone()))?;
        let name = escape_key(name);
        let name = name.as_str();
        let field_path = path::join(&node_path, name);
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| TreeError::NotFound(node_path.clone()))?;
        match node.fields.get(name) {
            Some(f) if f.is_remote() => return Err(TreeError::RemoteField { path: field_path }),
            Some(Field::Computed(_)) => return Err(TreeError::ComputedField { path: field_path }),
            Some(Field::Local(current)) if *current == value => return Ok(()),
            _ => {}
        }
        node.fields.insert(name.to_owned(), Field::Local(value));
        self.after_mutation(&[field_path]);
        Ok(())
    }

    /// Walk to `path`, creating bare nodes where nothing remote exists yet.
    fn ensure_node(&mut self, path: &str, changed: &mut Vec<String>) -> Result<NodeId, TreeError> {
        let mut current = self.root;
        let mut current_path = path::ROOT.to_owned();
        for seg in path::segments(path) {
            let child_path = path::join(&current_path, seg);
            let existing = self.nodes.get(&current).and_then(|n| n.fields.get(seg)).cloned();
            current = match existing {
                Some(Field::Child(id)) => id,
                Some(Field::Computed(_)) => return Err(TreeError::ComputedField { path: child_path }),
                _ => {
                    let id = self.create_node(Some(current), seg.to_owned(), child_path.clone());
                    changed.push(child_path.clone());
                    self.plant_placeholders(id, changed);
                    id
                }
            };
            current_path = child_path;
        }
        Ok(current)
    }

    /// `key` is already escaped.
    fn plant_field(&mut self, parent: NodeId, key: &str, value: &Value, changed: &mut Vec<String>) {
        let Some(node) = self.nodes.get(&parent) else {
            return;
        };
        let child_path = path::join(&node.path, key);
        let existing = node.fields.get(key).cloned();

        if let Some(Field::Computed(_)) = existing {
            warn!(path = %child_path, "remote data shadows a computed property, ignoring");
            return;
        }

        match value {
            Value::Null => {
                if existing.is_none() {
                    return;
                }
                if let Some(Field::Child(id)) = existing {
                    self.teardown(id, changed);
                }
                if let Some(node) = self.nodes.get_mut(&parent) {
                    node.fields.shift_remove(key);
                }
                changed.push(child_path);
            }
            Value::Object(_) | Value::Array(_) => {
                let id = if let Some(Field::Child(id)) = existing {
                    id
                } else {
                    let id = self.create_node(Some(parent), key.to_owned(), child_path.clone());
                    changed.push(child_path);
                    id
                };
                self.plant_children(id, value, changed);
            }
            scalar => {
                if existing.as_ref() == Some(&Field::Remote(scalar.clone())) {
                    return;
                }
                if let Some(Field::Child(id)) = existing {
                    self.teardown(id, changed);
                }
                if let Some(node) = self.nodes.get_mut(&parent) {
                    node.fields.insert(key.to_owned(), Field::Remote(scalar.clone()));
                }
                changed.push(child_path);
            }
        }
    }

    /// Replace the remote content of a node with `value`'s children. Raw
    /// keys are escaped on the way in.
    fn plant_children(&mut self, id: NodeId, value: &Value, changed: &mut Vec<String>) {
        let incoming: Vec<(String, &Value)> = match value {
            Value::Object(map) => map.iter().map(|(k, v)| (escape_key(k), v)).collect(),
            Value::Array(items) => items.iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect(),
            _ => Vec::new(),
        };
        let stale: Vec<String> = self.nodes.get(&id).map_or_else(Vec::new, |node| {
            node.fields
                .iter()
                .filter(|(k, f)| f.is_remote() && !incoming.iter().any(|(key, _)| key == *k))
                .map(|(k, _)| k.clone())
                .collect()
        });
        for key in stale {
            self.plant_field(id, &key, &Value::Null, changed);
        }
        for (key, child) in incoming {
            self.plant_field(id, &key, child, changed);
        }
        self.plant_placeholders(id, changed);
    }

    /// Plant declared placeholders under `id` where nothing occupies the key.
    fn plant_placeholders(&mut self, id: NodeId, changed: &mut Vec<String>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let wanted: Vec<(String, Value)> = self
            .rules
            .iter()
            .flat_map(|rule| rule.placeholders_under(&node.path))
            .filter(|(key, _)| !node.fields.contains_key(key))
            .collect();
        for (key, value) in wanted {
            trace!(parent = %id, key = %key, "planting placeholder");
            self.plant_field(id, &key, &value, changed);
        }
    }

    fn create_node(&mut self, parent: Option<NodeId>, key: String, path: String) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        let (rule, vars) = self
            .rules
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.matches(&path).map(|vars| (Some(i), vars)))
            .unwrap_or((None, BTreeMap::new()));
        let class = rule.and_then(|i| self.rules.get(i)).map(|r| Arc::clone(&r.class));

        if let Some(rule) = rule.and_then(|i| self.rules.get(i)) {
            for descriptor in &rule.computed {
                let key = (id, descriptor.name.clone());
                self.watchers.insert(
                    key.clone(),
                    Watcher {
                        stat_key: format!("{}.{}", rule.class, descriptor.name),
                        compute: Arc::clone(&descriptor.compute),
                        deps: BTreeSet::new(),
                        initialized: false,
                    },
                );
                self.dirty.insert(key);
            }
        }

        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.fields.insert(key.clone(), Field::Child(id));
        }
        debug!(node = %id, path = %path, class = class.as_deref().unwrap_or("-"), "node created");
        self.nodes.insert(
            id,
            Node {
                id,
                parent,
                key,
                path,
                vars,
                class,
                rule,
                fields: IndexMap::new(),
            },
        );
        id
    }

    /// Remove a subtree, innermost first, running teardown hooks and
    /// dropping watchers. The caller detaches it from its parent.
    fn teardown(&mut self, id: NodeId, changed: &mut Vec<String>) {
        let Some(children) = self.nodes.get(&id).map(Node::children) else {
            return;
        };
        for child in children {
            self.teardown(child, changed);
        }

        self.watchers.retain(|(node, _), _| *node != id);
        self.dirty.retain(|(node, _)| *node != id);

        let hook = self
            .nodes
            .get(&id)
            .and_then(|n| n.rule)
            .and_then(|i| self.rules.get(i))
            .and_then(|r| r.teardown.clone());
        if let (Some(hook), Some(node)) = (hook, self.nodes.get(&id)) {
            hook(node);
        }
        if let Some(node) = self.nodes.remove(&id) {
            debug!(node = %id, path = %node.path, "node torn down");
            changed.push(node.path);
        }
    }

    // ── Recomputation ────────────────────────────────────────────────

    fn after_mutation(&mut self, changed: &[String]) {
        if changed.is_empty() && self.dirty.is_empty() {
            return;
        }
        self.invalidate(changed);
        self.recompute();
        self.version.send_modify(|v| *v += 1);
    }

    fn invalidate(&mut self, changed: &[String]) {
        if changed.is_empty() {
            return;
        }
        for (key, watcher) in &self.watchers {
            if watcher.depends_on(changed) {
                self.dirty.insert(key.clone());
            }
        }
    }

    fn recompute(&mut self) {
        let mut rounds = 0;
        while !self.dirty.is_empty() {
            rounds += 1;
            if rounds > MAX_RECOMPUTE_ROUNDS {
                warn!(pending = self.dirty.len(), "computed properties did not settle, giving up");
                self.dirty.clear();
                break;
            }

            let batch = std::mem::take(&mut self.dirty);
            let mut changed = Vec::new();
            for key in batch {
                if let Some(path) = self.evaluate(&key) {
                    changed.push(path);
                }
            }
            self.invalidate(&changed);
        }
    }

    /// Run one watcher. Returns the field path if the stored value changed.
    fn evaluate(&mut self, key: &WatchKey) -> Option<String> {
        let (node_id, name) = key;
        let compute = Arc::clone(&self.watchers.get(key)?.compute);
        let node_path = self.nodes.get(node_id)?.path.clone();

        let started = std::time::Instant::now();
        let scope = ComputeScope::new(self, *node_id, node_path.clone());
        let value = compute(&scope);
        let deps = scope.into_reads();
        let elapsed = started.elapsed();

        let watcher = self.watchers.get_mut(key)?;
        watcher.deps = deps;
        self.stats.record_recompute(&watcher.stat_key, elapsed);

        let node = self.nodes.get_mut(node_id)?;
        let unchanged = matches!(node.fields.get(name), Some(Field::Computed(prev)) if *prev == value);
        if watcher.initialized && unchanged {
            return None;
        }
        if watcher.initialized {
            self.stats.record_update(&watcher.stat_key);
        }
        watcher.initialized = true;
        node.fields.insert(name.clone(), Field::Computed(value));
        Some(path::join(&node_path, name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn tree(rules: Vec<MountRule>) -> Tree {
        Tree::new(rules, Arc::new(ComputedStats::new())).unwrap()
    }

    fn plus_one() -> MountRule {
        MountRule::new("Counter")
            .at("/counters/$id")
            .computed("next", |s| json!(s.i64("x").unwrap_or(0) + 1).into())
    }

    #[test]
    fn planting_mirrors_nested_values() {
        let mut t = tree(Vec::new());
        t.plant("/", &json!({"a": {"b": 1, "c": [true, "x"]}})).unwrap();
        assert_eq!(t.value("/"), json!({"a": {"b": 1, "c": {"0": true, "1": "x"}}}));
        assert_eq!(t.value("/a/b"), json!(1));
        assert!(t.node_at("/a/c").is_some());
        assert!(t.node_at("/a/b").is_none());
    }

    #[test]
    fn planting_null_tears_down_innermost_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        let mut t = tree(vec![
            MountRule::new("A")
                .at("/a")
                .at("/a/b")
                .computed("size", |s| json!(s.keys(".").len()).into())
                .on_teardown(move |n| log.lock().unwrap().push(n.path().to_owned())),
        ]);
        t.plant("/", &json!({"a": {"b": {"c": 1}}})).unwrap();
        assert_eq!(t.watchers.len(), 2);

        t.plant("/", &json!({"a": null})).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["/a/b", "/a"]);
        assert_eq!(t.value("/a"), Value::Null);
        assert!(t.node_at("/a").is_none());
        assert!(t.watchers.is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn missing_keys_are_removed_on_replace() {
        let mut t = tree(Vec::new());
        t.plant("/x", &json!({"a": 1, "b": 2})).unwrap();
        t.plant("/x", &json!({"b": 3})).unwrap();
        assert_eq!(t.value("/x"), json!({"b": 3}));
    }

    #[test]
    fn rules_assign_class_and_variables() {
        let mut t = tree(vec![plus_one()]);
        t.plant("/counters/c1", &json!({"x": 1})).unwrap();
        let node = t.node(t.node_at("/counters/c1").unwrap()).unwrap();
        assert_eq!(node.class(), Some("Counter"));
        assert_eq!(node.var("id"), Some("c1"));
        let bare = t.node(t.node_at("/counters").unwrap()).unwrap();
        assert_eq!(bare.class(), None);
    }

    #[test]
    fn keys_with_reserved_characters_are_escaped() {
        let mut t = tree(vec![MountRule::new("Item").at("/items/$id")]);
        let raw = json!({"items": {"a/b": {"x": 1}, "c\\2ed": {"x": 2}, "e.f": {"x": 3}}});
        t.plant("/", &raw).unwrap();

        let slash = t.node(t.node_at("/items/a\\2fb").unwrap()).unwrap();
        assert_eq!(slash.key(), "a\\2fb");
        assert_eq!(slash.var("id"), Some("a/b"));
        assert!(t.node_at("/items/a/b").is_none());

        let backslash = t.node(t.node_at("/items/c\\5c2ed").unwrap()).unwrap();
        assert_eq!(backslash.var("id"), Some("c\\2ed"));
        let dot = t.node(t.node_at("/items/e\\2ef").unwrap()).unwrap();
        assert_eq!(dot.var("id"), Some("e.f"));

        assert_eq!(t.value("/"), raw);
        assert_eq!(t.value("/items/a\\2fb/x"), json!(1));

        t.assign("/items/a\\2fb", "y/z", json!(true)).unwrap();
        assert_eq!(t.value("/items/a\\2fb/y\\2fz"), json!(true));

        t.plant("/items/a\\2fb", &Value::Null).unwrap();
        assert_eq!(t.value("/items"), json!({"c\\2ed": {"x": 2}, "e.f": {"x": 3}}));
    }

    #[test]
    fn computed_follows_its_dependencies() {
        let mut t = tree(vec![plus_one()]);
        t.plant("/counters/c1", &json!({"x": 2})).unwrap();
        assert_eq!(t.computed("/counters/c1", "next"), Some(&ComputedValue::Json(json!(3))));

        t.plant("/counters/c1/x", &json!(5)).unwrap();
        assert_eq!(t.value("/counters/c1/next"), json!(6));

        let err = t.assign("/counters/c1", "next", json!(0)).unwrap_err();
        assert_eq!(err, TreeError::ComputedField { path: "/counters/c1/next".into() });

        let stats = t.stats().get("Counter.next").unwrap();
        assert_eq!(stats.recompute_count, 2);
        assert_eq!(stats.update_count, 1);
    }

    #[test]
    fn unrelated_changes_do_not_recompute() {
        let mut t = tree(vec![plus_one()]);
        t.plant("/counters/c1", &json!({"x": 2, "y": 0})).unwrap();
        t.plant("/counters/c1/y", &json!(9)).unwrap();
        assert_eq!(t.stats().get("Counter.next").unwrap().recompute_count, 1);
    }

    #[test]
    fn equal_results_are_not_rewritten() {
        let mut t = tree(vec![
            MountRule::new("P")
                .at("/p")
                .computed("positive", |s| json!(s.i64("n").unwrap_or(0) > 0).into()),
        ]);
        t.plant("/p", &json!({"n": 1})).unwrap();
        t.plant("/p/n", &json!(2)).unwrap();
        let stats = t.stats().get("P.positive").unwrap();
        assert_eq!((stats.recompute_count, stats.update_count), (2, 0));
    }

    #[test]
    fn node_results_compare_by_identity() {
        let mut t = tree(vec![
            MountRule::new("Holder")
                .at("/h")
                .computed("target", |s| s.node("item").map_or(Value::Null.into(), ComputedValue::Node)),
        ]);
        t.plant("/h", &json!({"item": {"v": 1}})).unwrap();
        let first = t.computed("/h", "target").cloned().unwrap();

        // Same data under a fresh node is a different value.
        t.plant("/h/item", &json!(null)).unwrap();
        t.plant("/h/item", &json!({"v": 1})).unwrap();
        let second = t.computed("/h", "target").cloned().unwrap();
        assert_ne!(first, second);
        assert_eq!(t.value("/h/target"), json!("/h/item"));
    }

    #[test]
    fn computed_chains_settle() {
        let mut t = tree(vec![
            MountRule::new("Chain")
                .at("/c")
                .computed("double", |s| json!(s.i64("n").unwrap_or(0) * 2).into())
                .computed("quad", |s| {
                    let d = s.computed(".", "double").and_then(|v| v.as_json().and_then(Value::as_i64));
                    json!(d.unwrap_or(0) * 2).into()
                }),
        ]);
        t.plant("/c", &json!({"n": 1})).unwrap();
        assert_eq!(t.value("/c/quad"), json!(4));
        t.plant("/c/n", &json!(3)).unwrap();
        assert_eq!(t.value("/c/quad"), json!(12));
    }

    #[test]
    fn runaway_computed_is_capped() {
        let mut t = tree(vec![
            MountRule::new("Loop")
                .at("/l")
                .computed("tick", |s| {
                    let prev = s.get("tick").as_i64().unwrap_or(0);
                    json!(prev + 1).into()
                }),
        ]);
        t.plant("/l", &json!({"seed": true})).unwrap();
        let ticks = t.value("/l/tick").as_i64().unwrap();
        assert!(ticks <= i64::try_from(MAX_RECOMPUTE_ROUNDS).unwrap() + 1);
        assert!(t.dirty.is_empty());
    }

    #[test]
    fn placeholders_fill_declared_substructure() {
        let mut t = tree(vec![
            MountRule::new("Settings").at("/users/$uid/settings").placeholder(json!({"theme": "light"})),
        ]);
        t.plant("/users/u1", &json!({"name": "ada"})).unwrap();
        assert_eq!(t.value("/users/u1/settings"), json!({"theme": "light"}));

        t.plant("/users/u1/settings", &json!({"theme": "dark"})).unwrap();
        assert_eq!(t.value("/users/u1/settings/theme"), json!("dark"));
    }

    #[test]
    fn remote_fields_reject_local_assignment() {
        let mut t = tree(Vec::new());
        t.plant("/n", &json!({"remote": 1})).unwrap();
        assert_eq!(
            t.assign("/n", "remote", json!(2)),
            Err(TreeError::RemoteField { path: "/n/remote".into() })
        );
        assert_eq!(t.assign("/n", "$path", json!(2)), Err(TreeError::ReservedName("$path".into())));
        assert_eq!(t.assign("/missing", "x", json!(2)), Err(TreeError::NotFound("/missing".into())));

        t.assign("/n", "selected", json!(true)).unwrap();
        assert_eq!(t.value("/n"), json!({"remote": 1, "selected": true}));

        // Local fields survive a remote replace.
        t.plant("/n", &json!({"remote": 3})).unwrap();
        assert_eq!(t.value("/n/selected"), json!(true));
    }

    #[test]
    fn scalars_cannot_replace_the_root() {
        let mut t = tree(Vec::new());
        assert_eq!(t.plant("/", &json!(1)), Err(TreeError::ScalarAtRoot));
    }

    #[tokio::test]
    async fn mutations_bump_the_version() {
        let mut t = tree(Vec::new());
        let mut rx = t.subscribe();
        let before = t.version();
        t.plant("/a", &json!(1)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), before + 1);

        // No-op plant leaves it alone.
        t.plant("/a", &json!(1)).unwrap();
        assert_eq!(t.version(), before + 1);
    }
}
