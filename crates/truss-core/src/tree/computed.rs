// ── Computed properties ──
//
// A computed property is evaluated against a `ComputeScope`, which logs
// every path the derivation reads. The log becomes the property's
// dependency set; a change overlapping any logged path marks it dirty.

use std::cell::RefCell;
use std::collections::BTreeSet;

use serde_json::Value;
use truss_api::path;

use super::{NodeId, Tree};

/// Result of a computed property.
///
/// Node references compare by identity: two distinct nodes holding the same
/// data are different values.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputedValue {
    Json(Value),
    Node(NodeId),
    Nodes(Vec<NodeId>),
}

impl ComputedValue {
    /// JSON projection. Node references render as their paths.
    pub fn to_json(&self, tree: &Tree) -> Value {
        let node_path = |id: &NodeId| {
            tree.node(*id)
                .map_or(Value::Null, |n| Value::String(n.path().to_owned()))
        };
        match self {
            Self::Json(v) => v.clone(),
            Self::Node(id) => node_path(id),
            Self::Nodes(ids) => Value::Array(ids.iter().map(node_path).collect()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for ComputedValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<NodeId> for ComputedValue {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

/// Read access to the tree during a computation.
///
/// Relative paths resolve against the owning node; `..` climbs one level and
/// a leading `/` makes the path absolute.
pub struct ComputeScope<'t> {
    tree: &'t Tree,
    node: NodeId,
    path: String,
    reads: RefCell<BTreeSet<String>>,
}

impl<'t> ComputeScope<'t> {
    pub(crate) fn new(tree: &'t Tree, node: NodeId, path: String) -> Self {
        Self {
            tree,
            node,
            path,
            reads: RefCell::new(BTreeSet::new()),
        }
    }

    pub(crate) fn into_reads(self) -> BTreeSet<String> {
        self.reads.into_inner()
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path variable captured by the node's mount template.
    pub fn var(&self, name: &str) -> Option<&'t str> {
        self.tree.node(self.node)?.var(name)
    }

    pub fn resolve(&self, relative: &str) -> String {
        if relative.starts_with('/') {
            return path::normalize(relative);
        }
        let mut segments: Vec<&str> = path::segments(&self.path).collect();
        for seg in path::segments(relative) {
            match seg {
                "." => {}
                ".." => {
                    segments.pop();
                }
                _ => segments.push(seg),
            }
        }
        path::normalize(&segments.join("/"))
    }

    fn track(&self, path: &str) {
        self.reads.borrow_mut().insert(path.to_owned());
    }

    /// Current JSON value at `relative`, `null` when absent.
    pub fn get(&self, relative: &str) -> Value {
        let path = self.resolve(relative);
        self.track(&path);
        self.tree.value(&path)
    }

    pub fn i64(&self, relative: &str) -> Option<i64> {
        self.get(relative).as_i64()
    }

    /// Node mounted at `relative`, if any.
    pub fn node(&self, relative: &str) -> Option<NodeId> {
        let path = self.resolve(relative);
        self.track(&path);
        self.tree.node_at(&path)
    }

    /// Field names of the node at `relative`.
    pub fn keys(&self, relative: &str) -> Vec<String> {
        let path = self.resolve(relative);
        self.track(&path);
        self.tree
            .node_at(&path)
            .and_then(|id| self.tree.node(id))
            .map(|n| n.keys().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Value of another computed property, by node path and name.
    pub fn computed(&self, relative: &str, name: &str) -> Option<ComputedValue> {
        let node_path = self.resolve(relative);
        self.track(&path::join(&node_path, name));
        self.tree.computed(&node_path, name).cloned()
    }
}

// ── Watchers ──

pub(crate) type WatchKey = (NodeId, String);

pub(crate) struct Watcher {
    pub(crate) stat_key: String,
    pub(crate) compute: super::mount::ComputeFn,
    pub(crate) deps: BTreeSet<String>,
    pub(crate) initialized: bool,
}

impl Watcher {
    pub(crate) fn depends_on(&self, changed: &[String]) -> bool {
        self.deps
            .iter()
            .any(|dep| changed.iter().any(|c| path::overlaps(dep, c)))
    }
}
