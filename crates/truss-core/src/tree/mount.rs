// ── Mount rules ──
//
// A mount rule binds one or more path templates to a class name. Template
// segments starting with `$` are variables. Each template compiles into a
// regex matching full paths (capturing the variables) and a regex matching
// the parent path, used to plant placeholder children before any remote
// data arrives.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use truss_api::{path, unescape_key};

use super::computed::{ComputeScope, ComputedValue};
use super::{Node, TreeError};

/// Derivation function of a computed property.
pub type ComputeFn = Arc<dyn Fn(&ComputeScope<'_>) -> ComputedValue + Send + Sync>;

/// Hook run on a node just before it is removed from the mirror.
pub type TeardownFn = Arc<dyn Fn(&Node) + Send + Sync>;

/// A computed property declaration.
#[derive(Clone)]
pub struct ComputedDescriptor {
    pub name: String,
    pub compute: ComputeFn,
}

impl fmt::Debug for ComputedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Declaration of a mounted class.
///
/// ```ignore
/// let rule = MountRule::new("Player")
///     .at("/games/$game/players/$player")
///     .computed("next_level", |s| (s.get("level").as_i64().unwrap_or(0) + 1).into())
///     .placeholder(json!({}));
/// ```
#[derive(Clone)]
pub struct MountRule {
    class: String,
    templates: Vec<String>,
    computed: Vec<ComputedDescriptor>,
    placeholder: Option<Value>,
    teardown: Option<TeardownFn>,
}

impl fmt::Debug for MountRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountRule")
            .field("class", &self.class)
            .field("templates", &self.templates)
            .field("computed", &self.computed)
            .field("placeholder", &self.placeholder)
            .finish_non_exhaustive()
    }
}

impl MountRule {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            templates: Vec::new(),
            computed: Vec::new(),
            placeholder: None,
            teardown: None,
        }
    }

    /// Mount the class at a path template such as `/a/$id/b`.
    pub fn at(mut self, template: impl Into<String>) -> Self {
        self.templates.push(template.into());
        self
    }

    pub fn computed(
        mut self,
        name: impl Into<String>,
        compute: impl Fn(&ComputeScope<'_>) -> ComputedValue + Send + Sync + 'static,
    ) -> Self {
        self.computed.push(ComputedDescriptor {
            name: name.into(),
            compute: Arc::new(compute),
        });
        self
    }

    /// Value planted at the mount path until remote data arrives. Only
    /// templates ending in a literal key get placeholders.
    pub fn placeholder(mut self, value: Value) -> Self {
        self.placeholder = Some(value);
        self
    }

    pub fn on_teardown(mut self, hook: impl Fn(&Node) + Send + Sync + 'static) -> Self {
        self.teardown = Some(Arc::new(hook));
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }
}

// ── Compiled form ────────────────────────────────────────────────────

pub(crate) struct CompiledTemplate {
    path: Regex,
    parent: Option<Regex>,
    variables: Vec<String>,
    /// Final segment, when it is a literal key.
    last_key: Option<String>,
}

impl CompiledTemplate {
    fn compile(template: &str) -> Result<Self, TreeError> {
        let invalid = |reason: &str| TreeError::InvalidTemplate {
            template: template.to_owned(),
            reason: reason.to_owned(),
        };
        if !template.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut parts = Vec::new();
        let mut variables = Vec::new();
        let mut last_key = None;
        for segment in path::segments(template) {
            if let Some(name) = segment.strip_prefix('$') {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid("variable names must be alphanumeric"));
                }
                if variables.iter().any(|v| v == name) {
                    return Err(invalid("duplicate variable"));
                }
                variables.push(name.to_owned());
                parts.push("([^/]+)".to_owned());
                last_key = None;
            } else {
                parts.push(regex::escape(segment));
                last_key = Some(segment.to_owned());
            }
        }

        let anchored = |parts: &[String]| {
            let pattern = if parts.is_empty() {
                "^/$".to_owned()
            } else {
                format!("^/{}$", parts.join("/"))
            };
            Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))
        };
        let parent = match parts.split_last() {
            Some((_, init)) => Some(anchored(init)?),
            None => None,
        };
        Ok(Self {
            path: anchored(&parts)?,
            parent,
            variables,
            last_key,
        })
    }

    fn captures(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.path.captures(path)?;
        Some(
            self.variables
                .iter()
                .zip(caps.iter().skip(1))
                .filter_map(|(name, m)| m.map(|m| (name.clone(), unescape_key(m.as_str()))))
                .collect(),
        )
    }
}

pub(crate) struct CompiledRule {
    pub(crate) class: Arc<str>,
    templates: Vec<CompiledTemplate>,
    pub(crate) computed: Vec<ComputedDescriptor>,
    placeholder: Option<Value>,
    pub(crate) teardown: Option<TeardownFn>,
}

impl CompiledRule {
    pub(crate) fn compile(rule: MountRule) -> Result<Self, TreeError> {
        let mut names: Vec<&str> = Vec::new();
        for descriptor in &rule.computed {
            if descriptor.name.starts_with('$') {
                return Err(TreeError::ReservedName(descriptor.name.clone()));
            }
            if names.contains(&descriptor.name.as_str()) {
                return Err(TreeError::DuplicateComputed {
                    class: rule.class.clone(),
                    name: descriptor.name.clone(),
                });
            }
            names.push(&descriptor.name);
        }

        let templates = rule
            .templates
            .iter()
            .map(|t| CompiledTemplate::compile(t))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            class: Arc::from(rule.class),
            templates,
            computed: rule.computed,
            placeholder: rule.placeholder,
            teardown: rule.teardown,
        })
    }

    /// Path variables if any template matches `path`.
    pub(crate) fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        self.templates.iter().find_map(|t| t.captures(path))
    }

    /// Placeholder children this rule wants under `parent`.
    pub(crate) fn placeholders_under(&self, parent: &str) -> Vec<(String, Value)> {
        let Some(value) = &self.placeholder else {
            return Vec::new();
        };
        self.templates
            .iter()
            .filter(|t| t.parent.as_ref().is_some_and(|p| p.is_match(parent)))
            .filter_map(|t| t.last_key.clone())
            .map(|key| (key, value.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn templates_capture_variables() {
        let rule = CompiledRule::compile(MountRule::new("Player").at("/games/$game/players/$player")).unwrap();
        let vars = rule.matches("/games/g1/players/p\\2e1").unwrap();
        assert_eq!(vars["game"], "g1");
        assert_eq!(vars["player"], "p.1");
        assert!(rule.matches("/games/g1/players").is_none());
        assert!(rule.matches("/games/g1/players/p1/extra").is_none());
    }

    #[test]
    fn placeholders_need_a_literal_last_key() {
        let rule = CompiledRule::compile(
            MountRule::new("Settings")
                .at("/users/$uid/settings")
                .at("/teams/$team")
                .placeholder(json!({})),
        )
        .unwrap();
        assert_eq!(rule.placeholders_under("/users/u1"), vec![("settings".to_owned(), json!({}))]);
        assert!(rule.placeholders_under("/teams").is_empty());
    }

    #[test]
    fn root_template_has_no_parent() {
        let rule = CompiledRule::compile(MountRule::new("Root").at("/").placeholder(json!(1))).unwrap();
        assert!(rule.matches("/").is_some());
        assert!(rule.placeholders_under("/").is_empty());
    }

    #[test]
    fn invalid_declarations_are_rejected() {
        let relative = CompiledRule::compile(MountRule::new("A").at("a/b"));
        assert!(matches!(relative, Err(TreeError::InvalidTemplate { .. })));

        let duplicate = CompiledRule::compile(MountRule::new("A").at("/$x/$x"));
        assert!(matches!(duplicate, Err(TreeError::InvalidTemplate { .. })));

        let reserved = CompiledRule::compile(MountRule::new("A").at("/a").computed("$path", |_| Value::Null.into()));
        assert_eq!(reserved.err(), Some(TreeError::ReservedName("$path".into())));
    }
}
