// ── Query terms ──
//
// A query narrows a listener or one-shot read to an ordered, filtered
// window of the children under a path. Terms are encoded canonically so
// that equal queries produce equal listener keys.

use std::cmp::Ordering;
use std::fmt::Write;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::path;

/// Child ordering applied before range and limit terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "child", rename_all = "camelCase")]
pub enum OrderBy {
    Child(String),
    Key,
    Value,
}

/// Ordering, range and limit terms of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTerms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_to_first: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_to_last: Option<u32>,
}

impl QueryTerms {
    /// Returns `true` if no term narrows the result.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Canonical `name=value&...` encoding, in a fixed term order.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut push = |name: &str, value: &str| {
            if !out.is_empty() {
                out.push('&');
            }
            let _ = write!(out, "{name}={value}");
        };
        match &self.order_by {
            Some(OrderBy::Child(child)) => push("orderByChild", child),
            Some(OrderBy::Key) => push("orderByKey", "true"),
            Some(OrderBy::Value) => push("orderByValue", "true"),
            None => {}
        }
        if let Some(v) = &self.start_at {
            push("startAt", &v.to_string());
        }
        if let Some(v) = &self.end_at {
            push("endAt", &v.to_string());
        }
        if let Some(v) = &self.equal_to {
            push("equalTo", &v.to_string());
        }
        if let Some(n) = self.limit_to_first {
            push("limitToFirst", &n.to_string());
        }
        if let Some(n) = self.limit_to_last {
            push("limitToLast", &n.to_string());
        }
        out
    }

    /// Apply the terms to the children of `value`.
    ///
    /// Non-container values are returned unchanged when no term is set, and
    /// filtered away otherwise.
    pub fn apply(&self, value: &Value) -> Value {
        if self.is_empty() {
            return value.clone();
        }
        let children: Map<String, Value> = match value {
            Value::Object(map) => map.clone(),
            Value::Array(items) => path::array_to_map(items.clone()),
            _ => return Value::Null,
        };

        let mut entries: Vec<(String, Value)> = children.into_iter().collect();
        entries.sort_by(|a, b| self.compare(a, b));

        let start = self.equal_to.as_ref().or(self.start_at.as_ref());
        let end = self.equal_to.as_ref().or(self.end_at.as_ref());
        entries.retain(|entry| {
            let key = self.sort_value(entry);
            start.is_none_or(|s| compare_values(&key, s) != Ordering::Less)
                && end.is_none_or(|e| compare_values(&key, e) != Ordering::Greater)
        });

        if let Some(n) = self.limit_to_first {
            entries.truncate(n as usize);
        }
        if let Some(n) = self.limit_to_last {
            let n = n as usize;
            if entries.len() > n {
                entries.drain(..entries.len() - n);
            }
        }

        let result: Map<String, Value> = entries.into_iter().collect();
        if result.is_empty() { Value::Null } else { Value::Object(result) }
    }

    fn sort_value(&self, (key, value): &(String, Value)) -> Value {
        match &self.order_by {
            None | Some(OrderBy::Key) => Value::String(key.clone()),
            Some(OrderBy::Value) => value.clone(),
            Some(OrderBy::Child(child)) => path::get(value, child),
        }
    }

    fn compare(&self, a: &(String, Value), b: &(String, Value)) -> Ordering {
        compare_values(&self.sort_value(a), &self.sort_value(b)).then_with(|| a.0.cmp(&b.0))
    }
}

/// Store ordering: null < false < true < numbers < strings < containers.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) | Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A path plus optional query terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub url: String,
    #[serde(default, skip_serializing_if = "QueryTerms::is_empty")]
    pub terms: QueryTerms,
}

impl Query {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: path::normalize(url.as_ref()),
            terms: QueryTerms::default(),
        }
    }

    pub fn order_by_child(mut self, child: impl Into<String>) -> Self {
        self.terms.order_by = Some(OrderBy::Child(child.into()));
        self
    }

    pub fn order_by_key(mut self) -> Self {
        self.terms.order_by = Some(OrderBy::Key);
        self
    }

    pub fn order_by_value(mut self) -> Self {
        self.terms.order_by = Some(OrderBy::Value);
        self
    }

    pub fn start_at(mut self, value: impl Into<Value>) -> Self {
        self.terms.start_at = Some(value.into());
        self
    }

    pub fn end_at(mut self, value: impl Into<Value>) -> Self {
        self.terms.end_at = Some(value.into());
        self
    }

    pub fn equal_to(mut self, value: impl Into<Value>) -> Self {
        self.terms.equal_to = Some(value.into());
        self
    }

    pub fn limit_to_first(mut self, n: u32) -> Self {
        self.terms.limit_to_first = Some(n);
        self
    }

    pub fn limit_to_last(mut self, n: u32) -> Self {
        self.terms.limit_to_last = Some(n);
        self
    }

    /// Key identifying all listeners on the same path and terms.
    pub fn listener_key(&self) -> String {
        if self.terms.is_empty() {
            self.url.clone()
        } else {
            format!("{}?{}", self.url, self.terms.encode())
        }
    }
}
