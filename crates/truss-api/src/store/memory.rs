// ── In-memory store ──
//
// A complete, single-process implementation of the store contract. All
// state lives behind one mutex; listener sinks are unbounded so events can
// be pushed while the lock is held without ever blocking.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    DisconnectOp, EventType, ListenerToken, RemoteStore, SimulatedOp, StoreEvent, StoreSnapshot,
    TransactionOutcome,
};
use crate::error::Error;
use crate::path;
use crate::query::Query;

/// Who may read or write below a rule's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
    /// Only authenticated clients.
    Authenticated,
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    read: Access,
    write: Access,
}

#[derive(Debug)]
struct Listener {
    query: Query,
    sink: mpsc::UnboundedSender<StoreEvent>,
    last: Option<Value>,
}

#[derive(Debug, Default)]
struct State {
    root: Value,
    next_token: u64,
    listeners: BTreeMap<ListenerToken, Listener>,
    auth: Value,
    auth_sinks: BTreeMap<ListenerToken, mpsc::UnboundedSender<Value>>,
    disconnect_ops: Vec<(String, DisconnectOp)>,
    rules: Vec<Rule>,
}

/// Store holding its whole tree in memory.
///
/// Cloning yields another handle onto the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `root`.
    pub fn with_value(root: Value) -> Self {
        let store = Self::new();
        store.lock().root = path::prune(root);
        store
    }

    /// Add a security rule for everything at or below `prefix`. The most
    /// specific matching rule decides.
    #[must_use]
    pub fn with_rule(self, prefix: &str, read: Access, write: Access) -> Self {
        self.lock().rules.push(Rule {
            prefix: path::normalize(prefix),
            read,
            write,
        });
        self
    }

    /// Current value at `url` without going through security rules.
    pub fn value(&self, url: &str) -> Value {
        path::get(&self.lock().root, url)
    }

    /// Number of live listeners, for diagnostics.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of live auth subscriptions, for diagnostics.
    pub fn auth_listener_count(&self) -> usize {
        self.lock().auth_sinks.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Rules ────────────────────────────────────────────────────────────

fn claims_for(token: &str) -> Value {
    match serde_json::from_str::<Value>(token) {
        Ok(Value::Object(claims)) => Value::Object(claims),
        _ => json!({ "uid": token, "provider": "custom" }),
    }
}

fn access_label(access: Access) -> &'static str {
    match access {
        Access::Allow => "allow",
        Access::Deny => "deny",
        Access::Authenticated => "auth != null",
    }
}

impl State {
    /// Evaluate the rules for `url`, appending a trace line per rule seen.
    fn allowed(&self, url: &str, write: bool, auth: &Value, trace_out: &mut String) -> bool {
        let mut matching: Vec<&Rule> =
            self.rules.iter().filter(|r| path::contains(&r.prefix, url)).collect();
        matching.sort_by_key(|r| r.prefix.len());

        let mut allowed = true;
        for rule in matching {
            let access = if write { rule.write } else { rule.read };
            allowed = match access {
                Access::Allow => true,
                Access::Deny => false,
                Access::Authenticated => !auth.is_null(),
            };
            let verdict = if allowed { "granted" } else { "denied" };
            let _ = writeln!(trace_out, "    {}: \"{}\" => {verdict}", rule.prefix, access_label(access));
        }
        allowed
    }

    fn check(&self, operation: &str, url: &str, write: bool) -> Result<(), Error> {
        let mut sink = String::new();
        if self.allowed(url, write, &self.auth, &mut sink) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                operation: operation.to_owned(),
                path: url.to_owned(),
            })
        }
    }

    fn token(&mut self) -> ListenerToken {
        self.next_token += 1;
        ListenerToken(self.next_token)
    }

    fn view(&self, query: &Query) -> Value {
        query.terms.apply(&path::get(&self.root, &query.url))
    }

    /// Push a snapshot to every listener whose view changed.
    fn notify(&mut self) {
        let root = &self.root;
        self.listeners.retain(|token, listener| {
            let current = listener
                .query
                .terms
                .apply(&path::get(root, &listener.query.url));
            if listener.last.as_ref() == Some(&current) {
                return true;
            }
            trace!(token = token.0, path = %listener.query.url, "delivering snapshot");
            listener.last = Some(current.clone());
            let snapshot = StoreSnapshot::of(listener.query.url.clone(), current);
            listener.sink.send(StoreEvent::Snapshot(snapshot)).is_ok()
        });
    }

    /// Cancel listeners the current auth may no longer read.
    fn revoke_unreadable(&mut self) {
        let revoked: Vec<ListenerToken> = self
            .listeners
            .iter()
            .filter(|(_, l)| self.check("on", &l.query.url, false).is_err())
            .map(|(token, _)| *token)
            .collect();
        for token in revoked {
            if let Some(listener) = self.listeners.remove(&token) {
                debug!(path = %listener.query.url, "revoking listener");
                let _ = listener.sink.send(StoreEvent::Cancelled(Error::ListenerCancelled {
                    path: listener.query.url.clone(),
                    reason: "permission_denied".into(),
                }));
            }
        }
    }

    fn write(&mut self, url: &str, value: Value) {
        path::set(&mut self.root, url, value);
    }

    fn apply_disconnect(&mut self, url: &str, op: DisconnectOp) {
        match op {
            DisconnectOp::Set { value } => self.write(url, value),
            DisconnectOp::Update { value } => {
                let targets = update_paths(url, &value);
                for (target, v) in targets.into_iter().zip(value.into_iter().map(|(_, v)| v)) {
                    self.write(&target, v);
                }
            }
            DisconnectOp::Remove => self.write(url, Value::Null),
            DisconnectOp::Cancel => {}
        }
    }
}

// ── Contract ─────────────────────────────────────────────────────────

fn update_paths(url: &str, values: &Map<String, Value>) -> Vec<String> {
    values
        .keys()
        .map(|child| {
            let child = path::normalize(child);
            if child == path::ROOT { url.to_owned() } else { path::join(url, &child[1..]) }
        })
        .collect()
}

impl RemoteStore for MemoryStore {
    async fn set(&self, url: &str, value: Value) -> Result<(), Error> {
        let url = path::normalize(url);
        let mut state = self.lock();
        state.check("set", &url, true)?;
        state.write(&url, value);
        state.notify();
        Ok(())
    }

    async fn update(&self, url: &str, values: Map<String, Value>) -> Result<(), Error> {
        let url = path::normalize(url);
        let targets = update_paths(&url, &values);
        let mut state = self.lock();
        for target in &targets {
            state.check("update", target, true)?;
        }
        for (target, value) in targets.into_iter().zip(values.into_iter().map(|(_, v)| v)) {
            state.write(&target, value);
        }
        state.notify();
        Ok(())
    }

    async fn on(
        &self,
        query: &Query,
        event: EventType,
        sink: mpsc::UnboundedSender<StoreEvent>,
    ) -> Result<ListenerToken, Error> {
        if event != EventType::Value {
            return Err(Error::Unsupported("child events on the in-memory store"));
        }
        let mut state = self.lock();
        state.check("on", &query.url, false)?;
        let current = state.view(query);
        let token = state.token();
        let _ = sink.send(StoreEvent::Snapshot(StoreSnapshot::of(
            query.url.clone(),
            current.clone(),
        )));
        state.listeners.insert(
            token,
            Listener {
                query: query.clone(),
                sink,
                last: Some(current),
            },
        );
        Ok(token)
    }

    async fn off(&self, token: ListenerToken) {
        self.lock().listeners.remove(&token);
    }

    async fn once(&self, query: &Query, event: EventType) -> Result<StoreSnapshot, Error> {
        if event != EventType::Value {
            return Err(Error::Unsupported("child events on the in-memory store"));
        }
        let state = self.lock();
        state.check("once", &query.url, false)?;
        Ok(StoreSnapshot::of(query.url.clone(), state.view(query)))
    }

    async fn transaction<F>(&self, url: &str, mut update: F) -> Result<TransactionOutcome, Error>
    where
        F: FnMut(&Value) -> Option<Value> + Send + 'static,
    {
        let url = path::normalize(url);
        let mut state = self.lock();
        state.check("transaction", &url, true)?;
        let current = path::get(&state.root, &url);
        let Some(next) = update(&current) else {
            return Ok(TransactionOutcome {
                committed: false,
                value: current,
            });
        };
        state.write(&url, next);
        let value = path::get(&state.root, &url);
        state.notify();
        Ok(TransactionOutcome {
            committed: true,
            value,
        })
    }

    async fn on_disconnect(&self, url: &str, op: DisconnectOp) -> Result<(), Error> {
        let url = path::normalize(url);
        let mut state = self.lock();
        if op == DisconnectOp::Cancel {
            state.disconnect_ops.retain(|(p, _)| !path::contains(&url, p));
            return Ok(());
        }
        state.check("onDisconnect", &url, true)?;
        state.disconnect_ops.push((url, op));
        Ok(())
    }

    async fn auth_with_custom_token(&self, token: &str) -> Result<Value, Error> {
        if token.is_empty() {
            return Err(Error::Store {
                code: "invalid_token".into(),
                message: "custom token is empty".into(),
                extra: Map::new(),
            });
        }
        let claims = claims_for(token);
        let mut state = self.lock();
        state.auth = claims.clone();
        state.auth_sinks.retain(|_, sink| sink.send(claims.clone()).is_ok());
        state.revoke_unreadable();
        Ok(claims)
    }

    async fn unauth(&self) {
        let mut state = self.lock();
        state.auth = Value::Null;
        state.auth_sinks.retain(|_, sink| sink.send(Value::Null).is_ok());
        state.revoke_unreadable();
    }

    async fn on_auth(&self, sink: mpsc::UnboundedSender<Value>) -> ListenerToken {
        let mut state = self.lock();
        let token = state.token();
        let _ = sink.send(state.auth.clone());
        state.auth_sinks.insert(token, sink);
        token
    }

    async fn off_auth(&self, token: ListenerToken) {
        self.lock().auth_sinks.remove(&token);
    }

    async fn bounce_connection(&self) -> Result<(), Error> {
        let mut state = self.lock();
        let ops = std::mem::take(&mut state.disconnect_ops);
        debug!(hooks = ops.len(), "bouncing connection");
        for (url, op) in ops {
            state.apply_disconnect(&url, op);
        }
        state.notify();
        Ok(())
    }

    async fn simulate(&self, token: &str, op: &SimulatedOp) -> Result<String, Error> {
        let url = path::normalize(&op.url);
        let auth = claims_for(token);
        let state = self.lock();
        let verb = if op.is_write() { "write" } else { "read" };

        let mut out = String::new();
        let _ = writeln!(out, "Attempt to {verb} {url} with auth={auth}");
        let targets = match (&op.method[..], &op.value) {
            ("update", Some(Value::Object(values))) => update_paths(&url, values),
            _ => vec![url.clone()],
        };
        let mut allowed = true;
        for target in &targets {
            if targets.len() > 1 {
                let _ = writeln!(out, "  {target}:");
            }
            allowed &= state.allowed(target, op.is_write(), &auth, &mut out);
        }
        let verdict = if allowed { "allowed" } else { "denied" };
        let _ = write!(out, "{}{} was {verdict}.", verb[..1].to_uppercase(), &verb[1..]);
        Ok(out)
    }
}
