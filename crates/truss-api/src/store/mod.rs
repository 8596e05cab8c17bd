//! Remote store adapter contract.
//!
//! The worker never talks to a database directly: it drives a
//! [`RemoteStore`], which exposes the hierarchical store's operations
//! (writes, subscriptions, one-shot reads, compare-and-set transactions,
//! disconnect hooks and auth). [`MemoryStore`] is the in-process
//! implementation used by tests and local tooling.

mod memory;

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::query::Query;

pub use memory::{Access, MemoryStore};

/// Kind of change a listener subscribes to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    #[default]
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
}

/// Opaque handle to a registration made on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(pub u64);

/// One snapshot read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub path: String,
    pub exists: bool,
    /// `Err` when the value exists but could not be materialized.
    pub value: Result<Value, Error>,
}

impl StoreSnapshot {
    pub fn of(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            exists: !value.is_null(),
            value: Ok(value),
        }
    }
}

/// Event pushed to a listener's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Snapshot(StoreSnapshot),
    /// The store revoked the listener; no further events follow.
    Cancelled(Error),
}

/// Result of a store-side transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    pub committed: bool,
    /// Committed value, or the current value when the update aborted.
    pub value: Value,
}

/// Operation queued to run when the client disconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum DisconnectOp {
    Set { value: Value },
    Update { value: Map<String, Value> },
    Remove,
    /// Drop every hook queued at or below the path.
    Cancel,
}

/// Operation replayed by the rule simulator after a permission denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedOp {
    /// `set`, `update`, `on`, `once` or `transaction`.
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl SimulatedOp {
    pub fn is_write(&self) -> bool {
        matches!(self.method.as_str(), "set" | "update" | "transaction")
    }
}

/// Operations the worker needs from a hierarchical remote store.
///
/// Paths are normalized and escaped. `null` deletes.
pub trait RemoteStore: Send + Sync + 'static {
    fn set(&self, url: &str, value: Value) -> impl Future<Output = Result<(), Error>> + Send;

    /// Apply several relative-path writes under `url` atomically.
    fn update(
        &self,
        url: &str,
        values: Map<String, Value>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Subscribe `sink` to `query`. The current value is delivered first.
    fn on(
        &self,
        query: &Query,
        event: EventType,
        sink: mpsc::UnboundedSender<StoreEvent>,
    ) -> impl Future<Output = Result<ListenerToken, Error>> + Send;

    fn off(&self, token: ListenerToken) -> impl Future<Output = ()> + Send;

    fn once(
        &self,
        query: &Query,
        event: EventType,
    ) -> impl Future<Output = Result<StoreSnapshot, Error>> + Send;

    /// Atomically read the value at `url` and replace it with what `update`
    /// returns. `None` aborts without writing.
    fn transaction<F>(
        &self,
        url: &str,
        update: F,
    ) -> impl Future<Output = Result<TransactionOutcome, Error>> + Send
    where
        F: FnMut(&Value) -> Option<Value> + Send + 'static;

    fn on_disconnect(
        &self,
        url: &str,
        op: DisconnectOp,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Authenticate and return the resulting auth payload.
    fn auth_with_custom_token(&self, token: &str)
    -> impl Future<Output = Result<Value, Error>> + Send;

    fn unauth(&self) -> impl Future<Output = ()> + Send;

    /// Subscribe to auth changes. The current auth payload is delivered first.
    fn on_auth(
        &self,
        sink: mpsc::UnboundedSender<Value>,
    ) -> impl Future<Output = ListenerToken> + Send;

    fn off_auth(&self, token: ListenerToken) -> impl Future<Output = ()> + Send;

    /// Drop and re-establish the connection, firing disconnect hooks.
    fn bounce_connection(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Evaluate `op` against the security rules as the holder of `token`,
    /// returning the rule trace.
    fn simulate(
        &self,
        token: &str,
        op: &SimulatedOp,
    ) -> impl Future<Output = Result<String, Error>> + Send;
}
