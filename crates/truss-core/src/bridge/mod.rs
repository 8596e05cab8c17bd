//! Foreground RPC client.
//!
//! The [`Bridge`] turns engine operations into batched [`Message`]s for the
//! worker and settles them from the worker's replies:
//!
//! - **Calls** are correlated by message id. Every call resolves or rejects
//!   exactly once; a worker that goes away rejects everything outstanding
//!   with [`CoreError::Disconnected`].
//! - **Listeners** bind a local callback id to a remote subscription and
//!   return an explicit [`Subscription`] handle. Turning a subscription off
//!   unregisters its callback before the `off` message is even queued, so
//!   snapshots already in flight are dropped.
//! - **Rejections** classified as permission denials are hydrated with a
//!   security rule trace when a simulation token is configured.
//! - **Suspension** buffers inbound batches and holds outbound messages
//!   until the bridge is resumed.

mod slowness;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use truss_api::store::{DisconnectOp, EventType, SimulatedOp};
use truss_api::transport::{ClientEndpoint, ReplyBatch};
use truss_api::{
    CallbackId, ListenOptions, Message, MessageId, Query, Reply, Request, Snapshot, WireError,
};

pub use slowness::{OpCategory, SlowOpGuard, SlownessCallback, SlownessTracker};

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::outbox::Outbox;
use crate::storage::KeyValueStorage;
use crate::transaction::{
    self, AttemptReply, TransactionOptions, TransactionPort, TransactionResult, TransactionStep,
};

/// Receives listener snapshots. One callback may back several subscriptions.
pub type SnapshotCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;
/// Receives the error that ended a listener.
pub type CancelCallback = Arc<dyn Fn(CoreError) + Send + Sync>;
/// Receives auth payloads (`null` when signed out).
pub type AuthCallback = Arc<dyn Fn(Value) + Send + Sync>;

type CallbackFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Capacity of the global error channel.
const ERROR_CHANNEL_CAPACITY: usize = 64;

// ── Options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Keep-alive ping interval; zero disables pinging.
    pub ping_interval: Duration,
    pub simulation_timeout: Duration,
    /// Token the rule simulator authenticates with. Without one,
    /// permission denials are not hydrated.
    pub simulation_token: Option<SecretString>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for BridgeOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            simulation_timeout: config.simulation_timeout,
            simulation_token: config.auth_token.clone(),
        }
    }
}

// ── Handles ──────────────────────────────────────────────────────────

/// Handle for one remote listener registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    callback_id: CallbackId,
    listener_key: String,
    query: Query,
    event_type: EventType,
}

impl Subscription {
    pub fn callback_id(&self) -> CallbackId {
        self.callback_id
    }

    pub fn listener_key(&self) -> &str {
        &self.listener_key
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }
}

/// Handle for an auth-state subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSubscription(CallbackId);

/// A call in flight.
pub struct PendingReply {
    sent: Option<oneshot::Receiver<()>>,
    reply: oneshot::Receiver<Result<Value, CoreError>>,
}

impl PendingReply {
    /// Wait until the worker acknowledges the message. Returns `false` if
    /// the call settled or the worker went away without acknowledging.
    pub async fn sent(&mut self) -> bool {
        match self.sent.take() {
            Some(sent) => sent.await.is_ok(),
            None => true,
        }
    }

    pub async fn result(self) -> Result<Value, CoreError> {
        self.reply.await.unwrap_or(Err(CoreError::Disconnected))
    }
}

// ── Internal state ───────────────────────────────────────────────────

struct PendingCall {
    request: Request,
    reply: oneshot::Sender<Result<Value, CoreError>>,
    sent: Option<oneshot::Sender<()>>,
    slow: Option<SlowOpGuard>,
}

struct Registration {
    subscription: Subscription,
    on_snapshot: SnapshotCallback,
}

struct BridgeInner {
    options: BridgeOptions,
    next_id: AtomicU64,
    next_callback: AtomicU64,
    outbox: Arc<Outbox<Message>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ReplyBatch>>>,
    active: watch::Sender<bool>,
    pending: DashMap<MessageId, PendingCall>,
    callbacks: DashMap<CallbackId, CallbackFn>,
    listeners: DashMap<CallbackId, Registration>,
    slowness: SlownessTracker,
    errors: broadcast::Sender<Arc<CoreError>>,
    auth: ArcSwap<Value>,
    storage: Arc<dyn KeyValueStorage>,
    /// Foreground writes not yet shipped to the worker.
    local_changes: Mutex<BTreeMap<String, Option<String>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Foreground end of the engine. Cloning shares the same connection.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("pending", &self.inner.pending.len())
            .field("listeners", &self.inner.listeners.len())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

fn category_of(request: &Request) -> Option<OpCategory> {
    match request {
        Request::Set { .. }
        | Request::Update { .. }
        | Request::Transaction { .. }
        | Request::OnDisconnect { .. } => Some(OpCategory::Write),
        Request::On { .. } | Request::Once { .. } => Some(OpCategory::Read),
        Request::AuthWithCustomToken { .. }
        | Request::Unauth
        | Request::OnAuth { .. }
        | Request::OffAuth { .. } => Some(OpCategory::Auth),
        _ => None,
    }
}

/// The operation the rule simulator should replay for a failed request.
fn simulated_op(request: &Request) -> Option<SimulatedOp> {
    let (method, url, value) = match request {
        Request::Set { url, value } => ("set", url.clone(), Some(value.clone())),
        Request::Update { url, value } => ("update", url.clone(), Some(Value::Object(value.clone()))),
        Request::Transaction { url, new_value, .. } => {
            ("transaction", url.clone(), Some(new_value.clone()))
        }
        Request::On { query, .. } => ("on", query.url.clone(), None),
        Request::Once { query, .. } => ("once", query.url.clone(), None),
        _ => return None,
    };
    Some(SimulatedOp {
        method: method.to_owned(),
        url,
        value,
    })
}

impl Bridge {
    /// Create a bridge over `endpoint`. Nothing runs until [`Bridge::start`].
    pub fn new(
        endpoint: ClientEndpoint,
        options: BridgeOptions,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let (active, _) = watch::channel(true);
        Self {
            inner: Arc::new(BridgeInner {
                options,
                next_id: AtomicU64::new(0),
                next_callback: AtomicU64::new(0),
                outbox: Outbox::new(endpoint.outbound),
                inbound: Mutex::new(Some(endpoint.inbound)),
                active,
                pending: DashMap::new(),
                callbacks: DashMap::new(),
                listeners: DashMap::new(),
                slowness: SlownessTracker::new(),
                errors,
                auth: ArcSwap::from_pointee(Value::Null),
                storage,
                local_changes: Mutex::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the inbound dispatch loop and the keep-alive pinger.
    pub fn start(&self) {
        let Some(inbound) = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!("bridge already started");
            return;
        };

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(self.clone().run_inbound(inbound)));

        let interval = self.inner.options.ping_interval;
        if !interval.is_zero() {
            tasks.push(tokio::spawn(self.clone().run_pinger(interval)));
        }
        info!("bridge started");
    }

    /// Ship the foreground's local storage to the worker.
    pub async fn init(&self) -> Result<(), CoreError> {
        let storage = self.inner.storage.entries();
        self.send(Request::Init { storage }).result().await.map(drop)
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Queue a request and return a handle on its reply.
    pub fn send(&self, request: Request) -> PendingReply {
        self.flush_local_storage();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        let (sent_tx, sent_rx) = oneshot::channel();
        let pending = PendingReply {
            sent: Some(sent_rx),
            reply: reply_rx,
        };

        if self.inner.cancel.is_cancelled() || !self.inner.outbox.is_open() {
            let _ = reply_tx.send(Err(CoreError::Disconnected));
            return pending;
        }

        let message = Message::new(id, &request, false);
        debug!(id, msg = %message.msg, "queueing call");
        let slow = category_of(&request).map(|c| self.inner.slowness.start(c));
        self.inner.pending.insert(
            id,
            PendingCall {
                request,
                reply: reply_tx,
                sent: Some(sent_tx),
                slow,
            },
        );
        self.inner.outbox.push(message);
        pending
    }

    /// Queue a request that produces no replies.
    pub fn send_one_way(&self, request: Request) {
        self.flush_local_storage();
        self.post_one_way(request);
    }

    fn post_one_way(&self, request: Request) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let message = Message::new(id, &request, true);
        trace!(id, msg = %message.msg, "queueing one-way message");
        self.inner.outbox.push(message);
    }

    fn call(&self, request: Request) -> impl Future<Output = Result<Value, CoreError>> + Send + use<> {
        self.send(request).result()
    }

    pub fn set(
        &self,
        url: &str,
        value: Value,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let reply = self.call(Request::Set {
            url: url.to_owned(),
            value,
        });
        async move { reply.await.map(drop) }
    }

    /// Write several paths relative to `url` in one operation.
    pub fn update(
        &self,
        url: &str,
        values: Map<String, Value>,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let reply = self.call(Request::Update {
            url: url.to_owned(),
            value: values,
        });
        async move { reply.await.map(drop) }
    }

    /// One-shot read.
    pub fn once(
        &self,
        query: Query,
        event_type: EventType,
    ) -> impl Future<Output = Result<Snapshot, CoreError>> + Send + use<> {
        let reply = self.call(Request::Once { query, event_type });
        async move {
            serde_json::from_value(reply.await?).map_err(|e| CoreError::Protocol {
                message: format!("malformed snapshot: {e}"),
            })
        }
    }

    pub fn on_disconnect(
        &self,
        url: &str,
        op: DisconnectOp,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let reply = self.call(Request::OnDisconnect {
            url: url.to_owned(),
            op,
        });
        async move { reply.await.map(drop) }
    }

    pub fn bounce_connection(&self) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let reply = self.call(Request::BounceConnection);
        async move { reply.await.map(drop) }
    }

    /// Invoke a function exposed by the worker host.
    pub fn call_function(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, CoreError>> + Send + use<> {
        self.call(Request::Call {
            name: name.to_owned(),
            args,
        })
    }

    /// Run an optimistic transaction against the value at `url`.
    pub async fn transaction<F>(
        &self,
        url: &str,
        update: F,
        options: TransactionOptions,
    ) -> Result<TransactionResult, CoreError>
    where
        F: FnMut(&Value) -> Option<TransactionStep> + Send,
    {
        transaction::run(self, url, update, options).await
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Subscribe to `query`. The callback is live as soon as this returns;
    /// the future settles once the worker has registered the listener.
    pub fn on(
        &self,
        query: Query,
        event_type: EventType,
        options: ListenOptions,
        on_snapshot: SnapshotCallback,
        on_cancel: Option<CancelCallback>,
    ) -> impl Future<Output = Result<Subscription, CoreError>> + Send + use<> {
        let callback_id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed) + 1;
        let subscription = Subscription {
            callback_id,
            listener_key: query.listener_key(),
            query,
            event_type,
        };

        let handler = listener_callback(
            callback_id,
            Arc::downgrade(&self.inner),
            Arc::clone(&on_snapshot),
            on_cancel,
        );
        self.inner.callbacks.insert(callback_id, handler);
        self.inner.listeners.insert(
            callback_id,
            Registration {
                subscription: subscription.clone(),
                on_snapshot,
            },
        );

        let reply = self.call(Request::On {
            listener_key: subscription.listener_key.clone(),
            query: subscription.query.clone(),
            event_type,
            callback_id,
            options,
        });
        let inner = Arc::downgrade(&self.inner);
        async move {
            match reply.await {
                Ok(_) => Ok(subscription),
                Err(err) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.callbacks.remove(&callback_id);
                        inner.listeners.remove(&callback_id);
                    }
                    Err(err)
                }
            }
        }
    }

    /// Turn a subscription off. Its callback stops firing immediately.
    pub fn off(
        &self,
        subscription: &Subscription,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        self.inner.callbacks.remove(&subscription.callback_id);
        self.inner.listeners.remove(&subscription.callback_id);
        debug!(key = %subscription.listener_key, "listener off");
        let reply = self.call(Request::Off {
            listener_key: subscription.listener_key.clone(),
            query: subscription.query.clone(),
            event_type: subscription.event_type,
            callback_id: subscription.callback_id,
        });
        async move { reply.await.map(drop) }
    }

    /// Turn off every subscription on `query`, optionally only those of one
    /// event type.
    pub fn off_query(
        &self,
        query: &Query,
        event_type: Option<EventType>,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let key = query.listener_key();
        let matching = self.matching(move |r| {
            r.subscription.listener_key == key
                && event_type.is_none_or(|e| e == r.subscription.event_type)
        });
        self.off_all(matching)
    }

    /// Turn off every subscription backed by `callback`.
    pub fn off_callback(
        &self,
        callback: &SnapshotCallback,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let matching = self.matching(|r| Arc::ptr_eq(&r.on_snapshot, callback));
        self.off_all(matching)
    }

    fn matching(&self, predicate: impl Fn(&Registration) -> bool) -> Vec<Subscription> {
        self.inner
            .listeners
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.subscription.clone())
            .collect()
    }

    fn off_all(
        &self,
        subscriptions: Vec<Subscription>,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let replies: Vec<_> = subscriptions.iter().map(|s| self.off(s)).collect();
        async move {
            for result in join_all(replies).await {
                result?;
            }
            Ok(())
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // ── Auth ─────────────────────────────────────────────────────────

    pub fn auth_with_custom_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Value, CoreError>> + Send + use<> {
        let reply = self.call(Request::AuthWithCustomToken {
            token: token.to_owned(),
            options: None,
        });
        let inner = Arc::clone(&self.inner);
        async move {
            let auth = reply.await?;
            inner.auth.store(Arc::new(auth.clone()));
            Ok(auth)
        }
    }

    pub fn unauth(&self) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        let reply = self.call(Request::Unauth);
        let inner = Arc::clone(&self.inner);
        async move {
            reply.await?;
            inner.auth.store(Arc::new(Value::Null));
            Ok(())
        }
    }

    /// Subscribe to auth changes. The current auth is pushed first.
    pub fn on_auth(
        &self,
        callback: AuthCallback,
    ) -> impl Future<Output = Result<AuthSubscription, CoreError>> + Send + use<> {
        let callback_id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(&self.inner);
        let handler: CallbackFn = Arc::new(move |args: Vec<Value>| {
            let auth = args.into_iter().next().unwrap_or(Value::Null);
            if let Some(inner) = weak.upgrade() {
                inner.auth.store(Arc::new(auth.clone()));
            }
            callback(auth);
        });
        self.inner.callbacks.insert(callback_id, handler);
        let reply = self.call(Request::OnAuth { callback_id });
        async move { reply.await.map(|_| AuthSubscription(callback_id)) }
    }

    /// Stop delivering auth changes to a subscription. The callback is
    /// silenced at once; the future settles when the worker has released
    /// the store registration.
    pub fn off_auth(
        &self,
        subscription: AuthSubscription,
    ) -> impl Future<Output = Result<(), CoreError>> + Send + use<> {
        self.inner.callbacks.remove(&subscription.0);
        let reply = self.call(Request::OffAuth {
            callback_id: subscription.0,
        });
        async move { reply.await.map(drop) }
    }

    /// Latest auth payload seen by the bridge.
    pub fn auth(&self) -> Arc<Value> {
        self.inner.auth.load_full()
    }

    // ── Local storage ────────────────────────────────────────────────

    pub fn local_item(&self, key: &str) -> Option<String> {
        self.inner.storage.get_item(key)
    }

    /// Write to the foreground's local storage and mirror it on the worker.
    pub fn set_local_item(&self, key: &str, value: &str) {
        self.inner.storage.set_item(key, value);
        self.record_local(key.to_owned(), Some(value.to_owned()));
    }

    pub fn remove_local_item(&self, key: &str) {
        self.inner.storage.remove_item(key);
        self.record_local(key.to_owned(), None);
    }

    pub fn clear_local_storage(&self) {
        let keys: Vec<String> = self.inner.storage.entries().into_keys().collect();
        self.inner.storage.clear();
        for key in keys {
            self.record_local(key, None);
        }
    }

    /// Collect a write; the first one in a turn schedules the flush.
    fn record_local(&self, key: String, value: Option<String>) {
        let first = {
            let mut changes = self.inner.local_changes.lock().unwrap_or_else(PoisonError::into_inner);
            changes.insert(key, value);
            changes.len() == 1
        };
        if first {
            let bridge = self.clone();
            tokio::spawn(async move { bridge.flush_local_storage() });
        }
    }

    /// Ship collected writes as one `updateLocalStorage` message. Runs before
    /// every other outbound request so the worker sees writes in order.
    fn flush_local_storage(&self) {
        let mut changes = self.inner.local_changes.lock().unwrap_or_else(PoisonError::into_inner);
        if changes.is_empty() {
            return;
        }
        let items = std::mem::take(&mut *changes);
        trace!(count = items.len(), "forwarding local storage changes");
        self.post_one_way(Request::UpdateLocalStorage { items });
    }

    // ── Instrumentation ──────────────────────────────────────────────

    pub fn slowness(&self) -> &SlownessTracker {
        &self.inner.slowness
    }

    /// Every hydrated error, delivered once per rejection.
    pub fn errors(&self) -> broadcast::Receiver<Arc<CoreError>> {
        self.inner.errors.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        *self.inner.active.borrow()
    }

    /// Stop dispatching inbound replies and posting outbound messages.
    pub fn suspend(&self) {
        debug!("bridge suspended");
        self.inner.active.send_replace(false);
        self.inner.outbox.pause();
    }

    /// Replay buffered replies in order, then flush held messages.
    pub fn resume(&self) {
        debug!("bridge resumed");
        self.inner.active.send_replace(true);
        self.inner.outbox.resume();
    }

    /// Tear down the worker side and stop all bridge tasks.
    pub async fn destroy(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.call(Request::Destroy).await {
            debug!(error = %e, "destroy not confirmed");
        }
        self.shutdown();
    }

    /// Stop all bridge tasks and reject outstanding calls.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.fail_pending();
        self.inner.callbacks.clear();
        self.inner.listeners.clear();
        info!("bridge shut down");
    }

    // ── Inbound ──────────────────────────────────────────────────────

    async fn run_inbound(self, mut inbound: mpsc::UnboundedReceiver<ReplyBatch>) {
        let cancel = self.inner.cancel.clone();
        let mut active = self.inner.active.subscribe();
        let mut buffered: Vec<ReplyBatch> = Vec::new();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *active.borrow_and_update() {
                        for batch in buffered.drain(..) {
                            self.dispatch(batch);
                        }
                    }
                }

                batch = inbound.recv() => {
                    let Some(batch) = batch else {
                        warn!("worker channel closed");
                        self.fail_pending();
                        break;
                    };
                    buffered.push(batch);
                    if *active.borrow() {
                        for batch in buffered.drain(..) {
                            self.dispatch(batch);
                        }
                    }
                }
            }
        }
    }

    async fn run_pinger(self, interval: Duration) {
        let cancel = self.inner.cancel.clone();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.send_one_way(Request::Ping),
            }
        }
    }

    fn dispatch(&self, batch: ReplyBatch) {
        for reply in batch {
            match reply {
                Reply::Acknowledge { id } => {
                    if let Some(mut call) = self.inner.pending.get_mut(&id) {
                        if let Some(sent) = call.sent.take() {
                            let _ = sent.send(());
                        }
                    }
                }
                Reply::Resolve { id, result } => match self.inner.pending.remove(&id) {
                    Some((_, call)) => {
                        trace!(id, "call resolved");
                        drop(call.slow);
                        let _ = call.reply.send(Ok(result));
                    }
                    None => warn!(id, "resolve for unknown call"),
                },
                Reply::Reject { id, error } => match self.inner.pending.remove(&id) {
                    Some((_, call)) => self.reject(call, error),
                    None => warn!(id, "reject for unknown call"),
                },
                Reply::Callback { id, args } => {
                    let callback = self.inner.callbacks.get(&id).map(|c| Arc::clone(c.value()));
                    match callback {
                        Some(callback) => callback(args),
                        None => trace!(id, "callback no longer registered"),
                    }
                }
                Reply::UpdateLocalStorage { items } => {
                    trace!(count = items.len(), "applying local storage update");
                    self.inner.storage.apply(&items);
                }
            }
        }
    }

    fn reject(&self, call: PendingCall, error: WireError) {
        let PendingCall {
            request,
            reply,
            slow,
            ..
        } = call;
        drop(slow);
        let error = CoreError::from(error);
        debug!(error = %error, "call rejected");

        let simulation = match (&self.inner.options.simulation_token, error.is_permission_denied()) {
            (Some(token), true) => simulated_op(&request).map(|op| (token.clone(), op)),
            _ => None,
        };
        match simulation {
            None => self.deliver_error(reply, error),
            Some((token, op)) => {
                let bridge = self.clone();
                tokio::spawn(async move {
                    let error = bridge.hydrate(error, &token, op).await;
                    bridge.deliver_error(reply, error);
                });
            }
        }
    }

    /// Attach the security rule trace for `op` to a permission denial.
    async fn hydrate(&self, mut error: CoreError, token: &SecretString, op: SimulatedOp) -> CoreError {
        let timeout = self.inner.options.simulation_timeout;
        let simulate = self.call(Request::Simulate {
            token: token.expose_secret().to_owned(),
            op,
        });
        let trace = match tokio::time::timeout(timeout, simulate).await {
            Ok(Ok(Value::String(trace))) => trace,
            Ok(Ok(other)) => other.to_string(),
            Ok(Err(e)) => format!("Simulation failed: {e}"),
            Err(_) => format!("Simulated request timed out after {}ms", timeout.as_millis()),
        };
        if let CoreError::Remote { simulation, .. } = &mut error {
            *simulation = Some(trace);
        }
        error
    }

    fn deliver_error(&self, reply: oneshot::Sender<Result<Value, CoreError>>, error: CoreError) {
        let _ = self.inner.errors.send(Arc::new(error.clone()));
        let _ = reply.send(Err(error));
    }

    fn fail_pending(&self) {
        let ids: Vec<MessageId> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.inner.pending.remove(&id) {
                let _ = call.reply.send(Err(CoreError::Disconnected));
            }
        }
    }
}

fn listener_callback(
    callback_id: CallbackId,
    inner: Weak<BridgeInner>,
    on_snapshot: SnapshotCallback,
    on_cancel: Option<CancelCallback>,
) -> CallbackFn {
    Arc::new(move |args: Vec<Value>| {
        let mut args = args.into_iter();
        let snapshot = args.next().unwrap_or(Value::Null);
        if !snapshot.is_null() {
            match serde_json::from_value::<Snapshot>(snapshot) {
                Ok(snapshot) => on_snapshot(snapshot),
                Err(e) => warn!(callback_id, error = %e, "malformed snapshot"),
            }
            return;
        }

        let error = args
            .next()
            .and_then(|e| serde_json::from_value::<WireError>(e).ok())
            .map_or_else(
                || CoreError::Internal("listener cancelled".into()),
                CoreError::from,
            );
        warn!(callback_id, error = %error, "listener cancelled by worker");
        if let Some(inner) = inner.upgrade() {
            inner.callbacks.remove(&callback_id);
            inner.listeners.remove(&callback_id);
        }
        if let Some(on_cancel) = &on_cancel {
            on_cancel(error);
        }
    })
}

// ── Transactions over the bridge ─────────────────────────────────────

impl TransactionPort for Bridge {
    async fn fetch(&self, url: &str) -> Result<Value, CoreError> {
        Ok(self.once(Query::new(url), EventType::Value).await?.value)
    }

    async fn attempt(
        &self,
        url: &str,
        old_hash: &str,
        new_value: &Value,
    ) -> Result<AttemptReply, CoreError> {
        let reply = self
            .call(Request::Transaction {
                url: url.to_owned(),
                old_hash: old_hash.to_owned(),
                new_value: new_value.clone(),
            })
            .await?;
        serde_json::from_value(reply).map_err(|e| CoreError::Protocol {
            message: format!("malformed transaction reply: {e}"),
        })
    }
}
