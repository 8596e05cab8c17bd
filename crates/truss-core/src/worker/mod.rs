//! Background RPC server.
//!
//! A [`Fireworker`] serves one bridge connection: it decodes each inbound
//! message, runs the matching handler against the [`RemoteStore`] and posts
//! the outcome back. Messages are dispatched in arrival order; handlers run
//! concurrently, so a slow handler does not hold up the replies of faster
//! ones queued after it.
//!
//! Every message not marked one-way is acknowledged as soon as it is
//! dispatched and then settled by exactly one `resolve` or `reject`.

mod host;
mod local_storage;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use truss_api::store::{ListenerToken, RemoteStore, StoreEvent, StoreSnapshot};
use truss_api::transport::MessageBatch;
use truss_api::{Branch, CallbackId, Message, Reply, Request, Snapshot, WireError};
use uuid::Uuid;

pub use host::WorkerHost;
pub use local_storage::LocalStorageShim;

use crate::error::CoreError;
use crate::outbox::Outbox;
use crate::storage::KeyValueStorage;
use crate::transaction::AttemptReply;

/// What an exposed function sees of the worker that runs it.
pub struct CallContext<S> {
    /// Connection the call arrived on.
    pub instance: Uuid,
    pub store: Arc<S>,
    /// The connection's mirror of the foreground's local storage.
    pub storage: Arc<dyn KeyValueStorage>,
}

impl<S> Clone for CallContext<S> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance,
            store: Arc::clone(&self.store),
            storage: Arc::clone(&self.storage),
        }
    }
}

/// A named async function callable from the foreground.
pub type ExposedFn<S> =
    Arc<dyn Fn(CallContext<S>, Vec<Value>) -> BoxFuture<'static, Result<Value, CoreError>> + Send + Sync>;

pub(crate) type FunctionTable<S> = DashMap<String, ExposedFn<S>>;

struct ListenerTask {
    token: ListenerToken,
    task: JoinHandle<()>,
}

/// Milliseconds elapsed since `epoch`.
pub(crate) fn elapsed_ms(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_millis()).unwrap_or(u64::MAX)
}

pub(crate) struct Fireworker<S: RemoteStore> {
    id: Uuid,
    store: Arc<S>,
    functions: Arc<FunctionTable<S>>,
    outbox: Arc<Outbox<Reply>>,
    storage: Arc<LocalStorageShim>,
    listeners: DashMap<CallbackId, ListenerTask>,
    auth_listeners: DashMap<CallbackId, ListenerTask>,
    write_serial: Arc<AtomicU64>,
    touched: Arc<AtomicU64>,
    epoch: Instant,
    cancel: CancellationToken,
}

impl<S: RemoteStore> Fireworker<S> {
    pub(crate) fn new(
        id: Uuid,
        store: Arc<S>,
        functions: Arc<FunctionTable<S>>,
        outbound: mpsc::UnboundedSender<Vec<Reply>>,
        touched: Arc<AtomicU64>,
        epoch: Instant,
        cancel: CancellationToken,
    ) -> Self {
        let outbox = Outbox::new(outbound);
        Self {
            id,
            store,
            functions,
            storage: LocalStorageShim::new(Arc::clone(&outbox)),
            outbox,
            listeners: DashMap::new(),
            auth_listeners: DashMap::new(),
            write_serial: Arc::new(AtomicU64::new(0)),
            touched,
            epoch,
            cancel,
        }
    }

    /// Serve the connection until it closes, is destroyed or is reaped.
    pub(crate) async fn run(self, mut inbound: mpsc::UnboundedReceiver<MessageBatch>) {
        info!(instance = %self.id, "worker connected");
        let mut inflight = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                batch = inbound.recv() => {
                    let Some(batch) = batch else {
                        debug!(instance = %self.id, "bridge channel closed");
                        break;
                    };
                    self.touch();
                    for message in batch {
                        inflight.push(self.dispatch(message));
                    }
                }

                Some(()) = inflight.next(), if !inflight.is_empty() => {}
            }
        }

        drop(inflight);
        self.destroy().await;
    }

    fn touch(&self) {
        self.touched
            .store(elapsed_ms(self.epoch, Instant::now()), Ordering::Release);
    }

    fn next_serial(&self) -> u64 {
        self.write_serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn context(&self) -> CallContext<S> {
        CallContext {
            instance: self.id,
            store: Arc::clone(&self.store),
            storage: Arc::clone(&self.storage) as Arc<dyn KeyValueStorage>,
        }
    }

    async fn dispatch(&self, message: Message) {
        let Message { id, one_way, .. } = message;
        if !one_way {
            self.outbox.push(Reply::Acknowledge { id });
        }

        let result = match Request::decode(&message) {
            Ok(request) => {
                trace!(instance = %self.id, id, msg = %message.msg, "dispatching");
                self.handle(request).await
            }
            Err(e) => {
                error!(instance = %self.id, id, msg = %message.msg, error = %e, "cannot decode message");
                Err(CoreError::from(e))
            }
        };

        match (one_way, result) {
            (true, Err(e)) => debug!(id, error = %e, "one-way message failed"),
            (true, Ok(_)) => {}
            (false, Ok(result)) => self.outbox.push(Reply::Resolve { id, result }),
            (false, Err(e)) => self.outbox.push(Reply::Reject {
                id,
                error: WireError::from(&e),
            }),
        }
    }

    async fn handle(&self, request: Request) -> Result<Value, CoreError> {
        match request {
            Request::Init { storage } => {
                self.storage.init(storage);
                Ok(Value::Null)
            }
            Request::Call { name, args } => {
                let function = self.functions.get(&name).map(|f| Arc::clone(f.value()));
                let Some(function) = function else {
                    return Err(CoreError::Remote {
                        code: "function_not_found".into(),
                        message: format!("No function exposed as '{name}'"),
                        extra: serde_json::Map::new(),
                        simulation: None,
                    });
                };
                function(self.context(), args).await
            }
            Request::AuthWithCustomToken { token, .. } => {
                Ok(self.store.auth_with_custom_token(&token).await?)
            }
            Request::Unauth => {
                self.store.unauth().await;
                Ok(Value::Null)
            }
            Request::OnAuth { callback_id } => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let token = self.store.on_auth(tx).await;
                let outbox = Arc::clone(&self.outbox);
                let task = tokio::spawn(async move {
                    while let Some(auth) = rx.recv().await {
                        outbox.push(Reply::Callback {
                            id: callback_id,
                            args: vec![auth],
                        });
                    }
                });
                if let Some(previous) = self.auth_listeners.insert(callback_id, ListenerTask { token, task }) {
                    previous.task.abort();
                    self.store.off_auth(previous.token).await;
                }
                Ok(Value::Null)
            }
            Request::OffAuth { callback_id } => {
                match self.auth_listeners.remove(&callback_id) {
                    Some((_, listener)) => {
                        listener.task.abort();
                        self.store.off_auth(listener.token).await;
                    }
                    None => debug!(callback_id, "offAuth for unknown listener"),
                }
                Ok(Value::Null)
            }
            Request::Set { url, value } => {
                self.store.set(&url, value).await?;
                self.next_serial();
                Ok(Value::Null)
            }
            Request::Update { url, value } => {
                self.store.update(&url, value).await?;
                self.next_serial();
                Ok(Value::Null)
            }
            Request::On {
                query,
                event_type,
                callback_id,
                options,
                ..
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let token = self.store.on(&query, event_type, tx).await?;
                let task = tokio::spawn(forward_snapshots(
                    rx,
                    Arc::clone(&self.outbox),
                    Arc::clone(&self.write_serial),
                    callback_id,
                    options.sync,
                ));
                if let Some(previous) = self.listeners.insert(callback_id, ListenerTask { token, task }) {
                    warn!(callback_id, "replacing listener registered under the same callback");
                    previous.task.abort();
                    self.store.off(previous.token).await;
                }
                Ok(Value::Null)
            }
            Request::Off { callback_id, .. } => {
                match self.listeners.remove(&callback_id) {
                    Some((_, listener)) => {
                        listener.task.abort();
                        self.store.off(listener.token).await;
                    }
                    None => debug!(callback_id, "off for unknown listener"),
                }
                Ok(Value::Null)
            }
            Request::Once { query, event_type } => {
                let snapshot = self.store.once(&query, event_type).await?;
                let envelope = envelope(snapshot).with_write_serial(self.write_serial.load(Ordering::Acquire));
                to_json(&envelope)
            }
            Request::Transaction {
                url,
                old_hash,
                new_value,
            } => self.transaction(&url, old_hash, new_value).await,
            Request::OnDisconnect { url, op } => {
                self.store.on_disconnect(&url, op).await?;
                Ok(Value::Null)
            }
            Request::Simulate { token, op } => {
                Ok(Value::String(self.store.simulate(&token, &op).await?))
            }
            Request::BounceConnection => {
                self.store.bounce_connection().await?;
                Ok(Value::Null)
            }
            Request::UpdateLocalStorage { items } => {
                self.storage.apply_remote(&items);
                Ok(Value::Null)
            }
            Request::Ping => Ok(Value::Null),
            Request::Destroy => {
                self.cancel.cancel();
                Ok(Value::Null)
            }
        }
    }

    /// Commit `new_value` if the current value still hashes to `old_hash`.
    async fn transaction(
        &self,
        url: &str,
        old_hash: String,
        new_value: Value,
    ) -> Result<Value, CoreError> {
        let outcome = self
            .store
            .transaction(url, move |current| {
                (truss_api::hash(current) == old_hash).then(|| new_value.clone())
            })
            .await?;
        let reply = if outcome.committed {
            let serial = self.next_serial();
            AttemptReply::Committed {
                snapshot: Snapshot::new(url, outcome.value).with_write_serial(serial),
            }
        } else {
            AttemptReply::Stale {
                hash: truss_api::hash(&outcome.value),
                value: outcome.value,
            }
        };
        to_json(&reply)
    }

    /// Cancel every store registration held for this connection.
    async fn destroy(&self) {
        let listeners: Vec<CallbackId> = self.listeners.iter().map(|e| *e.key()).collect();
        for callback_id in listeners {
            if let Some((_, listener)) = self.listeners.remove(&callback_id) {
                listener.task.abort();
                self.store.off(listener.token).await;
            }
        }
        let auth: Vec<CallbackId> = self.auth_listeners.iter().map(|e| *e.key()).collect();
        for callback_id in auth {
            if let Some((_, listener)) = self.auth_listeners.remove(&callback_id) {
                listener.task.abort();
                self.store.off_auth(listener.token).await;
            }
        }
        info!(instance = %self.id, "worker destroyed");
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, CoreError> {
    serde_json::to_value(value).map_err(|e| CoreError::Internal(format!("cannot encode reply: {e}")))
}

/// Normalize a store snapshot into a wire envelope.
fn envelope(snapshot: StoreSnapshot) -> Snapshot {
    match snapshot.value {
        Ok(value) => Snapshot::new(snapshot.path, value),
        Err(e) => Snapshot::unreadable(snapshot.path, snapshot.exists, WireError::from(&e)),
    }
}

fn snapshot_callback(callback_id: CallbackId, snapshot: &Snapshot) -> Option<Reply> {
    match serde_json::to_value(snapshot) {
        Ok(envelope) => Some(Reply::Callback {
            id: callback_id,
            args: vec![envelope],
        }),
        Err(e) => {
            warn!(callback_id, error = %e, "cannot encode snapshot");
            None
        }
    }
}

/// Relay store events for one listener to the bridge.
///
/// In sync mode the first snapshot goes out whole; later snapshots are
/// reduced to the subpaths that changed.
async fn forward_snapshots(
    mut events: mpsc::UnboundedReceiver<StoreEvent>,
    outbox: Arc<Outbox<Reply>>,
    write_serial: Arc<AtomicU64>,
    callback_id: CallbackId,
    sync: bool,
) {
    let mut branch = sync.then(Branch::new);
    let mut first = true;

    while let Some(event) = events.recv().await {
        let snapshot = match event {
            StoreEvent::Snapshot(snapshot) => snapshot,
            StoreEvent::Cancelled(e) => {
                outbox.push(Reply::Callback {
                    id: callback_id,
                    args: vec![Value::Null, serde_json::to_value(WireError::from(&e)).unwrap_or_default()],
                });
                break;
            }
        };
        let serial = write_serial.load(Ordering::Acquire);

        let envelopes = match (&mut branch, snapshot.value) {
            (Some(branch), Ok(value)) => {
                let updates = branch.diff(&value, &snapshot.path);
                if first {
                    vec![Snapshot::new(snapshot.path, value)]
                } else {
                    updates.into_iter().map(|(path, value)| Snapshot::new(path, value)).collect()
                }
            }
            (None, Ok(value)) => vec![Snapshot::new(snapshot.path, value)],
            (_, Err(e)) => vec![Snapshot::unreadable(snapshot.path, snapshot.exists, WireError::from(&e))],
        };
        first = false;

        for envelope in envelopes {
            if let Some(reply) = snapshot_callback(callback_id, &envelope.with_write_serial(serial)) {
                outbox.push(reply);
            }
        }
    }
}
