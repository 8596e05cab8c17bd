// ── Engine facade ──
//
// Wires the foreground (bridge + tree) to the background (worker host +
// remote store) over an in-process transport. Each engine owns its own
// function table, statistics and mount rules, so independent engines never
// share state.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};
use truss_api::store::{EventType, RemoteStore};
use truss_api::transport::{self, ServerEndpoint};
use truss_api::{ListenOptions, Query, Snapshot};

use crate::bridge::{Bridge, BridgeOptions, CancelCallback, SnapshotCallback, Subscription};
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::storage::{KeyValueStorage, MemoryStorage};
use crate::transaction::{TransactionOptions, TransactionResult, TransactionStep};
use crate::tree::{ComputedStats, MountRule, Tree};
use crate::worker::{CallContext, WorkerHost};

/// Lifecycle of an engine, observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

/// A remote listener feeding the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    subscription: Subscription,
}

impl Connection {
    pub fn url(&self) -> &str {
        &self.subscription.query().url
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

struct EngineInner<S: RemoteStore> {
    config: EngineConfig,
    host: WorkerHost<S>,
    bridge: Bridge,
    server: Mutex<Option<ServerEndpoint>>,
    tree: Arc<Mutex<Tree>>,
    stats: Arc<ComputedStats>,
    state: watch::Sender<EngineState>,
}

/// Synchronization engine: a bridge, a worker host and the mirror they feed.
///
/// Cheaply cloneable. Nothing runs until [`Engine::start`].
pub struct Engine<S: RemoteStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: RemoteStore> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RemoteStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &*self.inner.state.borrow())
            .field("bridge", &self.inner.bridge)
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig, mounts: Vec<MountRule>) -> Result<Self, CoreError> {
        Self::with_storage(store, config, mounts, Arc::new(MemoryStorage::new()))
    }

    /// Build an engine whose foreground local storage is `storage`.
    pub fn with_storage(
        store: S,
        config: EngineConfig,
        mounts: Vec<MountRule>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self, CoreError> {
        if config.max_transaction_tries == 0 {
            return Err(CoreError::Config {
                message: "max_transaction_tries must be at least 1".into(),
            });
        }
        if config.sweep_interval.is_zero() {
            return Err(CoreError::Config {
                message: "sweep_interval must be non-zero".into(),
            });
        }
        let stats = Arc::new(ComputedStats::new());
        let tree = Tree::new(mounts, Arc::clone(&stats))?;
        let (client, server) = transport::channel();
        let bridge = Bridge::new(client, BridgeOptions::from(&config), storage);
        let host = WorkerHost::new(store, config.sweep_interval);
        let (state, _) = watch::channel(EngineState::Idle);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                host,
                bridge,
                server: Mutex::new(Some(server)),
                tree: Arc::new(Mutex::new(tree)),
                stats,
                state,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Attach the worker, start both sides and authenticate if a token is
    /// configured.
    pub async fn start(&self) -> Result<(), CoreError> {
        let server = self
            .inner
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| CoreError::Internal("engine already started".into()))?;

        self.inner.host.start();
        let instance = self.inner.host.attach(server);
        self.inner.bridge.start();
        self.inner.bridge.init().await?;

        if let Some(token) = &self.inner.config.auth_token {
            self.inner
                .bridge
                .auth_with_custom_token(token.expose_secret())
                .await?;
        }

        self.inner.state.send_replace(EngineState::Running);
        info!(instance = %instance, "engine started");
        Ok(())
    }

    /// Destroy the worker side and stop every background task.
    pub async fn shutdown(&self) {
        if *self.inner.state.borrow() == EngineState::Stopped {
            return;
        }
        self.inner.bridge.destroy().await;
        self.inner.host.shutdown();
        self.inner.state.send_replace(EngineState::Stopped);
        info!("engine stopped");
    }

    /// Start, run `f`, shut down.
    pub async fn oneshot<F, Fut, T>(
        store: S,
        config: EngineConfig,
        mounts: Vec<MountRule>,
        f: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce(Engine<S>) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut config = config;
        config.ping_interval = std::time::Duration::ZERO;

        let engine = Self::new(store, config, mounts)?;
        engine.start().await?;
        let result = f(engine.clone()).await;
        engine.shutdown().await;
        result
    }

    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    // ── Mirror ───────────────────────────────────────────────────────

    /// Listen to `query` and plant every snapshot into the mirror.
    pub async fn connect(&self, query: Query) -> Result<Connection, CoreError> {
        let url = query.url.clone();
        let tree = Arc::clone(&self.inner.tree);
        let on_snapshot: SnapshotCallback = Arc::new(move |snapshot: Snapshot| {
            if let Some(err) = &snapshot.value_error {
                warn!(path = %snapshot.path, error = %err.message, "snapshot not readable");
                return;
            }
            let mut tree = tree.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = tree.plant(&snapshot.path, &snapshot.value) {
                warn!(path = %snapshot.path, error = %e, "failed to plant snapshot");
            }
        });
        let on_cancel: CancelCallback = Arc::new(move |e: CoreError| {
            warn!(url = %url, error = %e, "connection cancelled by the store");
        });

        let options = ListenOptions {
            sync: self.inner.config.sync_by_default,
        };
        let subscription = self
            .inner
            .bridge
            .on(query, EventType::Value, options, on_snapshot, Some(on_cancel))
            .await?;
        debug!(url = %subscription.query().url, "connected");
        Ok(Connection { subscription })
    }

    /// Stop listening and drop the mirrored data under the connection.
    pub async fn disconnect(&self, connection: Connection) -> Result<(), CoreError> {
        let result = self.inner.bridge.off(&connection.subscription).await;
        self.tree_mut(|tree| tree.plant(connection.url(), &Value::Null))?;
        result
    }

    /// Run `f` against the mirror.
    pub fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        let tree = self.inner.tree.lock().unwrap_or_else(PoisonError::into_inner);
        f(&tree)
    }

    fn tree_mut<R>(&self, f: impl FnOnce(&mut Tree) -> R) -> R {
        let mut tree = self.inner.tree.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut tree)
    }

    /// JSON view of the mirror at `path`.
    pub fn value(&self, path: &str) -> Value {
        self.with_tree(|tree| tree.value(path))
    }

    /// Assign a local field on a mirrored node.
    pub fn assign(&self, node_path: &str, name: &str, value: Value) -> Result<(), CoreError> {
        self.tree_mut(|tree| tree.assign(node_path, name, value))
            .map_err(CoreError::from)
    }

    /// Mirror version, bumped after every mutation.
    pub fn changes(&self) -> WatchStream<u64> {
        WatchStream::new(self.with_tree(Tree::subscribe))
    }

    /// Resolve once `predicate` holds for the mirror.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&Tree) -> bool) {
        let mut version = self.with_tree(Tree::subscribe);
        loop {
            if self.with_tree(&mut predicate) {
                return;
            }
            if version.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn stats(&self) -> &Arc<ComputedStats> {
        &self.inner.stats
    }

    // ── Remote operations ────────────────────────────────────────────

    pub async fn set(&self, url: &str, value: Value) -> Result<(), CoreError> {
        self.inner.bridge.set(url, value).await
    }

    pub async fn update(&self, url: &str, values: Map<String, Value>) -> Result<(), CoreError> {
        self.inner.bridge.update(url, values).await
    }

    pub async fn once(&self, query: Query) -> Result<Snapshot, CoreError> {
        self.inner.bridge.once(query, EventType::Value).await
    }

    /// Optimistic transaction with the configured retry cap.
    pub async fn transaction<F>(&self, url: &str, update: F, safe_abort: bool) -> Result<TransactionResult, CoreError>
    where
        F: FnMut(&Value) -> Option<TransactionStep> + Send,
    {
        let options = TransactionOptions {
            safe_abort,
            max_tries: self.inner.config.max_transaction_tries,
        };
        self.inner.bridge.transaction(url, update, options).await
    }

    /// Invoke a function exposed on the worker host.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CoreError> {
        self.inner.bridge.call_function(name, args).await
    }

    /// Expose `function` on the worker host under `name`.
    pub fn expose<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(CallContext<S>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        self.inner.host.expose(name, function);
    }

    // ── Parts ────────────────────────────────────────────────────────

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    pub fn host(&self) -> &WorkerHost<S> {
        &self.inner.host
    }
}
