// ── Worker host ──
//
// Owns the remote store, the table of exposed functions and one Fireworker
// per attached bridge. A periodic sweep reaps connections that have been
// idle for three sweep intervals. The sweep measures how late it actually
// ran and widens the idle threshold by that gap, so timer jitter never
// reaps a connection early.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use truss_api::store::RemoteStore;
use truss_api::transport::ServerEndpoint;
use uuid::Uuid;

use super::{CallContext, Fireworker, FunctionTable, elapsed_ms};
use crate::error::CoreError;

struct Instance {
    touched: Arc<AtomicU64>,
    cancel: CancellationToken,
}

struct HostInner<S: RemoteStore> {
    store: Arc<S>,
    functions: Arc<FunctionTable<S>>,
    instances: DashMap<Uuid, Instance>,
    sweep_interval: Duration,
    epoch: Instant,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Background side of the engine.
pub struct WorkerHost<S: RemoteStore> {
    inner: Arc<HostInner<S>>,
}

impl<S: RemoteStore> Clone for WorkerHost<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RemoteStore> std::fmt::Debug for WorkerHost<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost")
            .field("instances", &self.inner.instances.len())
            .field("functions", &self.inner.functions.len())
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> WorkerHost<S> {
    pub fn new(store: S, sweep_interval: Duration) -> Self {
        Self {
            inner: Arc::new(HostInner {
                store: Arc::new(store),
                functions: Arc::new(DashMap::new()),
                instances: DashMap::new(),
                sweep_interval,
                epoch: Instant::now(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Expose `function` to the foreground under `name`.
    pub fn expose<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(CallContext<S>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        let name = name.into();
        debug!(name = %name, "exposing function");
        self.inner
            .functions
            .insert(name, Arc::new(move |ctx, args| function(ctx, args).boxed()));
    }

    /// Start the idle sweep.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_sweeper().await });
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Serve a new bridge connection. Returns the worker's instance id.
    pub fn attach(&self, endpoint: ServerEndpoint) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = self.inner.cancel.child_token();
        let touched = Arc::new(AtomicU64::new(elapsed_ms(self.inner.epoch, Instant::now())));
        let worker = Fireworker::new(
            id,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.functions),
            endpoint.outbound,
            Arc::clone(&touched),
            self.inner.epoch,
            cancel.clone(),
        );
        self.inner.instances.insert(id, Instance { touched, cancel });

        let host = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            worker.run(endpoint.inbound).await;
            if let Some(host) = host.upgrade() {
                host.instances.remove(&id);
            }
        });
        id
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    /// Destroy every worker and stop the sweep.
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
        info!("worker host shut down");
    }
}

impl<S: RemoteStore> HostInner<S> {
    async fn run_sweeper(&self) {
        let interval = self.sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_sweep = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let gap = now.saturating_duration_since(last_sweep).saturating_sub(interval);
                    last_sweep = now;
                    self.sweep(now, interval * 3 + gap);
                }
            }
        }
    }

    /// Reap every instance idle for longer than `threshold`.
    fn sweep(&self, now: Instant, threshold: Duration) {
        let now_ms = elapsed_ms(self.epoch, now);
        let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        let idle: Vec<Uuid> = self
            .instances
            .iter()
            .filter(|e| now_ms.saturating_sub(e.touched.load(Ordering::Acquire)) > threshold_ms)
            .map(|e| *e.key())
            .collect();

        for id in idle {
            if let Some((_, instance)) = self.instances.remove(&id) {
                warn!(instance = %id, "reaping idle worker");
                instance.cancel.cancel();
            }
        }
    }
}
