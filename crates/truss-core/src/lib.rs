//! Split-context synchronization engine built on `truss-api`.
//!
//! A foreground context holds the reactive mirror and talks to a background
//! context that owns the remote store connection:
//!
//! - **[`Bridge`]**: Foreground RPC client. Batches messages once per
//!   scheduler turn, correlates replies by id, tracks slow operations and
//!   hydrates permission denials with a simulated rule trace.
//!
//! - **[`WorkerHost`]**: Background side. Runs one Fireworker per attached
//!   bridge, reaps idle connections and owns the exposed-function table.
//!
//! - **[`transaction`]**: Optimistic compare-and-set protocol with a
//!   bounded retry budget.
//!
//! - **[`Tree`]**: Reactive mirror of remote JSON. Mount rules give nodes a
//!   class, path variables, placeholders and computed properties that
//!   recompute when the paths they read change.
//!
//! - **[`Engine`]**: Facade wiring all of the above together with explicit
//!   startup and shutdown.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
mod outbox;
pub mod storage;
pub mod transaction;
pub mod tree;
pub mod worker;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{
    AuthCallback, AuthSubscription, Bridge, BridgeOptions, CancelCallback, OpCategory,
    PendingReply, SlowOpGuard, SlownessTracker, SnapshotCallback, Subscription,
};
pub use config::{DEFAULT_MAX_TRANSACTION_TRIES, EngineConfig};
pub use engine::{Connection, Engine, EngineState};
pub use error::CoreError;
pub use storage::{KeyValueStorage, MemoryStorage};
pub use transaction::{TransactionOptions, TransactionResult, TransactionStep};
pub use tree::{
    ComputeScope, ComputedStats, ComputedValue, Field, MountRule, Node, NodeId, PropertyStats,
    Tree, TreeError,
};
pub use worker::{CallContext, WorkerHost};
