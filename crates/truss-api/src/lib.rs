// truss-api: wire protocol, path utilities and the remote store adapter contract.
//
// Everything that crosses the boundary between the foreground (bridge) and the
// background (worker) contexts is defined here, together with the pure helpers
// both sides share: key escaping, canonical value hashing, push-key generation
// and the structural differ used by sync-mode listeners.

pub mod branch;
pub mod error;
pub mod escape;
pub mod hash;
pub mod key_gen;
pub mod message;
pub mod path;
pub mod query;
pub mod store;
pub mod transport;

pub use branch::{Branch, Updates};
pub use error::Error;
pub use escape::{escape_key, unescape_key};
pub use hash::hash;
pub use key_gen::KeyGenerator;
pub use message::{
    CallbackId, ListenOptions, Message, MessageId, MessageKind, Reply, Request, Snapshot, WireError,
};
pub use query::{OrderBy, Query, QueryTerms};
pub use store::{
    Access, DisconnectOp, EventType, ListenerToken, MemoryStore, RemoteStore, SimulatedOp,
    StoreEvent, StoreSnapshot, TransactionOutcome,
};
pub use transport::{ClientEndpoint, MessageBatch, ReplyBatch, ServerEndpoint};
