use serde_json::{Map, Value};
use thiserror::Error;

/// Store error code reported when security rules reject an operation.
pub const PERMISSION_DENIED: &str = "permission_denied";

/// Top-level error type for the `truss-api` crate.
///
/// Covers the remote store adapter, the wire protocol and the transport.
/// `truss-core` maps these into engine-level errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    // ── Remote store ────────────────────────────────────────────────
    /// Security rules rejected the operation.
    #[error("Permission denied: {operation} at {path}")]
    PermissionDenied { operation: String, path: String },

    /// The store rejected the operation for any other reason.
    #[error("Store error ({code}): {message}")]
    Store {
        code: String,
        message: String,
        /// Diagnostic extras carried by the store's own error object.
        extra: Map<String, Value>,
    },

    /// Listener was cancelled by the store (e.g. revoked read access).
    #[error("Listener cancelled at {path}: {reason}")]
    ListenerCancelled { path: String, reason: String },

    /// Operation not supported by this store adapter.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    // ── Protocol ────────────────────────────────────────────────────
    /// Unknown message type; the two contexts disagree on the protocol.
    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    /// A message of a known type carried malformed fields.
    #[error("Malformed {msg} message: {reason}")]
    Malformed { msg: String, reason: String },

    /// Path or key could not be parsed.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ── Transport ───────────────────────────────────────────────────
    /// The cross-context channel has been dropped.
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Machine-readable error code, used for classification on the far side
    /// of the channel.
    pub fn code(&self) -> &str {
        match self {
            Self::PermissionDenied { .. } => PERMISSION_DENIED,
            Self::Store { code, .. } => code,
            Self::ListenerCancelled { .. } => "listener_cancelled",
            Self::Unsupported(_) => "unsupported",
            Self::UnknownMessage(_) => "unknown_message",
            Self::Malformed { .. } => "malformed_message",
            Self::InvalidPath(_) => "invalid_path",
            Self::ChannelClosed => "channel_closed",
        }
    }

    /// Returns `true` if security rules rejected the operation.
    pub fn is_permission_denied(&self) -> bool {
        self.code() == PERMISSION_DENIED
    }

    /// Returns `true` if this error signals a protocol mismatch between
    /// the two contexts.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::UnknownMessage(_) | Self::Malformed { .. })
    }
}
