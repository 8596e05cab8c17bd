// ── Core error types ──
//
// Errors surfaced by the engine. Wire-level failures arrive as
// `WireError`s or `truss_api::Error`s and are translated here into the
// engine's taxonomy: protocol mismatches, remote rejections, exhausted
// transactions, timeouts and tree invariant violations.

use serde_json::{Map, Value};
use thiserror::Error;
use truss_api::WireError;
use truss_api::error::PERMISSION_DENIED;

use crate::tree::TreeError;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    // ── Protocol errors ──────────────────────────────────────────────
    /// The two contexts disagree on the message protocol.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Remote errors ────────────────────────────────────────────────
    #[error("Remote error ({code}): {message}")]
    Remote {
        code: String,
        message: String,
        /// Diagnostic properties carried by the remote error.
        extra: Map<String, Value>,
        /// Security rule trace attached after a permission denial.
        simulation: Option<String>,
    },

    // ── Transaction errors ───────────────────────────────────────────
    #[error("Transaction at {url} gave up after {tries} attempts")]
    MaxRetriesExceeded { url: String, tries: u32 },

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    // ── Mirror errors ────────────────────────────────────────────────
    #[error(transparent)]
    Tree(#[from] TreeError),

    // ── Connection errors ────────────────────────────────────────────
    #[error("Worker disconnected")]
    Disconnected,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Machine-readable code for remote errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns `true` if the store's security rules rejected the operation.
    pub fn is_permission_denied(&self) -> bool {
        self.code() == Some(PERMISSION_DENIED)
    }

    /// Security rule trace, if the error was hydrated with one.
    pub fn simulation(&self) -> Option<&str> {
        match self {
            Self::Remote { simulation, .. } => simulation.as_deref(),
            _ => None,
        }
    }
}

// ── Conversion from wire and transport errors ────────────────────────

impl From<WireError> for CoreError {
    fn from(err: WireError) -> Self {
        if err.name == "ProtocolError" {
            return Self::Protocol {
                message: err.message,
            };
        }
        Self::Remote {
            code: err.code.unwrap_or_else(|| "unknown".into()),
            message: err.message,
            extra: err.extra,
            simulation: None,
        }
    }
}

impl From<truss_api::Error> for CoreError {
    fn from(err: truss_api::Error) -> Self {
        match err {
            truss_api::Error::ChannelClosed => Self::Disconnected,
            truss_api::Error::UnknownMessage(_) | truss_api::Error::Malformed { .. } => {
                Self::Protocol {
                    message: err.to_string(),
                }
            }
            other => WireError::from(&other).into(),
        }
    }
}

impl From<&CoreError> for WireError {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::Protocol { message } => WireError::new("ProtocolError", message.clone()),
            CoreError::Remote {
                code,
                message,
                extra,
                simulation,
            } => {
                let mut wire = WireError::new("RemoteError", message.clone()).with_code(code.clone());
                wire.extra.clone_from(extra);
                if let Some(trace) = simulation {
                    wire = wire.with_extra("simulation", Value::String(trace.clone()));
                }
                wire
            }
            CoreError::MaxRetriesExceeded { .. } => {
                WireError::new("MaxRetriesExceeded", err.to_string()).with_code("max_retries")
            }
            CoreError::Timeout { .. } => {
                WireError::new("TimeoutError", err.to_string()).with_code("timeout")
            }
            CoreError::Tree(_) => WireError::new("TreeError", err.to_string()),
            CoreError::Disconnected | CoreError::Config { .. } | CoreError::Internal(_) => {
                WireError::new("Error", err.to_string())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_maps_to_remote() {
        let err: CoreError = truss_api::Error::PermissionDenied {
            operation: "set".into(),
            path: "/x".into(),
        }
        .into();
        assert!(err.is_permission_denied());
        let CoreError::Remote { extra, .. } = &err else {
            panic!("expected remote error, got {err:?}");
        };
        assert_eq!(extra.get("path"), Some(&Value::String("/x".into())));
    }

    #[test]
    fn protocol_errors_stay_protocol_errors() {
        let err: CoreError = truss_api::Error::UnknownMessage("warp".into()).into();
        assert!(matches!(err, CoreError::Protocol { .. }));
        let wire = WireError::new("ProtocolError", "Unknown message type: warp");
        assert!(matches!(CoreError::from(wire), CoreError::Protocol { .. }));
    }

    #[test]
    fn closed_channel_is_a_disconnect() {
        assert_eq!(CoreError::from(truss_api::Error::ChannelClosed), CoreError::Disconnected);
    }
}
