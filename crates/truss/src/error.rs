//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with help text.

use miette::Diagnostic;
use thiserror::Error;

use truss_config::ConfigError;
use truss_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const PERMISSION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Engine ───────────────────────────────────────────────────────

    #[error("Permission denied: {message}")]
    #[diagnostic(code(truss::permission_denied), help("{trace}"))]
    PermissionDenied { message: String, trace: String },

    #[error("Store error ({code}): {message}")]
    #[diagnostic(code(truss::store))]
    Store { code: String, message: String },

    #[error("Transaction on {url} gave up after {tries} attempts")]
    #[diagnostic(
        code(truss::max_retries),
        help("The value kept changing underneath the transaction. Retry later.")
    )]
    MaxRetries { url: String, tries: u32 },

    #[error("{operation} timed out after {timeout_ms}ms")]
    #[diagnostic(code(truss::timeout))]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Engine error: {0}")]
    #[diagnostic(code(truss::engine))]
    Engine(String),

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(truss::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(
        code(truss::config),
        help("Check the config file: truss config path")
    )]
    Config(#[from] ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(truss::json), help("Check the JSON file contents and try again."))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PermissionDenied { .. } => exit_code::PERMISSION,
            Self::MaxRetries { .. } => exit_code::CONFLICT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::Json(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        if err.is_permission_denied() {
            let trace = err
                .simulation()
                .map_or_else(|| "No rule trace available.".to_owned(), str::to_owned);
            return Self::PermissionDenied {
                message: err.to_string(),
                trace,
            };
        }
        match err {
            CoreError::Remote { code, message, .. } => Self::Store { code, message },
            CoreError::MaxRetriesExceeded { url, tries } => Self::MaxRetries { url, tries },
            CoreError::Timeout {
                operation,
                timeout_ms,
            } => Self::Timeout {
                operation,
                timeout_ms,
            },
            other => Self::Engine(other.to_string()),
        }
    }
}
