// ── Runtime engine configuration ──
//
// Timing and retry knobs handed to the engine by its embedder. The core
// never reads configuration files; `truss-config` builds an `EngineConfig`
// from a profile and hands it in.

use std::time::Duration;

use secrecy::SecretString;

/// Attempts a transaction makes before giving up.
pub const DEFAULT_MAX_TRANSACTION_TRIES: u32 = 25;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between keep-alive pings from the bridge. Zero disables them.
    pub ping_interval: Duration,
    /// How long a permission-denied simulation may run before it is
    /// abandoned.
    pub simulation_timeout: Duration,
    /// Interval of the worker host's idle sweep.
    pub sweep_interval: Duration,
    /// Cap on transaction attempts.
    pub max_transaction_tries: u32,
    /// Forward only changed subpaths for listeners by default.
    pub sync_by_default: bool,
    /// Custom token used for authentication and rule simulation.
    pub auth_token: Option<SecretString>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            simulation_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            max_transaction_tries: DEFAULT_MAX_TRANSACTION_TRIES,
            sync_by_default: false,
            auth_token: None,
        }
    }
}

impl EngineConfig {
    /// Idle time after which a worker connection is reaped.
    pub fn idle_threshold(&self) -> Duration {
        self.sweep_interval * 3
    }
}
