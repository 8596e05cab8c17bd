//! Configuration profiles for truss.
//!
//! TOML profiles, auth-token resolution (env + keyring + plaintext) and
//! translation to `truss_core::EngineConfig`. The core never reads files;
//! embedders load a profile here and hand the engine its config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use truss_core::{DEFAULT_MAX_TRANSACTION_TRIES, EngineConfig};

const KEYRING_SERVICE: &str = "truss";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown profile '{0}'")]
    UnknownProfile(String),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_simulation_timeout")]
    pub simulation_timeout_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_max_tries")]
    pub max_transaction_tries: u32,

    #[serde(default)]
    pub sync: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            simulation_timeout_ms: default_simulation_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_transaction_tries: default_max_tries(),
            sync: false,
        }
    }
}

fn default_ping_interval() -> u64 {
    60
}
fn default_simulation_timeout() -> u64 {
    5_000
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_max_tries() -> u32 {
    DEFAULT_MAX_TRANSACTION_TRIES
}

/// A named profile. Unset fields fall back to [`Defaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    pub ping_interval_secs: Option<u64>,
    pub simulation_timeout_ms: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub max_transaction_tries: Option<u32>,
    pub sync: Option<bool>,

    /// Custom auth token (plaintext; prefer keyring or env var).
    pub auth_token: Option<String>,

    /// Environment variable holding the auth token.
    pub auth_token_env: Option<String>,

    /// JSON file seeding the in-memory store of `truss demo`.
    pub seed: Option<PathBuf>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "truss", "truss").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("truss");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path and the environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` and `TRUSS_*` environment variables.
///
/// Nested keys use a double underscore: `TRUSS_DEFAULTS__SYNC=true`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TRUSS_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if nothing can be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

// ── Profiles ────────────────────────────────────────────────────────

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    ///
    /// A missing default profile yields an empty one, so a bare install
    /// runs on defaults.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, Profile), ConfigError> {
        match name {
            Some(name) => self
                .profiles
                .get(name)
                .cloned()
                .map(|p| (name.to_owned(), p))
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_owned())),
            None => {
                let name = self.default_profile.clone().unwrap_or_else(|| "default".into());
                let profile = self.profiles.get(&name).cloned().unwrap_or_default();
                Ok((name, profile))
            }
        }
    }
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the custom auth token: env var, then keyring, then plaintext.
pub fn resolve_auth_token(profile: &Profile, profile_name: &str) -> Option<SecretString> {
    // 1. Profile's auth_token_env → env var lookup
    if let Some(ref env_name) = profile.auth_token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/auth-token")) {
        if let Ok(secret) = entry.get_password() {
            return Some(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    profile.auth_token.clone().map(SecretString::from)
}

/// Build an `EngineConfig` from a profile layered over the defaults.
pub fn profile_to_engine_config(
    defaults: &Defaults,
    profile: &Profile,
    profile_name: &str,
) -> Result<EngineConfig, ConfigError> {
    let max_transaction_tries = profile
        .max_transaction_tries
        .unwrap_or(defaults.max_transaction_tries);
    if max_transaction_tries == 0 {
        return Err(ConfigError::Validation {
            field: "max_transaction_tries".into(),
            reason: "must be at least 1".into(),
        });
    }

    let sweep_interval_secs = profile
        .sweep_interval_secs
        .unwrap_or(defaults.sweep_interval_secs);
    if sweep_interval_secs == 0 {
        return Err(ConfigError::Validation {
            field: "sweep_interval_secs".into(),
            reason: "must be at least 1".into(),
        });
    }

    Ok(EngineConfig {
        ping_interval: Duration::from_secs(
            profile.ping_interval_secs.unwrap_or(defaults.ping_interval_secs),
        ),
        simulation_timeout: Duration::from_millis(
            profile
                .simulation_timeout_ms
                .unwrap_or(defaults.simulation_timeout_ms),
        ),
        sweep_interval: Duration::from_secs(sweep_interval_secs),
        max_transaction_tries,
        sync_by_default: profile.sync.unwrap_or(defaults.sync),
        auth_token: resolve_auth_token(profile, profile_name),
    })
}
