//! `truss config`: inspect profiles and what they resolve to.

use serde::Serialize;
use serde_json::Value;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::commands::load_config;
use crate::error::CliError;
use crate::output;

const MASK: &str = "********";

/// Engine settings a profile resolves to, secrets reduced to presence.
#[derive(Debug, Serialize)]
struct Resolved {
    profile: String,
    ping_interval_secs: u64,
    simulation_timeout_ms: u64,
    sweep_interval_secs: u64,
    max_transaction_tries: u32,
    sync: bool,
    authenticated: bool,
}

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            let path = global
                .config
                .clone()
                .unwrap_or_else(truss_config::config_path);
            output::print(global.output, &Value::String(path.display().to_string()));
        }
        ConfigCommand::Show => {
            let mut config = load_config(global)?;
            for profile in config.profiles.values_mut() {
                if profile.auth_token.is_some() {
                    profile.auth_token = Some(MASK.into());
                }
            }
            output::print(global.output, &serde_json::to_value(&config)?);
        }
        ConfigCommand::Resolve => {
            let config = load_config(global)?;
            let (name, profile) = config.profile(global.profile.as_deref())?;
            let engine = truss_config::profile_to_engine_config(&config.defaults, &profile, &name)?;
            let resolved = Resolved {
                profile: name,
                ping_interval_secs: engine.ping_interval.as_secs(),
                simulation_timeout_ms: u64::try_from(engine.simulation_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                sweep_interval_secs: engine.sweep_interval.as_secs(),
                max_transaction_tries: engine.max_transaction_tries,
                sync: engine.sync_by_default,
                authenticated: engine.auth_token.is_some(),
            };
            output::print(global.output, &serde_json::to_value(&resolved)?);
        }
    }
    Ok(())
}
