//! Command handlers, one module per command group.

pub mod config_cmd;
pub mod demo;
pub mod json;
pub mod keys;

use std::io::Read;
use std::path::Path;

use serde_json::Value;
use truss_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the config from `--config`, or the platform path.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = global
        .config
        .clone()
        .unwrap_or_else(truss_config::config_path);
    Ok(truss_config::load_config_from(&path)?)
}

/// Read a JSON document from a file, or stdin for `-`.
pub fn read_json(path: &Path) -> Result<Value, CliError> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&text)?)
}
