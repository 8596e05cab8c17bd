//! Push-key generation and key escaping.

use serde_json::Value;
use truss_api::{KeyGenerator, escape_key, unescape_key};

use crate::cli::{GlobalOpts, KeyArgs};
use crate::error::CliError;
use crate::output;

pub fn generate(args: &KeyArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if args.count == 0 {
        return Err(CliError::Validation {
            field: "count".into(),
            reason: "must be at least 1".into(),
        });
    }

    let mut generator = KeyGenerator::with_clock_offset(args.offset_ms);
    let keys: Vec<Value> = (0..args.count)
        .map(|_| {
            let key = match args.at_ms {
                Some(at) => generator.generate_at(at),
                None => generator.generate(),
            };
            Value::String(key)
        })
        .collect();

    output::print(global.output, &Value::Array(keys));
    Ok(())
}

pub fn escape(key: &str, global: &GlobalOpts) -> Result<(), CliError> {
    output::print(global.output, &Value::String(escape_key(key)));
    Ok(())
}

pub fn unescape(key: &str, global: &GlobalOpts) -> Result<(), CliError> {
    output::print(global.output, &Value::String(unescape_key(key)));
    Ok(())
}
