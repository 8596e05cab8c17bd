//! Content hashing and structural diffs of JSON documents.

use std::path::Path;

use serde_json::{Map, Value};
use truss_api::Branch;

use crate::cli::{DiffArgs, GlobalOpts};
use crate::commands::read_json;
use crate::error::CliError;
use crate::output;

pub fn hash(file: &Path, global: &GlobalOpts) -> Result<(), CliError> {
    let value = read_json(file)?;
    output::print(global.output, &Value::String(truss_api::hash(&value)));
    Ok(())
}

/// Print the writes that turn `old` into `new`, keyed by absolute path.
pub fn diff(args: &DiffArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let old = read_json(&args.old)?;
    let new = read_json(&args.new)?;

    let mut branch = Branch::new();
    branch.diff(&old, &args.at);
    let updates: Map<String, Value> = branch.diff(&new, &args.at).into_iter().collect();

    output::print(global.output, &Value::Object(updates));
    Ok(())
}
