//! `truss demo`: run the engine against a seeded in-memory store.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};
use truss_api::{Access, MemoryStore, Query, path};
use truss_core::{CoreError, Engine, TransactionStep};

use crate::cli::{DemoArgs, GlobalOpts};
use crate::commands::{load_config, read_json};
use crate::error::CliError;
use crate::output;

/// How long the mirror may take to catch up with the store.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle(args: DemoArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = load_config(global)?;
    let (profile_name, profile) = config.profile(global.profile.as_deref())?;
    let mut engine_config =
        truss_config::profile_to_engine_config(&config.defaults, &profile, &profile_name)?;
    if args.sync {
        engine_config.sync_by_default = true;
    }

    let seed = match args.seed.as_ref().or(profile.seed.as_ref()) {
        Some(file) => read_json(file)?,
        None => Value::Null,
    };
    let sets = args
        .sets
        .iter()
        .map(|raw| parse_set(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let mut store = MemoryStore::with_value(seed);
    for prefix in &args.deny_writes {
        store = store.with_rule(prefix, Access::Allow, Access::Deny);
    }
    let reference = store.clone();
    let listen = path::normalize(&args.listen);
    let increments = args.increments.clone();

    info!(profile = %profile_name, listen = %listen, "running demo");
    let (value, stats) = Engine::oneshot(store, engine_config, Vec::new(), |engine| async move {
        let connection = engine.connect(Query::new(&listen)).await?;

        for (url, value) in sets {
            debug!(url = %url, "set");
            engine.set(&url, value).await?;
        }
        for url in &increments {
            let result = engine
                .transaction(
                    url,
                    |current| {
                        let next = current.as_i64().unwrap_or(0).saturating_add(1);
                        Some(TransactionStep::Write(json!(next)))
                    },
                    false,
                )
                .await?;
            debug!(url = %url, tries = result.tries, "incremented");
        }

        let expected = canonical(reference.value(&listen));
        let settled = tokio::time::timeout(
            SETTLE_TIMEOUT,
            engine.wait_for(|tree| canonical(tree.value(&listen)) == expected),
        )
        .await;
        if settled.is_err() {
            return Err(CoreError::Timeout {
                operation: format!("mirroring {listen}"),
                timeout_ms: u64::try_from(SETTLE_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let value = engine.value(&listen);
        let stats = engine.stats().snapshot();
        engine.disconnect(connection).await?;
        Ok((value, stats))
    })
    .await?;

    output::print(global.output, &value);
    if args.stats {
        let stats = serde_json::to_value(stats.into_iter().collect::<BTreeMap<_, _>>())?;
        output::print(global.output, &stats);
    }
    Ok(())
}

/// Parse `PATH=JSON`. A value that is not valid JSON is taken as a string.
fn parse_set(raw: &str) -> Result<(String, Value), CliError> {
    let Some((url, value)) = raw.split_once('=') else {
        return Err(CliError::Validation {
            field: "--set".into(),
            reason: format!("expected PATH=JSON, got '{raw}'"),
        });
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((path::normalize(url), value))
}

/// Stored form of a value: arrays as index-keyed objects, no empty containers.
fn canonical(value: Value) -> Value {
    match path::prune(value) {
        Value::Array(items) => canonical(Value::Object(path::array_to_map(items))),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, canonical(v))).collect()),
        other => other,
    }
}
