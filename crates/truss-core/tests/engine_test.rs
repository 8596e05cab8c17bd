#![allow(clippy::unwrap_used)]
// End-to-end tests: a full engine (bridge + worker host + in-memory store).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};
use truss_api::store::{Access, MemoryStore};
use truss_api::Query;
use truss_core::{
    ComputedValue, CoreError, Engine, EngineConfig, EngineState, KeyValueStorage, MountRule,
    TransactionStep, Tree, TreeError,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> EngineConfig {
    EngineConfig {
        ping_interval: Duration::ZERO,
        ..EngineConfig::default()
    }
}

async fn started(store: MemoryStore, config: EngineConfig, mounts: Vec<MountRule>) -> Engine<MemoryStore> {
    let engine = Engine::new(store, config, mounts).unwrap();
    engine.start().await.unwrap();
    engine
}

async fn wait_until(engine: &Engine<MemoryStore>, predicate: impl FnMut(&Tree) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), engine.wait_for(predicate))
        .await
        .expect("mirror did not reach the expected state");
}

fn counter_rule() -> MountRule {
    MountRule::new("Counter")
        .at("/counters/$id")
        .computed("next", |s| json!(s.i64("x").unwrap_or(0) + 1).into())
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_and_shutdown() {
    let engine = Engine::new(MemoryStore::new(), config(), Vec::new()).unwrap();
    let state = engine.state();
    assert_eq!(*state.borrow(), EngineState::Idle);

    engine.start().await.unwrap();
    assert_eq!(*state.borrow(), EngineState::Running);
    assert_eq!(engine.host().instance_count(), 1);
    assert!(engine.start().await.is_err());

    engine.shutdown().await;
    assert_eq!(*state.borrow(), EngineState::Stopped);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let cfg = EngineConfig {
        max_transaction_tries: 0,
        ..config()
    };
    let err = Engine::new(MemoryStore::new(), cfg, Vec::new()).unwrap_err();
    assert!(matches!(err, CoreError::Config { .. }));

    let bad_mount = MountRule::new("Bad").at("relative/path");
    let err = Engine::new(MemoryStore::new(), config(), vec![bad_mount]).unwrap_err();
    assert!(matches!(err, CoreError::Tree(TreeError::InvalidTemplate { .. })));
}

// ── Mirror ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_mirrors_remote_value() {
    let store = MemoryStore::with_value(json!({"a": {"b": 1}}));
    let engine = started(store, config(), Vec::new()).await;
    engine.connect(Query::new("/")).await.unwrap();
    wait_until(&engine, |t| t.value("/a/b") == json!(1)).await;

    engine.set("/a", Value::Null).await.unwrap();
    wait_until(&engine, |t| t.node_at("/a").is_none()).await;
    assert_eq!(engine.value("/a"), Value::Null);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_remote_delete_runs_teardown_hooks() {
    let torn = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&torn);
    let rule = MountRule::new("Item")
        .at("/items/$id")
        .on_teardown(move |node| log.lock().unwrap().push(node.var("id").unwrap_or_default().to_owned()));

    let store = MemoryStore::with_value(json!({"items": {"i1": {"n": 1}, "i2": {"n": 2}}}));
    let engine = started(store, config(), vec![rule]).await;
    engine.connect(Query::new("/items")).await.unwrap();
    wait_until(&engine, |t| t.node_at("/items/i2").is_some()).await;

    engine.set("/items/i1", Value::Null).await.unwrap();
    wait_until(&engine, |t| t.node_at("/items/i1").is_none()).await;
    assert_eq!(*torn.lock().unwrap(), vec!["i1"]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_computed_property_follows_remote_writes() {
    let store = MemoryStore::with_value(json!({"counters": {"c1": {"x": 2}}}));
    let engine = started(store, config(), vec![counter_rule()]).await;
    engine.connect(Query::new("/counters")).await.unwrap();
    wait_until(&engine, |t| t.value("/counters/c1/next") == json!(3)).await;

    engine.set("/counters/c1/x", json!(5)).await.unwrap();
    wait_until(&engine, |t| t.value("/counters/c1/next") == json!(6)).await;

    let err = engine.assign("/counters/c1", "next", json!(0)).unwrap_err();
    assert_eq!(
        err,
        CoreError::Tree(TreeError::ComputedField {
            path: "/counters/c1/next".into()
        })
    );
    let stats = engine.stats().get("Counter.next").unwrap();
    assert_eq!(stats.update_count, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_computed_node_reference() {
    let rule = MountRule::new("Game")
        .at("/games/$id")
        .computed("leader", |s| {
            let leader = s.get("leader_id");
            leader
                .as_str()
                .and_then(|id| s.node(&format!("players/{id}")))
                .map_or(Value::Null.into(), ComputedValue::Node)
        });
    let store = MemoryStore::with_value(json!({
        "games": {"g1": {"leader_id": "p1", "players": {"p1": {"score": 3}, "p2": {"score": 1}}}}
    }));
    let engine = started(store, config(), vec![rule]).await;
    engine.connect(Query::new("/games")).await.unwrap();
    wait_until(&engine, |t| t.value("/games/g1/leader") == json!("/games/g1/players/p1")).await;

    engine.set("/games/g1/leader_id", json!("p2")).await.unwrap();
    wait_until(&engine, |t| t.value("/games/g1/leader") == json!("/games/g1/players/p2")).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_placeholders_exist_before_data() {
    let rule = MountRule::new("Settings")
        .at("/users/$uid/settings")
        .placeholder(json!({"theme": "light"}));
    let store = MemoryStore::with_value(json!({"users": {"u1": {"name": "ada"}}}));
    let engine = started(store, config(), vec![rule]).await;
    engine.connect(Query::new("/users")).await.unwrap();
    wait_until(&engine, |t| t.value("/users/u1/settings/theme") == json!("light")).await;

    engine.set("/users/u1/settings/theme", json!("dark")).await.unwrap();
    wait_until(&engine, |t| t.value("/users/u1/settings/theme") == json!("dark")).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sync_mode_applies_changed_subpaths() {
    let cfg = EngineConfig {
        sync_by_default: true,
        ..config()
    };
    let store = MemoryStore::with_value(json!({"a": {"b": 1, "c": 2}}));
    let engine = started(store, cfg, Vec::new()).await;
    engine.connect(Query::new("/")).await.unwrap();
    wait_until(&engine, |t| t.value("/a") == json!({"b": 1, "c": 2})).await;

    engine.set("/a/b", json!(5)).await.unwrap();
    wait_until(&engine, |t| t.value("/a/b") == json!(5)).await;
    assert_eq!(engine.value("/a/c"), json!(2));

    engine.set("/a/c", Value::Null).await.unwrap();
    wait_until(&engine, |t| t.value("/a") == json!({"b": 5})).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sync_mode_keeps_reserved_keys_intact() {
    let cfg = EngineConfig {
        sync_by_default: true,
        ..config()
    };
    let store = MemoryStore::with_value(json!({"x": {"a/b": 1, "c": 1}}));
    let engine = started(store, cfg, Vec::new()).await;
    engine.connect(Query::new("/x")).await.unwrap();
    wait_until(&engine, |t| t.value("/x") == json!({"a/b": 1, "c": 1})).await;

    engine.set("/x/a\\2fb", json!(2)).await.unwrap();
    wait_until(&engine, |t| t.value("/x/a\\2fb") == json!(2)).await;
    assert_eq!(engine.value("/x"), json!({"a/b": 2, "c": 1}));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_drops_the_mirror() {
    let store = MemoryStore::with_value(json!({"a": {"b": 1}}));
    let engine = started(store.clone(), config(), Vec::new()).await;
    let connection = engine.connect(Query::new("/a")).await.unwrap();
    assert_eq!(connection.url(), "/a");
    wait_until(&engine, |t| t.value("/a/b") == json!(1)).await;

    engine.disconnect(connection).await.unwrap();
    assert_eq!(engine.value("/a"), Value::Null);
    assert_eq!(store.listener_count(), 0);
    engine.shutdown().await;
}

// ── Remote operations ───────────────────────────────────────────────

#[tokio::test]
async fn test_every_call_settles_exactly_once() {
    let store = MemoryStore::new().with_rule("/ro", Access::Allow, Access::Deny);
    let engine = started(store.clone(), config(), Vec::new()).await;

    let writes = (0..20).map(|i| {
        let url = if i % 4 == 0 { format!("/ro/{i}") } else { format!("/rw/{i}") };
        engine.bridge().set(&url, json!(i))
    });
    let results = join_all(writes).await;

    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 5);
    assert_eq!(engine.bridge().pending_count(), 0);
    assert_eq!(store.value("/rw/1"), json!(1));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_transaction_commits_on_first_attempt() {
    let store = MemoryStore::with_value(json!({"count": 1}));
    let engine = started(store.clone(), config(), Vec::new()).await;

    let result = engine
        .transaction(
            "/count",
            |v| Some(TransactionStep::Write(json!(v.as_i64().unwrap_or(0) + 1))),
            false,
        )
        .await
        .unwrap();

    assert!(result.committed);
    assert_eq!(result.tries, 1);
    assert_eq!(result.snapshot.value, json!(2));
    assert_eq!(store.value("/count"), json!(2));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_transaction_abort_leaves_value() {
    let store = MemoryStore::with_value(json!({"count": 7}));
    let engine = started(store.clone(), config(), Vec::new()).await;

    let result = engine
        .transaction("/count", |_| Some(TransactionStep::Abort), false)
        .await
        .unwrap();
    assert!(!result.committed);
    assert_eq!(result.snapshot.value, json!(7));

    let deleted = engine.transaction("/count", |_| None, true).await.unwrap();
    assert!(deleted.committed);
    assert_eq!(store.value("/count"), Value::Null);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_once_reads_current_value() {
    let store = MemoryStore::with_value(json!({"list": {"a": 3, "b": 1, "c": 2}}));
    let engine = started(store, config(), Vec::new()).await;

    let snapshot = engine.once(Query::new("/list")).await.unwrap();
    assert_eq!(snapshot.value, json!({"a": 3, "b": 1, "c": 2}));

    let first = engine
        .once(Query::new("/list").order_by_value().limit_to_first(2))
        .await
        .unwrap();
    assert_eq!(first.value, json!({"b": 1, "c": 2}));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_exposed_function_roundtrip() {
    let engine = Engine::new(MemoryStore::new(), config(), Vec::new()).unwrap();
    engine.expose("sum", |_ctx, args: Vec<Value>| async move {
        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    engine.expose("fail", |_ctx, _args| async move {
        Err(CoreError::Internal("nope".into()))
    });
    engine.start().await.unwrap();

    assert_eq!(engine.call("sum", vec![json!(1), json!(2), json!(3)]).await.unwrap(), json!(6));
    assert!(engine.call("fail", Vec::new()).await.is_err());
    assert!(engine.call("missing", Vec::new()).await.is_err());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_local_storage_is_shared_both_ways() {
    let engine = Engine::new(MemoryStore::new(), config(), Vec::new()).unwrap();
    engine.expose("read", |ctx, args: Vec<Value>| async move {
        let key = args.first().and_then(Value::as_str).unwrap_or_default();
        Ok(ctx.storage.get_item(key).map_or(Value::Null, Value::String))
    });
    engine.expose("write", |ctx, args: Vec<Value>| async move {
        ctx.storage.set_item("from_worker", &args[0].to_string());
        Ok(Value::Null)
    });
    engine.start().await.unwrap();

    engine.bridge().set_local_item("theme", "dark");
    assert_eq!(engine.call("read", vec![json!("theme")]).await.unwrap(), json!("dark"));
    engine.bridge().remove_local_item("theme");
    assert_eq!(engine.call("read", vec![json!("theme")]).await.unwrap(), Value::Null);

    engine.call("write", vec![json!(7)]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.bridge().local_item("from_worker").is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(engine.bridge().local_item("from_worker").as_deref(), Some("7"));
    engine.shutdown().await;
}

// ── Errors and auth ─────────────────────────────────────────────────

#[tokio::test]
async fn test_permission_denied_is_hydrated_with_rule_trace() {
    let cfg = EngineConfig {
        auth_token: Some(SecretString::from("alice".to_owned())),
        ..config()
    };
    let store = MemoryStore::new().with_rule("/locked", Access::Allow, Access::Deny);
    let engine = started(store, cfg, Vec::new()).await;
    let mut errors = engine.bridge().errors();

    let err = engine.set("/locked/x", json!(1)).await.unwrap_err();
    assert!(err.is_permission_denied());
    let trace = err.simulation().unwrap();
    assert!(trace.starts_with("Attempt to write /locked/x"), "{trace}");
    assert!(trace.contains("/locked: \"deny\" => denied"), "{trace}");
    assert!(trace.ends_with("Write was denied."), "{trace}");

    assert_eq!(*errors.recv().await.unwrap(), err);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_auth_gates_listeners() {
    let store = MemoryStore::with_value(json!({"private": {"v": 1}}))
        .with_rule("/private", Access::Authenticated, Access::Deny);
    let engine = started(store, config(), Vec::new()).await;

    let denied = engine.connect(Query::new("/private")).await.unwrap_err();
    assert!(denied.is_permission_denied());
    assert!(denied.simulation().is_none());

    let auth = engine.bridge().auth_with_custom_token("bob").await.unwrap();
    assert_eq!(auth["uid"], json!("bob"));
    assert_eq!(*engine.bridge().auth(), auth);

    engine.connect(Query::new("/private")).await.unwrap();
    wait_until(&engine, |t| t.value("/private/v") == json!(1)).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_off_auth_releases_the_store_subscription() {
    let store = MemoryStore::new();
    let engine = started(store.clone(), config(), Vec::new()).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let subscription = engine
        .bridge()
        .on_auth(Arc::new(move |auth: Value| sink.lock().unwrap().push(auth)))
        .await
        .unwrap();
    assert_eq!(store.auth_listener_count(), 1);
    engine.bridge().auth_with_custom_token("carol").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    engine.bridge().off_auth(subscription).await.unwrap();
    assert_eq!(store.auth_listener_count(), 0);
    let delivered = seen.lock().unwrap().len();
    engine.bridge().unauth().await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(seen.lock().unwrap().len(), delivered);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_on_disconnect_fires_on_bounce() {
    let store = MemoryStore::with_value(json!({"presence": {"u1": true}}));
    let engine = started(store.clone(), config(), Vec::new()).await;

    engine
        .bridge()
        .on_disconnect("/presence/u1", truss_api::DisconnectOp::Remove)
        .await
        .unwrap();
    assert_eq!(store.value("/presence/u1"), json!(true));

    engine.bridge().bounce_connection().await.unwrap();
    assert_eq!(store.value("/presence/u1"), Value::Null);
    engine.shutdown().await;
}
