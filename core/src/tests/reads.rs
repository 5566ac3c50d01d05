use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{open, s, string_store};
use crate::codec::{BinaryCodec, BincodeCodec, JsonCodec, StringCodec};
use crate::config::{EnvConfig, StoreOptions};
use crate::engine::{MemEngine, StorageEngine, TxnKind};
use crate::env::Environment;
use crate::error::StoreError;

#[tokio::test]
async fn test_view_goes_stale_after_commit() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("k", &s("value")).unwrap().await.unwrap();

    let view = store.get_view("k").unwrap().unwrap();
    assert_eq!(view.bytes().unwrap(), b"value");
    assert_eq!(view.len(), 5);
    assert!(view.is_valid());

    store.put("other", &s("x")).unwrap().await.unwrap();
    assert!(!view.is_valid());
    assert!(matches!(view.bytes(), Err(StoreError::SnapshotStale)));

    let fresh = store.get_view("k").unwrap().unwrap();
    assert_eq!(fresh.to_vec().unwrap(), b"value".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gets_stay_readable_during_commits() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("stable", &s("value")).unwrap().await.unwrap();

    let reader = store.clone();
    let reads = tokio::task::spawn_blocking(move || {
        let mut failed = 0;
        for _ in 0..20_000 {
            match reader.get("stable") {
                Ok(Some(value)) if value == "value" => {}
                _ => failed += 1,
            }
            match reader.get_binary("stable") {
                Ok(Some(bytes)) if bytes == b"value" => {}
                _ => failed += 1,
            }
        }
        failed
    });

    let mut i = 0u32;
    while !reads.is_finished() {
        store.put(&(i % 16), &s("churn")).unwrap().await.unwrap();
        i += 1;
    }
    assert_eq!(reads.await.unwrap(), 0);
    assert!(store.range().unwrap().all(|item| item.is_ok()));
}

#[tokio::test]
async fn test_idle_tick_resets_shared_snapshot() {
    let (_, env) = open(EnvConfig {
        read_idle_ms: 20,
        ..EnvConfig::default()
    });
    let store = string_store(&env, "users");
    store.put("k", &s("v")).unwrap().await.unwrap();
    assert!(!env.stats().read_snapshot_active);

    assert_eq!(store.get("k").unwrap(), Some(s("v")));
    assert!(env.stats().read_snapshot_active);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!env.stats().read_snapshot_active);
    // the reset transaction is kept for renewal
    assert_eq!(env.stats().readers, 1);

    assert_eq!(store.get("k").unwrap(), Some(s("v")));
    assert!(env.stats().read_snapshot_active);
    assert_eq!(env.stats().readers, 1);
}

#[tokio::test]
async fn test_get_binary_copies_raw_bytes() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("k", &s("raw")).unwrap().await.unwrap();

    let copied = store.get_binary("k").unwrap().unwrap();
    store.put("k", &s("changed")).unwrap().await.unwrap();
    assert_eq!(copied, b"raw".to_vec());
    assert_eq!(store.get("k").unwrap(), Some(s("changed")));
}

#[tokio::test]
async fn test_range_survives_commit() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    for key in ["a", "b", "c"] {
        let _ = store.put(key, &key.to_uppercase()).unwrap();
    }
    env.flush().await.unwrap();

    let mut iter = store.range().unwrap();
    let (key, value) = iter.next().unwrap().unwrap();
    assert_eq!((key, value), (b"a".to_vec(), s("A")));

    store.put("d", &s("D")).unwrap().await.unwrap();
    // the snapshot is reset by the commit but the cursor keeps its own
    let rest: Vec<_> = iter.map(|item| item.unwrap().1).collect();
    assert_eq!(rest, vec![s("B"), s("C")]);

    assert_eq!(store.range().unwrap().count(), 4);
}

#[tokio::test]
async fn test_snapshot_is_isolated() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("k", &s("old")).unwrap().await.unwrap();

    let snapshot = env.snapshot().unwrap();
    store.put("k", &s("new")).unwrap().await.unwrap();
    store.put("extra", &s("x")).unwrap().await.unwrap();

    assert_eq!(snapshot.get(&store, "k").unwrap(), Some(s("old")));
    assert_eq!(snapshot.get(&store, "extra").unwrap(), None);
    assert_eq!(store.get("k").unwrap(), Some(s("new")));
}

#[tokio::test]
async fn test_dead_session_readers_cleared_on_open() {
    let engine = Arc::new(MemEngine::new(64 * 1024, 1 << 30, 4).unwrap());
    let session = engine.open_session();
    engine.begin_txn(TxnKind::Read(session)).unwrap();
    engine.begin_txn(TxnKind::Read(session)).unwrap();
    engine.close_session(session);
    assert_eq!(engine.reader_count(), 2);

    let env = Environment::open(engine.clone(), EnvConfig::default()).unwrap();
    assert_eq!(engine.reader_count(), 0);
    assert_eq!(env.reader_check().unwrap(), 0);

    let store = string_store(&env, "users");
    store.put("k", &s("v")).unwrap().await.unwrap();
    assert_eq!(store.get("k").unwrap(), Some(s("v")));
    assert_eq!(env.stats().readers, 1);
}

#[tokio::test]
async fn test_dup_sort_store() {
    let (_, env) = open(EnvConfig::default());
    let tags = env
        .open_store(StoreOptions::named("tags").with_dup_sort(), StringCodec)
        .unwrap();

    for tag in ["red", "blue", "green"] {
        let _ = tags.put("apple", &s(tag)).unwrap();
    }
    env.flush().await.unwrap();

    let values: Vec<_> = tags.range().unwrap().map(|item| item.unwrap().1).collect();
    assert_eq!(values, vec![s("blue"), s("green"), s("red")]);

    assert!(tags.remove_value("apple", &s("green")).unwrap().await.unwrap());
    assert!(!tags.remove_value("apple", &s("green")).unwrap().await.unwrap());
    assert_eq!(tags.stats().unwrap().entries, 2);
}

#[test]
fn test_dup_sort_cannot_use_versions() {
    let engine = Arc::new(MemEngine::new(64 * 1024, 1 << 30, 4).unwrap());
    let env = Environment::open(engine, EnvConfig::default()).unwrap();
    let result = env.open_store(
        StoreOptions::named("bad").with_dup_sort().with_versions(),
        BinaryCodec,
    );
    assert!(matches!(result, Err(StoreError::Config(_))));
}

#[test]
fn test_store_limit() {
    let engine = Arc::new(MemEngine::new(64 * 1024, 1 << 30, 1).unwrap());
    let env = Environment::open(engine, EnvConfig::default()).unwrap();
    env.open_store(StoreOptions::named("one"), BinaryCodec).unwrap();

    match env.open_store(StoreOptions::named("two"), BinaryCodec) {
        Err(StoreError::Config(msg)) => assert!(msg.contains("max_dbs")),
        other => panic!("expected a config error, got {:?}", other),
    }
}

#[test]
fn test_writes_need_a_runtime() {
    let engine = Arc::new(MemEngine::new(64 * 1024, 1 << 30, 4).unwrap());
    let env = Environment::open(engine, EnvConfig::default()).unwrap();
    let store = env.open_store(StoreOptions::named("users"), BinaryCodec).unwrap();

    assert!(matches!(
        store.put("k", &b"v".to_vec()),
        Err(StoreError::NoRuntime)
    ));
    // reads work without one
    assert_eq!(store.get("k").unwrap(), None);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    age: u32,
}

#[tokio::test]
async fn test_structured_codecs() {
    let (_, env) = open(EnvConfig::default());
    let json = env
        .open_store(StoreOptions::named("json"), JsonCodec::<Profile>::new())
        .unwrap();
    let bin = env
        .open_store(StoreOptions::named("bin"), BincodeCodec::<Profile>::new())
        .unwrap();
    let alice = Profile {
        name: s("alice"),
        age: 30,
    };

    let a = json.put(&1u64, &alice).unwrap();
    let b = bin.put(&1u64, &alice).unwrap();
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(json.get(&1u64).unwrap(), Some(alice.clone()));
    assert_eq!(bin.get(&1u64).unwrap(), Some(alice));
    assert_eq!(
        json.get_binary(&1u64).unwrap().unwrap(),
        br#"{"name":"alice","age":30}"#.to_vec()
    );
    assert_eq!(env.stats().reads, 3);
}

#[tokio::test]
async fn test_integer_keys_sort_numerically() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "numbers");
    for n in [300i64, -5, 42, 0] {
        let _ = store.put(&n, &n.to_string()).unwrap();
    }
    env.flush().await.unwrap();

    let values: Vec<_> = store.range().unwrap().map(|item| item.unwrap().1).collect();
    assert_eq!(values, vec![s("-5"), s("0"), s("42"), s("300")]);
}
