use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{open, s, string_store};
use crate::batch::{BatchResults, OpStatus, Operation, VersionCondition};
use crate::config::{EnvConfig, StoreOptions};
use crate::engine::{EngineError, Fault};
use crate::env::{BatchOp, CommitObserver, TxnOutcome, WriteTxn};
use crate::error::StoreError;
use crate::codec::{BinaryCodec, StringCodec};

#[tokio::test]
async fn test_put_then_get() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    assert!(store.put("alice", &s("admin")).unwrap().await.unwrap());
    assert_eq!(store.get("alice").unwrap(), Some(s("admin")));
    assert_eq!(store.get("bob").unwrap(), None);
}

#[tokio::test]
async fn test_writes_share_one_batch() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    let writes: Vec<_> = (0..10u32)
        .map(|i| store.put(&i, &i.to_string()).unwrap())
        .collect();
    assert_eq!(env.pending_operations(), 10);

    for write in writes {
        assert!(write.await.unwrap());
    }
    let stats = env.stats();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.writes, 10);
    assert_eq!(store.get(&7u32).unwrap(), Some(s("7")));
}

#[tokio::test]
async fn test_remove_reports_existence() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("k", &s("v")).unwrap().await.unwrap();

    let first = store.remove("k").unwrap();
    let second = store.remove("k").unwrap();
    assert!(first.await.unwrap());
    assert!(!second.await.unwrap());
    assert_eq!(store.get("k").unwrap(), None);
}

#[tokio::test]
async fn test_put_if_not_exists_in_one_batch() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    let first = store
        .put_if_version("k", &s("first"), None, VersionCondition::MustNotExist)
        .unwrap();
    let second = store
        .put_if_version("k", &s("second"), None, VersionCondition::MustNotExist)
        .unwrap();

    assert!(first.await.unwrap());
    assert!(!second.await.unwrap());
    assert_eq!(store.get("k").unwrap(), Some(s("first")));
}

#[tokio::test]
async fn test_version_guards() {
    let (_, env) = open(EnvConfig::default());
    let store = env
        .open_store(StoreOptions::named("docs").with_versions(), StringCodec)
        .unwrap();
    store.put_versioned("doc", &s("v1"), 1.0).unwrap().await.unwrap();

    let update = store
        .put_if_version("doc", &s("v2"), Some(2.0), VersionCondition::MustEqual(1.0))
        .unwrap();
    let stale = store
        .put_if_version("doc", &s("v3"), Some(3.0), VersionCondition::MustEqual(1.0))
        .unwrap();
    assert!(update.await.unwrap());
    assert!(!stale.await.unwrap());

    let entry = store.get_entry("doc").unwrap().unwrap();
    assert_eq!(entry.value, s("v2"));
    assert_eq!(entry.version, Some(2.0));
    assert!(store.does_exist_version("doc", 2.0).unwrap());
    assert!(!store.does_exist_version("doc", 1.0).unwrap());

    let removed = store
        .remove_if_version("doc", VersionCondition::MustEqual(1.0))
        .unwrap();
    assert!(!removed.await.unwrap());
    assert!(store.does_exist("doc").unwrap());
}

#[tokio::test]
async fn test_version_zero_is_a_real_version() {
    let (_, env) = open(EnvConfig::default());
    let store = env
        .open_store(StoreOptions::named("docs").with_versions(), StringCodec)
        .unwrap();
    store.put_versioned("doc", &s("v0"), 0.0).unwrap().await.unwrap();

    let guarded = store
        .put_if_version("doc", &s("v1"), Some(1.0), VersionCondition::MustEqual(0.0))
        .unwrap();
    assert!(guarded.await.unwrap());
    assert_eq!(store.get("doc").unwrap(), Some(s("v1")));
}

#[tokio::test]
async fn test_unversioned_store_rejects_versions() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    assert!(matches!(
        store.put_versioned("k", &s("v"), 1.0),
        Err(StoreError::Config(_))
    ));
    assert_eq!(env.pending_operations(), 0);
}

#[tokio::test]
async fn test_fatal_commit_is_attributed_and_rolled_back() {
    let (engine, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("kept", &s("1")).unwrap().await.unwrap();

    engine.inject_fault(Fault::Commit(EngineError::Problem("disk on fire".into())));
    let lost = store.put("lost", &s("2")).unwrap();
    match lost.await {
        Err(StoreError::EngineFatal { store, source }) => {
            assert_eq!(store, "users");
            assert_eq!(source, EngineError::Problem("disk on fire".into()));
        }
        other => panic!("expected a fatal error, got {:?}", other),
    }
    assert_eq!(store.get("lost").unwrap(), None);
    assert_eq!(store.get("kept").unwrap(), Some(s("1")));

    // the next batch starts from a clean writer
    assert!(store.put("after", &s("3")).unwrap().await.unwrap());
    assert_eq!(store.get("after").unwrap(), Some(s("3")));
}

#[tokio::test]
async fn test_fatal_put_fails_every_waiter() {
    let (engine, env) = open(EnvConfig::default());
    let users = string_store(&env, "users");
    let orders = string_store(&env, "orders");

    engine.inject_fault(Fault::Put {
        after: 1,
        error: EngineError::Problem("bad page".into()),
    });
    let first = users.put("a", &s("1")).unwrap();
    let second = orders.put("b", &s("2")).unwrap();

    assert!(matches!(first.await, Err(StoreError::EngineFatal { store, .. }) if store == "orders"));
    assert!(matches!(second.await, Err(StoreError::EngineFatal { .. })));
    assert_eq!(users.get("a").unwrap(), None);
}

#[tokio::test]
async fn test_map_full_grows_and_replays() {
    let config = EnvConfig {
        map_size: 4096,
        ..EnvConfig::default()
    };
    let (engine, env) = open(config);
    let store = env
        .open_store(StoreOptions::named("blobs"), BinaryCodec)
        .unwrap();

    let writes: Vec<_> = (0..10u32)
        .map(|i| store.put(&i, &vec![i as u8; 1000]).unwrap())
        .collect();
    for write in writes {
        assert!(write.await.unwrap());
    }

    assert!(env.stats().retries >= 1);
    assert!(engine.map_size() >= 16 * 1024);
    for i in 0..10u32 {
        assert_eq!(store.get(&i).unwrap(), Some(vec![i as u8; 1000]));
    }
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let config = EnvConfig {
        map_size: 1024,
        max_retries: 1,
        ..EnvConfig::default()
    };
    let (_, env) = open(config);
    let store = env
        .open_store(StoreOptions::named("blobs"), BinaryCodec)
        .unwrap();

    let writes: Vec<_> = (0..3u32)
        .map(|i| store.put(&i, &vec![0u8; 1000]).unwrap())
        .collect();
    for write in writes {
        assert!(matches!(
            write.await,
            Err(StoreError::ResourceExhausted {
                retries: 1,
                source: EngineError::MapFull
            })
        ));
    }
}

#[tokio::test]
async fn test_external_resize_remaps() {
    let (engine, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("a", &s("1")).unwrap().await.unwrap();
    assert_eq!(store.get("a").unwrap(), Some(s("1")));

    engine.resize_externally(4 * 1024 * 1024);
    assert!(store.put("b", &s("2")).unwrap().await.unwrap());

    assert_eq!(env.stats().retries, 1);
    assert_eq!(engine.map_size(), 4 * 1024 * 1024);
    assert_eq!(store.get("a").unwrap(), Some(s("1")));
    assert_eq!(store.get("b").unwrap(), Some(s("2")));
}

#[tokio::test]
async fn test_oversized_key_is_rejected_before_queueing() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    let result = store.put(&vec![7u8; 2000], &s("v"));
    assert!(matches!(
        result,
        Err(StoreError::KeyTooLarge {
            size: 2000,
            max: 1978
        })
    ));
    assert_eq!(env.pending_operations(), 0);
}

#[tokio::test]
async fn test_empty_key_fails_alone() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    let empty = store.put("", &s("nothing")).unwrap();
    let sibling = store.put("k", &s("v")).unwrap();
    assert!(matches!(empty.await, Err(StoreError::InvalidKey)));
    assert!(sibling.await.unwrap());
    assert_eq!(store.get("k").unwrap(), Some(s("v")));
}

#[tokio::test]
async fn test_batch_and_clear() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    store.put("gone", &s("x")).unwrap().await.unwrap();

    let flags = store
        .batch(vec![
            BatchOp::Put("a", s("1")),
            BatchOp::Put("b", s("2")),
            BatchOp::Remove("gone"),
            BatchOp::Remove("missing"),
        ])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(flags, vec![true, true, true, false]);
    assert_eq!(store.stats().unwrap().entries, 2);

    store.clear().unwrap().await.unwrap();
    assert_eq!(store.stats().unwrap().entries, 0);
}

#[tokio::test]
async fn test_drop_store_deletes_it() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    let groups = string_store(&env, "groups");

    let _ = store.put("a", &s("1")).unwrap();
    let _ = groups.put("g", &s("kept")).unwrap();
    store.drop_store().unwrap().await.unwrap();

    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.stats().unwrap().entries, 0);
    assert_eq!(groups.get("g").unwrap(), Some(s("kept")));

    // writing through the handle creates the store again
    assert!(store.put("b", &s("2")).unwrap().await.unwrap());
    assert_eq!(store.get("b").unwrap(), Some(s("2")));
}

#[tokio::test]
async fn test_conditional_block_across_stores() {
    let (_, env) = open(EnvConfig::default());
    let users = string_store(&env, "users");
    let index = string_store(&env, "index");

    let created = users
        .if_no_exists("alice", |batch| {
            batch.put(&users, "alice", &s("A"))?;
            batch.put(&index, "name:alice", &s("1"))
        })
        .unwrap();
    let duplicate = users
        .if_no_exists("alice", |batch| {
            batch.put(&users, "alice", &s("B"))?;
            batch.put(&index, "name:alice", &s("2"))
        })
        .unwrap();

    assert!(created.await.unwrap());
    assert!(!duplicate.await.unwrap());
    assert_eq!(users.get("alice").unwrap(), Some(s("A")));
    assert_eq!(index.get("name:alice").unwrap(), Some(s("1")));
}

#[tokio::test]
async fn test_failed_conditional_build_queues_nothing() {
    let (_, env) = open(EnvConfig::default());
    let users = string_store(&env, "users");

    let result = users.if_no_exists("alice", |batch| {
        batch.put(&users, "alice", &s("A"))?;
        batch.put(&users, &vec![0u8; 4000], &s("too long"))
    });
    assert!(matches!(result, Err(StoreError::KeyTooLarge { .. })));

    // the batch opened for the block still commits, empty
    env.flush().await.unwrap();
    assert_eq!(users.get("alice").unwrap(), None);
}

#[tokio::test]
async fn test_flush_commits_delayed_batch() {
    let (_, env) = open(EnvConfig::default());
    let store = env
        .open_store(
            StoreOptions::named("slow").with_commit_delay(60_000),
            StringCodec,
        )
        .unwrap();

    let write = store.put("k", &s("v")).unwrap();
    assert_eq!(env.pending_operations(), 1);

    env.flush().await.unwrap();
    assert_eq!(env.pending_operations(), 0);
    assert!(write.await.unwrap());
    assert_eq!(store.get("k").unwrap(), Some(s("v")));
}

#[tokio::test]
async fn test_closed_environment_rejects_writes() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    let write = store.put("k", &s("v")).unwrap();

    env.close().await.unwrap();
    assert!(write.await.unwrap());
    assert!(env.is_closed());
    assert!(matches!(store.put("k", &s("v")), Err(StoreError::Closed)));
    assert!(matches!(store.get("k"), Err(StoreError::Closed)));
}

#[derive(Default)]
struct Recorder {
    before: AtomicUsize,
    codes: Mutex<Vec<OpStatus>>,
}

impl CommitObserver for Recorder {
    fn before_commit(&self, operations: &[Operation]) {
        assert!(!operations.is_empty());
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn after_commit(&self, _operations: &[Operation], results: &BatchResults) {
        self.codes.lock().extend_from_slice(results.codes());
    }
}

#[tokio::test]
async fn test_observers_see_each_batch() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    let recorder = Arc::new(Recorder::default());
    env.add_observer(recorder.clone());

    let put = store.put("a", &s("1")).unwrap();
    let remove = store.remove("missing").unwrap();
    put.await.unwrap();
    remove.await.unwrap();

    assert_eq!(recorder.before.load(Ordering::SeqCst), 1);
    assert_eq!(
        *recorder.codes.lock(),
        vec![OpStatus::Ok, OpStatus::ConditionFailed]
    );
}

#[tokio::test]
async fn test_flush_waits_for_batch_in_flight() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");
    let gate = Arc::new(tokio::sync::Notify::new());

    let waiting = gate.clone();
    let blocked = store
        .transaction_async(move |_txn| {
            let gate = waiting.clone();
            async move {
                gate.notified().await;
                Ok::<_, StoreError>(TxnOutcome::Commit(()))
            }
        })
        .unwrap();

    // let the commit timer pick the batch up
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(env.pending_operations(), 0);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), env.flush())
            .await
            .is_err()
    );

    gate.notify_one();
    env.flush().await.unwrap();
    assert!(blocked.await.unwrap().is_commit());
}

#[tokio::test]
async fn test_cancelled_flush_still_commits() {
    let (_, env) = open(EnvConfig::default());
    let store = string_store(&env, "users");

    let queued = store.put("a", &s("1")).unwrap();
    let slow = store
        .transaction_async(|_txn: WriteTxn| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(TxnOutcome::Commit(()))
        })
        .unwrap();

    // give up on the flush while the batch is still running
    let flushed = tokio::time::timeout(Duration::from_millis(20), env.flush()).await;
    assert!(flushed.is_err());

    assert!(queued.await.unwrap());
    assert_eq!(slow.await.unwrap(), TxnOutcome::Commit(()));
    assert_eq!(store.get("a").unwrap(), Some(s("1")));

    // the writer was released, so later batches still commit
    assert!(store.put("b", &s("2")).unwrap().await.unwrap());
    assert_eq!(store.get("b").unwrap(), Some(s("2")));
}
