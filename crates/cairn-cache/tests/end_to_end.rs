//! End-to-end scenarios across backends and wrapper stacks.

use std::sync::Arc;

use cairn_cache::{AppendOnlyCacheWrapper, MutableCacheWrapper, WriteOnceWrapper};
use cairn_core::{
    CairnError, ETag, JsonCodec, PersiDict, Retrieve, SafeKey, TagCondition, TagState, ValueInput,
    ValueState,
};
use cairn_storage::{FileDirBackend, FileDirOptions, MemoryBackend};
use tempfile::TempDir;

fn key(parts: &[&str]) -> SafeKey {
    SafeKey::new(parts.to_vec()).unwrap()
}

#[tokio::test]
async fn test_cas_increment_loop() {
    let dict: MemoryBackend<i64> = MemoryBackend::new();
    let counter = key(&["counter"]);

    for _ in 0..10 {
        dict.transform_item(
            &counter,
            |current| match current {
                ValueState::Value(n) => ValueInput::Value(n + 1),
                _ => ValueInput::Value(1),
            },
            Some(6),
        )
        .await
        .unwrap();
    }
    assert_eq!(dict.get(&counter).await.unwrap(), 10);
}

#[tokio::test]
async fn test_insert_if_absent_two_callers() {
    let dict: MemoryBackend<String> = MemoryBackend::new();
    let k = key(&["x"]);

    let first = dict
        .setdefault_if(
            &k,
            "A".to_string(),
            TagState::Absent,
            TagCondition::MustMatch,
            Retrieve::Always,
        )
        .await
        .unwrap();
    let second = dict
        .setdefault_if(
            &k,
            "B".to_string(),
            TagState::Absent,
            TagCondition::MustMatch,
            Retrieve::Always,
        )
        .await
        .unwrap();

    assert!(first.satisfied && first.value_was_mutated());
    assert!(!second.satisfied && !second.value_was_mutated());
    // The loser observes the winner's value.
    assert_eq!(second.new_value, ValueState::Value("A".to_string()));
    let stored = dict.get(&k).await.unwrap();
    assert!(stored == "A" || stored == "B");
    assert_eq!(stored, "A");
}

#[tokio::test]
async fn test_hierarchical_subdict_view() {
    let tmp = TempDir::new().unwrap();
    let dict: FileDirBackend<String> = FileDirBackend::open(tmp.path(), Arc::new(JsonCodec))
        .await
        .unwrap();

    dict.put(&key(&["users", "alice", "name"]), "A".to_string())
        .await
        .unwrap();
    dict.put(&key(&["users", "bob", "name"]), "B".to_string())
        .await
        .unwrap();
    dict.put(&key(&["config", "x"]), "1".to_string()).await.unwrap();

    let users = dict.subdict(&key(&["users"])).await.unwrap();
    assert_eq!(users.len().await.unwrap(), 2);
    let mut keys = users.keys().await.unwrap();
    keys.sort();
    assert_eq!(
        keys,
        vec![key(&["alice", "name"]), key(&["bob", "name"])]
    );

    let subdicts = dict.subdicts().await.unwrap();
    let mut names: Vec<_> = subdicts.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["config", "users"]);
}

#[tokio::test]
async fn test_append_only_enforcement_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let dict: FileDirBackend<String> = FileDirBackend::open_with(
        tmp.path(),
        Arc::new(JsonCodec),
        FileDirOptions {
            append_only: true,
            digest_len: 8,
        },
    )
    .await
    .unwrap();

    let k = key(&["k"]);
    dict.put(&k, "v1".to_string()).await.unwrap();
    assert!(matches!(
        dict.put(&k, "v2".to_string()).await.unwrap_err(),
        CairnError::MutationPolicy { .. }
    ));
    assert!(matches!(
        dict.discard(&k).await.unwrap_err(),
        CairnError::MutationPolicy { .. }
    ));
    dict.put(&key(&["new"]), "v".to_string()).await.unwrap();
    assert_eq!(dict.get(&k).await.unwrap(), "v1");
}

#[tokio::test]
async fn test_cached_stack_over_filesystem() {
    let tmp = TempDir::new().unwrap();
    let main: FileDirBackend<String> = FileDirBackend::open(tmp.path(), Arc::new(JsonCodec))
        .await
        .unwrap();
    let dict = MutableCacheWrapper::new(
        main,
        MemoryBackend::<String>::new(),
        MemoryBackend::<ETag>::new(),
    )
    .unwrap();

    let k = key(&["doc"]);
    dict.put(&k, "v1".to_string()).await.unwrap();
    assert_eq!(dict.get(&k).await.unwrap(), "v1");

    let e1 = dict.etag(&k).await.unwrap();
    let out = dict
        .set_item_if(
            &k,
            ValueInput::Value("v2".to_string()),
            TagState::Present(e1),
            TagCondition::MustMatch,
            Retrieve::Always,
        )
        .await
        .unwrap();
    assert!(out.satisfied);
    assert_eq!(dict.get(&k).await.unwrap(), "v2");

    // A transform through the whole stack still converges.
    dict.transform_item(
        &k,
        |current| match current {
            ValueState::Value(s) => ValueInput::Value(format!("{s}!")),
            _ => ValueInput::Value("fresh".to_string()),
        },
        Some(6),
    )
    .await
    .unwrap();
    assert_eq!(dict.get(&k).await.unwrap(), "v2!");
}

#[tokio::test]
async fn test_write_once_over_cached_append_only_stack() {
    // Policy layer on top of a caching layer on top of a backend: the
    // composition preserves each layer's contract.
    let main: MemoryBackend<String> = MemoryBackend::new_append_only();
    let cached =
        AppendOnlyCacheWrapper::new(main, MemoryBackend::new_append_only()).unwrap();
    let dict = WriteOnceWrapper::new(cached, 1.0).unwrap();

    let k = key(&["artifact"]);
    dict.put(&k, "payload".to_string()).await.unwrap();
    // Identical rewrites are ignored and verified.
    dict.put(&k, "payload".to_string()).await.unwrap();
    assert_eq!(dict.consistency_checks_passed(), 1);

    // Divergent rewrites violate the policy.
    assert!(matches!(
        dict.put(&k, "different".to_string()).await.unwrap_err(),
        CairnError::MutationPolicy { .. }
    ));
    assert_eq!(dict.get(&k).await.unwrap(), "payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transform_retry_exhaustion_reports_conflict() {
    // A transformer that always returns a value, against a store whose
    // item is moved under its feet by a bypassing writer between the read
    // and the commit, must exhaust and report the conflict.
    let dict: MemoryBackend<i64> = MemoryBackend::new();
    let saboteur = dict.clone();
    let k = key(&["contended"]);
    dict.put(&k, 0).await.unwrap();

    let result = dict
        .transform_item(
            &k,
            move |current| {
                // Move the item on every attempt so the commit always
                // loses. Blocking on the shared lock is fine here: the
                // conditional commit happens after this closure returns.
                let saboteur = saboteur.clone();
                let k = key(&["contended"]);
                let current = match current {
                    ValueState::Value(n) => *n,
                    _ => 0,
                };
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current()
                        .block_on(async { saboteur.put(&k, current + 100).await })
                })
                .unwrap();
                ValueInput::Value(current + 1)
            },
            Some(2),
        )
        .await;

    match result.unwrap_err() {
        CairnError::ConcurrencyConflict { key: k2, attempts } => {
            assert_eq!(k2, k);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
}
