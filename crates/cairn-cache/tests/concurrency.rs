//! Concurrency races against the in-process backend.
//!
//! The memory backend serializes conditional operations under one mutex,
//! so these races must resolve exactly like the atomic-backend invariants
//! demand: one winner, everyone else observes not-satisfied.

use futures::future::join_all;

use cairn_core::{PersiDict, Retrieve, SafeKey, TagCondition, TagState, ValueInput, ValueState};
use cairn_storage::MemoryBackend;

fn key(parts: &[&str]) -> SafeKey {
    SafeKey::new(parts.to_vec()).unwrap()
}

#[tokio::test]
async fn test_no_lost_updates_single_winner() {
    let dict: MemoryBackend<String> = MemoryBackend::new();
    let k = key(&["slot"]);
    dict.put(&k, "base".to_string()).await.unwrap();
    let e = dict.etag(&k).await.unwrap();

    // Ten writers all hold the same observed tag; exactly one may commit.
    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let dict = dict.clone();
            let k = k.clone();
            let e = e.clone();
            tokio::spawn(async move {
                dict.set_item_if(
                    &k,
                    ValueInput::Value(format!("writer-{i}")),
                    TagState::Present(e),
                    TagCondition::MustMatch,
                    Retrieve::Never,
                )
                .await
            })
        })
        .collect();

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task must not panic").expect("op must not fail"))
        .collect();

    let winners = outcomes.iter().filter(|o| o.satisfied).count();
    assert_eq!(winners, 1, "expected exactly one satisfied writer");

    let stored = dict.get(&k).await.unwrap();
    assert!(stored.starts_with("writer-"));
}

#[tokio::test]
async fn test_insert_if_absent_single_inserter() {
    let dict: MemoryBackend<String> = MemoryBackend::new();
    let k = key(&["x"]);

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let dict = dict.clone();
            let k = k.clone();
            tokio::spawn(async move {
                dict.setdefault_if(
                    &k,
                    format!("caller-{i}"),
                    TagState::Absent,
                    TagCondition::MustMatch,
                    Retrieve::Always,
                )
                .await
            })
        })
        .collect();

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task must not panic").expect("op must not fail"))
        .collect();

    let inserters = outcomes.iter().filter(|o| o.value_was_mutated()).count();
    assert_eq!(inserters, 1, "expected exactly one inserter");

    // Every loser observed the winner's value.
    let stored = dict.get(&k).await.unwrap();
    for outcome in outcomes.iter().filter(|o| !o.value_was_mutated()) {
        assert!(!outcome.satisfied);
        assert_eq!(outcome.new_value, ValueState::Value(stored.clone()));
    }
}

#[tokio::test]
async fn test_concurrent_transforms_all_land() {
    let dict: MemoryBackend<i64> = MemoryBackend::new();
    let k = key(&["counter"]);

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let dict = dict.clone();
            let k = k.clone();
            tokio::spawn(async move {
                dict.transform_item(
                    &k,
                    |current| match current {
                        ValueState::Value(n) => ValueInput::Value(n + 1),
                        _ => ValueInput::Value(1),
                    },
                    // Unbounded: every increment must eventually land.
                    None,
                )
                .await
            })
        })
        .collect();

    for joined in join_all(tasks).await {
        joined.expect("task must not panic").expect("transform must succeed");
    }
    assert_eq!(dict.get(&k).await.unwrap(), 25);
}

#[tokio::test]
async fn test_concurrent_discard_if_single_winner() {
    let dict: MemoryBackend<i64> = MemoryBackend::new();
    let k = key(&["victim"]);
    dict.put(&k, 1).await.unwrap();
    let e = dict.etag(&k).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let dict = dict.clone();
            let k = k.clone();
            let e = e.clone();
            tokio::spawn(async move {
                dict.discard_item_if(&k, TagState::Present(e), TagCondition::MustMatch)
                    .await
            })
        })
        .collect();

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task must not panic").expect("op must not fail"))
        .collect();

    // The key is gone, and every caller saw a coherent outcome: either it
    // deleted the observed version or found the key already absent.
    assert!(!dict.contains(&k).await.unwrap());
    let deleted_observed_version = outcomes
        .iter()
        .filter(|o| o.satisfied && o.actual_etag != TagState::Absent)
        .count();
    assert_eq!(deleted_observed_version, 1);
}
