//! Process-local in-memory backend.
//!
//! [`MemoryBackend`] keeps items in a single map guarded by one mutex, so
//! every conditional operation is atomic within the process. ETags are
//! drawn from a monotonically increasing counter shared by all views of the
//! same store — strong inside the process, meaningless across processes,
//! which is acceptable because the backend never leaves the process.
//!
//! [`MemoryBackend::subdict`] returns a view that shares the underlying
//! map under a key prefix; writes through either side are visible to both.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use cairn_core::{
    CairnError, ConditionalOutcome, DictConfig, ETag, PersiDict, Result, Retrieve, SafeKey,
    TagCondition, TagState, ValueInput, ValueState,
};

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    etag: ETag,
    modified: DateTime<Utc>,
}

#[derive(Debug)]
struct Shared<V> {
    entries: HashMap<SafeKey, Entry<V>>,
    counter: u64,
}

impl<V> Shared<V> {
    fn next_etag(&mut self) -> ETag {
        self.counter += 1;
        ETag::new(self.counter.to_string())
    }

    fn state_of(&self, key: &SafeKey) -> TagState {
        match self.entries.get(key) {
            Some(entry) => TagState::Present(entry.etag.clone()),
            None => TagState::Absent,
        }
    }
}

/// A [`PersiDict`] holding items in process memory.
pub struct MemoryBackend<V> {
    shared: Arc<Mutex<Shared<V>>>,
    prefix: Option<SafeKey>,
    config: DictConfig,
}

impl<V> Clone for MemoryBackend<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            prefix: self.prefix.clone(),
            config: self.config.clone(),
        }
    }
}

impl<V> MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// An empty mutable store.
    pub fn new() -> Self {
        Self::with_config(DictConfig::new("native"))
    }

    /// An empty append-only store.
    pub fn new_append_only() -> Self {
        Self::with_config(DictConfig::new("native").append_only(true))
    }

    /// An empty store with an explicit configuration.
    ///
    /// `digest_len` is ignored here; no name mapping happens in memory.
    pub fn with_config(config: DictConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                entries: HashMap::new(),
                counter: 0,
            })),
            prefix: None,
            config,
        }
    }

    fn full_key(&self, key: &SafeKey) -> SafeKey {
        match &self.prefix {
            Some(prefix) => prefix.join(key),
            None => key.clone(),
        }
    }

    fn relative_key(&self, key: &SafeKey) -> Option<SafeKey> {
        match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.components()),
            None => Some(key.clone()),
        }
    }

    fn fetch_value(
        &self,
        shared: &Shared<V>,
        key: &SafeKey,
        expected: &TagState,
        actual: &TagState,
        retrieve: Retrieve,
    ) -> ValueState<V> {
        match shared.entries.get(key) {
            None => ValueState::Absent,
            Some(entry) => {
                if retrieve.wants_fetch(expected, actual) {
                    ValueState::Value(entry.value.clone())
                } else {
                    ValueState::NotRetrieved
                }
            }
        }
    }
}

impl<V> Default for MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> PersiDict<V> for MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn config(&self) -> &DictConfig {
        &self.config
    }

    async fn contains(&self, key: &SafeKey) -> Result<bool> {
        let shared = self.shared.lock().await;
        Ok(shared.entries.contains_key(&self.full_key(key)))
    }

    async fn get(&self, key: &SafeKey) -> Result<V> {
        let shared = self.shared.lock().await;
        shared
            .entries
            .get(&self.full_key(key))
            .map(|entry| entry.value.clone())
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    async fn put(&self, key: &SafeKey, value: V) -> Result<()> {
        let full = self.full_key(key);
        let mut shared = self.shared.lock().await;
        if self.config.append_only && shared.entries.contains_key(&full) {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        let etag = shared.next_etag();
        shared.entries.insert(
            full,
            Entry {
                value,
                etag,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &SafeKey) -> Result<()> {
        if self.config.append_only {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        let mut shared = self.shared.lock().await;
        shared
            .entries
            .remove(&self.full_key(key))
            .map(|_| ())
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    async fn keys(&self) -> Result<Vec<SafeKey>> {
        let shared = self.shared.lock().await;
        Ok(shared
            .entries
            .keys()
            .filter_map(|k| self.relative_key(k))
            .collect())
    }

    async fn items(&self) -> Result<Vec<(SafeKey, V)>> {
        let shared = self.shared.lock().await;
        Ok(shared
            .entries
            .iter()
            .filter_map(|(k, entry)| {
                self.relative_key(k).map(|rel| (rel, entry.value.clone()))
            })
            .collect())
    }

    async fn etag(&self, key: &SafeKey) -> Result<ETag> {
        let shared = self.shared.lock().await;
        shared
            .entries
            .get(&self.full_key(key))
            .map(|entry| entry.etag.clone())
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>> {
        let shared = self.shared.lock().await;
        shared
            .entries
            .get(&self.full_key(key))
            .map(|entry| entry.modified)
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    async fn subdict(&self, prefix: &SafeKey) -> Result<Self> {
        let extended = match &self.prefix {
            Some(existing) => existing.join(prefix),
            None => prefix.clone(),
        };
        Ok(Self {
            shared: Arc::clone(&self.shared),
            prefix: Some(extended),
            config: self.config.clone(),
        })
    }

    async fn get_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let full = self.full_key(key);
        let shared = self.shared.lock().await;
        let actual = shared.state_of(&full);
        let satisfied = condition.satisfied_by(&expected, &actual);
        if actual.is_absent() {
            return Ok(ConditionalOutcome::absent(satisfied));
        }
        let new_value = self.fetch_value(&shared, &full, &expected, &actual, retrieve);
        Ok(ConditionalOutcome {
            satisfied,
            actual_etag: actual.clone(),
            resulting_etag: actual,
            new_value,
        })
    }

    async fn set_item_if(
        &self,
        key: &SafeKey,
        value: ValueInput<V>,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let full = self.full_key(key);
        let mut shared = self.shared.lock().await;
        let actual = shared.state_of(&full);
        let satisfied = condition.satisfied_by(&expected, &actual);

        if !satisfied {
            let new_value = self.fetch_value(&shared, &full, &expected, &actual, retrieve);
            return Ok(ConditionalOutcome {
                satisfied: false,
                actual_etag: actual.clone(),
                resulting_etag: actual,
                new_value,
            });
        }

        match value {
            ValueInput::KeepCurrent => {
                let new_value = self.fetch_value(&shared, &full, &expected, &actual, retrieve);
                Ok(ConditionalOutcome {
                    satisfied: true,
                    actual_etag: actual.clone(),
                    resulting_etag: actual,
                    new_value,
                })
            }
            ValueInput::DeleteCurrent => {
                if !actual.is_absent() {
                    if self.config.append_only {
                        return Err(CairnError::MutationPolicy {
                            policy: "append-only",
                        });
                    }
                    shared.entries.remove(&full);
                }
                Ok(ConditionalOutcome {
                    satisfied: true,
                    actual_etag: actual,
                    resulting_etag: TagState::Absent,
                    new_value: ValueState::Absent,
                })
            }
            ValueInput::Value(v) => {
                if self.config.append_only && !actual.is_absent() {
                    return Err(CairnError::MutationPolicy {
                        policy: "append-only",
                    });
                }
                let etag = shared.next_etag();
                let resulting = TagState::Present(etag.clone());
                let new_value = match retrieve {
                    Retrieve::Never => ValueState::NotRetrieved,
                    Retrieve::Always => ValueState::Value(v.clone()),
                    Retrieve::IfChanged => {
                        if resulting != expected {
                            ValueState::Value(v.clone())
                        } else {
                            ValueState::NotRetrieved
                        }
                    }
                };
                shared.entries.insert(
                    full,
                    Entry {
                        value: v,
                        etag,
                        modified: Utc::now(),
                    },
                );
                debug!(key = %key, "conditional write committed");
                Ok(ConditionalOutcome {
                    satisfied: true,
                    actual_etag: actual,
                    resulting_etag: resulting,
                    new_value,
                })
            }
        }
    }

    async fn setdefault_if(
        &self,
        key: &SafeKey,
        default: V,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let full = self.full_key(key);
        let mut shared = self.shared.lock().await;
        let actual = shared.state_of(&full);
        let satisfied = condition.satisfied_by(&expected, &actual);

        if !actual.is_absent() {
            let new_value = self.fetch_value(&shared, &full, &expected, &actual, retrieve);
            return Ok(ConditionalOutcome {
                satisfied,
                actual_etag: actual.clone(),
                resulting_etag: actual,
                new_value,
            });
        }
        if !satisfied {
            return Ok(ConditionalOutcome::absent(false));
        }

        let etag = shared.next_etag();
        let resulting = TagState::Present(etag.clone());
        let new_value = match retrieve {
            Retrieve::Never => ValueState::NotRetrieved,
            _ => ValueState::Value(default.clone()),
        };
        shared.entries.insert(
            full,
            Entry {
                value: default,
                etag,
                modified: Utc::now(),
            },
        );
        Ok(ConditionalOutcome {
            satisfied: true,
            actual_etag: TagState::Absent,
            resulting_etag: resulting,
            new_value,
        })
    }

    async fn discard_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>> {
        let full = self.full_key(key);
        let mut shared = self.shared.lock().await;
        let actual = shared.state_of(&full);
        let satisfied = condition.satisfied_by(&expected, &actual);

        if actual.is_absent() {
            return Ok(ConditionalOutcome::absent(satisfied));
        }
        if !satisfied {
            return Ok(ConditionalOutcome {
                satisfied: false,
                actual_etag: actual.clone(),
                resulting_etag: actual,
                new_value: ValueState::NotRetrieved,
            });
        }
        if self.config.append_only {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        shared.entries.remove(&full);
        Ok(ConditionalOutcome {
            satisfied: true,
            actual_etag: actual,
            resulting_etag: TagState::Absent,
            new_value: ValueState::Absent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> SafeKey {
        SafeKey::new(parts.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dict: MemoryBackend<String> = MemoryBackend::new();
        let k = key(&["greeting"]);
        dict.put(&k, "hello".to_string()).await.unwrap();
        assert_eq!(dict.get(&k).await.unwrap(), "hello");
        assert!(dict.contains(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let dict: MemoryBackend<String> = MemoryBackend::new();
        let err = dict.get(&key(&["nope"])).await.unwrap_err();
        assert!(err.is_key_missing());
    }

    #[tokio::test]
    async fn test_etag_changes_on_write_and_is_stable_otherwise() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["n"]);
        dict.put(&k, 1).await.unwrap();
        let e1 = dict.etag(&k).await.unwrap();
        let e1_again = dict.etag(&k).await.unwrap();
        assert_eq!(e1, e1_again);
        dict.put(&k, 2).await.unwrap();
        let e2 = dict.etag(&k).await.unwrap();
        assert_ne!(e1, e2);
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["d"]);
        dict.put(&k, 1).await.unwrap();
        assert!(dict.discard(&k).await.unwrap());
        assert!(!dict.discard(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_joker_laws() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["j"]);
        dict.put(&k, 5).await.unwrap();
        let etag_before = dict.etag(&k).await.unwrap();

        dict.set(&k, ValueInput::KeepCurrent).await.unwrap();
        assert_eq!(dict.get(&k).await.unwrap(), 5);
        assert_eq!(dict.etag(&k).await.unwrap(), etag_before);

        dict.set(&k, ValueInput::DeleteCurrent).await.unwrap();
        assert!(!dict.contains(&k).await.unwrap());

        // Deleting an absent key through the joker is a no-op.
        dict.set(&k, ValueInput::DeleteCurrent).await.unwrap();
    }

    #[tokio::test]
    async fn test_append_only_rejects_overwrite_and_delete() {
        let dict: MemoryBackend<i64> = MemoryBackend::new_append_only();
        let k = key(&["frozen"]);
        dict.put(&k, 1).await.unwrap();
        assert!(matches!(
            dict.put(&k, 2).await.unwrap_err(),
            CairnError::MutationPolicy { .. }
        ));
        assert!(matches!(
            dict.remove(&k).await.unwrap_err(),
            CairnError::MutationPolicy { .. }
        ));
        // A fresh key is still writable.
        dict.put(&key(&["new"]), 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_iff_absent() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["x"]);

        let first = dict
            .set_item_if(
                &k,
                ValueInput::Value(1),
                TagState::Absent,
                TagCondition::MustMatch,
                Retrieve::Always,
            )
            .await
            .unwrap();
        assert!(first.satisfied);
        assert!(first.value_was_mutated());

        let second = dict
            .set_item_if(
                &k,
                ValueInput::Value(2),
                TagState::Absent,
                TagCondition::MustMatch,
                Retrieve::Always,
            )
            .await
            .unwrap();
        assert!(!second.satisfied);
        assert_eq!(second.new_value, ValueState::Value(1));
        assert_eq!(dict.get(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_etag_write_is_rejected() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["cas"]);
        dict.put(&k, 1).await.unwrap();
        let stale = TagState::Present(ETag::new("0"));
        let out = dict
            .set_item_if(
                &k,
                ValueInput::Value(2),
                stale,
                TagCondition::MustMatch,
                Retrieve::Never,
            )
            .await
            .unwrap();
        assert!(!out.satisfied);
        assert!(!out.value_was_mutated());
        assert_eq!(dict.get(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_setdefault_if_existing_key_not_mutated() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["s"]);
        dict.put(&k, 10).await.unwrap();
        let out = dict
            .setdefault_if(
                &k,
                99,
                TagState::Absent,
                TagCondition::MustMatch,
                Retrieve::Always,
            )
            .await
            .unwrap();
        assert!(!out.satisfied);
        assert!(!out.value_was_mutated());
        assert_eq!(out.new_value, ValueState::Value(10));
    }

    #[tokio::test]
    async fn test_subdict_shares_storage() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        dict.put(&key(&["users", "alice", "age"]), 30).await.unwrap();
        dict.put(&key(&["users", "bob", "age"]), 40).await.unwrap();
        dict.put(&key(&["config", "x"]), 1).await.unwrap();

        let users = dict.subdict(&key(&["users"])).await.unwrap();
        assert_eq!(users.len().await.unwrap(), 2);
        assert_eq!(users.get(&key(&["alice", "age"])).await.unwrap(), 30);

        users.put(&key(&["carol", "age"]), 50).await.unwrap();
        assert_eq!(
            dict.get(&key(&["users", "carol", "age"])).await.unwrap(),
            50
        );
    }

    #[tokio::test]
    async fn test_transform_item_counter() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        let k = key(&["counter"]);
        for _ in 0..10 {
            dict.transform_item(
                &k,
                |current| match current {
                    ValueState::Value(n) => ValueInput::Value(n + 1),
                    _ => ValueInput::Value(1),
                },
                Some(6),
            )
            .await
            .unwrap();
        }
        assert_eq!(dict.get(&k).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_clear() {
        let dict: MemoryBackend<i64> = MemoryBackend::new();
        dict.put(&key(&["a"]), 1).await.unwrap();
        dict.put(&key(&["b", "c"]), 2).await.unwrap();
        dict.clear().await.unwrap();
        assert!(dict.is_empty().await.unwrap());
    }
}
