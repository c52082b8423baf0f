//! The `PersiDict` trait — the single interface for every store and wrapper.
//!
//! Every operation in Cairn goes through this trait. Implementations
//! include the filesystem, S3, and in-memory backends in `cairn-storage`
//! and the caching/policy wrappers in `cairn-cache`. Application code never
//! touches the filesystem or object storage directly.
//!
//! # Conditional operations
//!
//! The `_if` family is the serialisation mechanism for concurrent writers.
//! Each call carries an expected ETag and a [`TagCondition`]; the backend
//! evaluates the condition against the item's current ETag and performs the
//! mutation only when it is satisfied. A condition that is not satisfied is
//! reported in the returned [`ConditionalOutcome`], never as an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CairnError;
use crate::flags::{
    ConditionalOutcome, ETag, Retrieve, TagCondition, TagState, TransformOutcome, ValueInput,
    ValueState,
};
use crate::key::SafeKey;
use crate::Result;

/// Default retry budget for [`PersiDict::transform_item`].
pub const DEFAULT_TRANSFORM_RETRIES: u32 = 6;

/// Per-instance configuration shared by every dictionary variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictConfig {
    /// Serialization-format name; equals the codec's file extension.
    pub serialization_format: String,
    /// If true, existing items can neither be overwritten nor deleted.
    pub append_only: bool,
    /// Length in hex chars of the digest suffix appended to rendered key
    /// components. Only the filesystem backend uses it; 0 disables.
    pub digest_len: usize,
}

impl DictConfig {
    /// Configuration with the given format, mutable items, no digest suffix.
    pub fn new(serialization_format: impl Into<String>) -> Self {
        Self {
            serialization_format: serialization_format.into(),
            append_only: false,
            digest_len: 0,
        }
    }

    /// Set the append-only flag.
    pub fn append_only(mut self, append_only: bool) -> Self {
        self.append_only = append_only;
        self
    }

    /// Set the digest suffix length.
    pub fn digest_len(mut self, digest_len: usize) -> Self {
        self.digest_len = digest_len;
        self
    }
}

/// A persistent, hierarchical key-value store.
///
/// Implementations must be safe for concurrent method calls from different
/// tasks and threads. Iteration is unordered and reflects a non-atomic
/// snapshot; entries that vanish mid-walk are skipped silently.
#[async_trait]
pub trait PersiDict<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// The instance configuration.
    fn config(&self) -> &DictConfig;

    /// Whether the key currently exists.
    async fn contains(&self, key: &SafeKey) -> Result<bool>;

    /// Read the value for a key.
    ///
    /// Returns [`CairnError::KeyMissing`] when the key is absent.
    async fn get(&self, key: &SafeKey) -> Result<V>;

    /// Write a real value for a key, overwriting any existing item.
    ///
    /// Returns [`CairnError::MutationPolicy`] when the store is append-only
    /// and the key already exists.
    async fn put(&self, key: &SafeKey, value: V) -> Result<()>;

    /// Delete a key.
    ///
    /// Returns [`CairnError::KeyMissing`] when the key is absent and
    /// [`CairnError::MutationPolicy`] when the store is append-only.
    async fn remove(&self, key: &SafeKey) -> Result<()>;

    /// All keys currently stored. Unordered snapshot.
    async fn keys(&self) -> Result<Vec<SafeKey>>;

    /// All key-value pairs currently stored. Unordered snapshot.
    async fn items(&self) -> Result<Vec<(SafeKey, V)>>;

    /// The item's current ETag.
    ///
    /// Calling this twice with no intervening write returns equal tags.
    /// Returns [`CairnError::KeyMissing`] when the key is absent.
    async fn etag(&self, key: &SafeKey) -> Result<ETag>;

    /// The item's last-modification time.
    ///
    /// Returns [`CairnError::KeyMissing`] when the key is absent.
    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>>;

    /// A view of this store restricted to keys under `prefix`.
    ///
    /// The view shares storage with its parent; writes through either are
    /// visible to both.
    async fn subdict(&self, prefix: &SafeKey) -> Result<Self>
    where
        Self: Sized;

    /// Conditionally read an item. Never mutates.
    ///
    /// The condition is evaluated against the current ETag; `retrieve`
    /// decides whether the value is fetched. When no fetch occurs for an
    /// existing key, `new_value` is [`ValueState::NotRetrieved`]; for an
    /// absent key every field reports absence regardless of `retrieve`.
    async fn get_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>>;

    /// Conditionally write, keep, or delete an item.
    ///
    /// On a satisfied condition a real value is written and
    /// `resulting_etag` is the fresh tag; [`ValueInput::KeepCurrent`]
    /// mutates nothing; [`ValueInput::DeleteCurrent`] removes the item. On
    /// an unsatisfied condition nothing is mutated and the current state is
    /// reported per the retrieval rules.
    async fn set_item_if(
        &self,
        key: &SafeKey,
        value: ValueInput<V>,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>>;

    /// Insert `default` when the key is absent and the condition holds.
    ///
    /// When the key exists, nothing is mutated regardless of the condition
    /// and the existing state is reported.
    async fn setdefault_if(
        &self,
        key: &SafeKey,
        default: V,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>>;

    /// Conditionally delete an item.
    ///
    /// On a satisfied condition for an existing key the item is removed and
    /// the resulting fields report absence; for an absent key this is a
    /// no-op. On an unsatisfied condition for a present key `new_value` is
    /// [`ValueState::NotRetrieved`].
    async fn discard_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>>;

    // ------------------------------------------------------------------
    // Provided surface
    // ------------------------------------------------------------------

    /// Write a value or execute a joker command.
    ///
    /// [`ValueInput::KeepCurrent`] is a no-op; [`ValueInput::DeleteCurrent`]
    /// is equivalent to [`PersiDict::discard`].
    async fn set(&self, key: &SafeKey, value: ValueInput<V>) -> Result<()> {
        match value {
            ValueInput::KeepCurrent => Ok(()),
            ValueInput::DeleteCurrent => {
                if self.config().append_only {
                    return Err(CairnError::MutationPolicy {
                        policy: "append-only",
                    });
                }
                self.discard(key).await.map(|_| ())
            }
            ValueInput::Value(v) => self.put(key, v).await,
        }
    }

    /// Read the value for a key, absorbing absence into `None`.
    async fn get_opt(&self, key: &SafeKey) -> Result<Option<V>> {
        match self.get(key).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_key_missing() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a key without erroring when it is absent.
    ///
    /// Returns whether the key existed and was deleted.
    async fn discard(&self, key: &SafeKey) -> Result<bool> {
        match self.remove(key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_key_missing() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove a key and return its value, absorbing absence into `None`.
    async fn pop(&self, key: &SafeKey) -> Result<Option<V>> {
        match self.get(key).await {
            Ok(v) => {
                self.discard(key).await?;
                Ok(Some(v))
            }
            Err(e) if e.is_key_missing() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert `default` when the key is absent; return the stored value.
    async fn setdefault(&self, key: &SafeKey, default: V) -> Result<V> {
        let out = self
            .setdefault_if(
                key,
                default,
                TagState::Absent,
                TagCondition::Any,
                Retrieve::Always,
            )
            .await?;
        out.new_value
            .into_value()
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    /// The item's ETag, with absence folded into [`TagState::Absent`].
    async fn etag_state(&self, key: &SafeKey) -> Result<TagState> {
        match self.etag(key).await {
            Ok(tag) => Ok(TagState::Present(tag)),
            Err(e) if e.is_key_missing() => Ok(TagState::Absent),
            Err(e) => Err(e),
        }
    }

    /// Number of items currently stored.
    async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    /// Whether the store currently holds no items.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// All values currently stored. Unordered snapshot.
    async fn values(&self) -> Result<Vec<V>> {
        Ok(self.items().await?.into_iter().map(|(_, v)| v).collect())
    }

    /// A uniformly random key, or `None` when the store is empty.
    async fn random_key(&self) -> Result<Option<SafeKey>> {
        let keys = self.keys().await?;
        Ok(keys.choose(&mut rand::thread_rng()).cloned())
    }

    /// Up to `max_n` keys, oldest first by modification time.
    ///
    /// `None` returns all keys. Keys that vanish mid-walk are skipped.
    async fn oldest_keys(&self, max_n: Option<usize>) -> Result<Vec<SafeKey>> {
        let mut stamped = self.stamped_keys().await?;
        stamped.sort_by(|a, b| a.0.cmp(&b.0));
        let n = max_n.unwrap_or(stamped.len()).min(stamped.len());
        Ok(stamped.into_iter().take(n).map(|(_, k)| k).collect())
    }

    /// Up to `max_n` keys, newest first by modification time.
    ///
    /// `None` returns all keys. Keys that vanish mid-walk are skipped.
    async fn newest_keys(&self, max_n: Option<usize>) -> Result<Vec<SafeKey>> {
        let mut stamped = self.stamped_keys().await?;
        stamped.sort_by(|a, b| b.0.cmp(&a.0));
        let n = max_n.unwrap_or(stamped.len()).min(stamped.len());
        Ok(stamped.into_iter().take(n).map(|(_, k)| k).collect())
    }

    /// Keys paired with their timestamps; vanished keys skipped.
    async fn stamped_keys(&self) -> Result<Vec<(DateTime<Utc>, SafeKey)>> {
        let mut stamped = Vec::new();
        for key in self.keys().await? {
            match self.timestamp(&key).await {
                Ok(ts) => stamped.push((ts, key)),
                Err(e) if e.is_key_missing() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(stamped)
    }

    /// One subdict per distinct first key component.
    async fn subdicts(&self) -> Result<BTreeMap<String, Self>>
    where
        Self: Sized,
    {
        let mut out = BTreeMap::new();
        for key in self.keys().await? {
            let first = key.components()[0].clone();
            if !out.contains_key(&first) {
                let sub = self.subdict(&SafeKey::single(&first)?).await?;
                out.insert(first, sub);
            }
        }
        Ok(out)
    }

    /// Remove all items.
    ///
    /// Returns [`CairnError::MutationPolicy`] for append-only stores.
    async fn clear(&self) -> Result<()> {
        if self.config().append_only {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        for key in self.keys().await? {
            self.discard(&key).await?;
        }
        Ok(())
    }

    /// Atomically read-modify-write one item.
    ///
    /// The transformer receives the current value (or
    /// [`ValueState::Absent`]) and returns the new value, a no-op, or a
    /// deletion. The commit is conditional on the ETag observed at read
    /// time; when another writer wins, the transformer is re-invoked on the
    /// fresh state. The transformer must be effect-free apart from its
    /// return value.
    ///
    /// `n_retries` bounds the retries after the first attempt; `None`
    /// retries indefinitely. Exhaustion surfaces as
    /// [`CairnError::ConcurrencyConflict`]. Atomicity of the whole
    /// transform equals the conditional-operation atomicity of the
    /// underlying backend.
    async fn transform_item<F>(
        &self,
        key: &SafeKey,
        transformer: F,
        n_retries: Option<u32>,
    ) -> Result<TransformOutcome<V>>
    where
        F: Fn(&ValueState<V>) -> ValueInput<V> + Send + Sync,
        V: Clone,
        Self: Sized,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let current = self
                .get_item_if(key, TagState::Absent, TagCondition::Any, Retrieve::Always)
                .await?;

            match transformer(&current.new_value) {
                ValueInput::KeepCurrent => {
                    return Ok(TransformOutcome {
                        resulting_etag: current.actual_etag,
                        new_value: current.new_value,
                    });
                }
                ValueInput::Value(v) => {
                    let out = self
                        .set_item_if(
                            key,
                            ValueInput::Value(v),
                            current.actual_etag.clone(),
                            TagCondition::MustMatch,
                            Retrieve::Always,
                        )
                        .await?;
                    if out.satisfied {
                        return Ok(TransformOutcome {
                            resulting_etag: out.resulting_etag,
                            new_value: out.new_value,
                        });
                    }
                }
                ValueInput::DeleteCurrent => {
                    let out = self
                        .discard_item_if(key, current.actual_etag.clone(), TagCondition::MustMatch)
                        .await?;
                    if out.satisfied {
                        return Ok(TransformOutcome {
                            resulting_etag: TagState::Absent,
                            new_value: ValueState::Absent,
                        });
                    }
                }
            }

            if let Some(max) = n_retries {
                if attempts > max {
                    return Err(CairnError::ConcurrencyConflict {
                        key: key.clone(),
                        attempts,
                    });
                }
            }
            warn!(key = %key, attempts, "conditional commit lost, retrying transform");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DictConfig::new("json").append_only(true).digest_len(8);
        assert_eq!(config.serialization_format, "json");
        assert!(config.append_only);
        assert_eq!(config.digest_len, 8);
    }

    #[test]
    fn test_config_defaults() {
        let config = DictConfig::new("mp");
        assert!(!config.append_only);
        assert_eq!(config.digest_len, 0);
    }

    #[test]
    fn test_config_serialization() {
        let config = DictConfig::new("json").digest_len(4);
        let text = serde_json::to_string(&config).unwrap();
        let back: DictConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
