//! ETag-aware read-through caching for mutable stores.
//!
//! [`MutableCacheWrapper`] composes three dictionaries: a *main* store that
//! owns the items, a value cache, and an ETag cache (any mutable
//! [`PersiDict`] works; the in-memory backend is the typical choice for
//! both caches). Reads ask the main store whether the item changed relative
//! to the cached ETag; an unchanged item is served from the value cache
//! without transferring the body. Writes go to the main store and are
//! mirrored into the caches, so after any successful write the caches hold
//! the written value and its resulting ETag, and after a failed conditional
//! write they never hold the proposed value.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use cairn_core::{
    CairnError, ConditionalOutcome, DictConfig, ETag, PersiDict, Result, Retrieve, SafeKey,
    TagCondition, TagState, ValueInput, ValueState,
};

/// A mutable [`PersiDict`] facade with value and ETag caches.
pub struct MutableCacheWrapper<V, M, C, E> {
    main: M,
    value_cache: C,
    etag_cache: E,
    config: DictConfig,
    _values: PhantomData<fn() -> V>,
}

impl<V, M, C, E> MutableCacheWrapper<V, M, C, E>
where
    V: Clone + Send + Sync + 'static,
    M: PersiDict<V>,
    C: PersiDict<V>,
    E: PersiDict<ETag>,
{
    /// Compose a main store with a value cache and an ETag cache.
    ///
    /// All three parts must be mutable; an append-only participant cannot
    /// keep the caches coherent.
    pub fn new(main: M, value_cache: C, etag_cache: E) -> Result<Self> {
        if main.config().append_only
            || value_cache.config().append_only
            || etag_cache.config().append_only
        {
            return Err(CairnError::Unsupported {
                message: "append-only dictionaries cannot participate in a mutable cache"
                    .to_string(),
            });
        }
        let config = main.config().clone();
        Ok(Self {
            main,
            value_cache,
            etag_cache,
            config,
            _values: PhantomData,
        })
    }

    /// The wrapped main store.
    pub fn main(&self) -> &M {
        &self.main
    }

    async fn purge(&self, key: &SafeKey) -> Result<()> {
        self.value_cache.discard(key).await?;
        self.etag_cache.discard(key).await?;
        Ok(())
    }

    /// Bring the caches in line with an operation result from the main
    /// store.
    ///
    /// An absent result purges. An outcome that reports a tag without a
    /// value is checked against the recorded tag: reads report the store's
    /// current tag and writes the tag of the unseen new content, so in
    /// either case a recorded tag that differs proves the cached value
    /// stale — it is dropped and the fresh tag recorded. A returned value
    /// is mirrored together with the resulting ETag.
    async fn sync_caches(&self, key: &SafeKey, res: &ConditionalOutcome<V>) -> Result<()> {
        if res.new_value.is_absent() || res.resulting_etag.is_absent() {
            return self.purge(key).await;
        }
        if res.new_value.is_not_retrieved() {
            if let TagState::Present(tag) = &res.resulting_etag {
                let recorded = self.etag_cache.get_opt(key).await?;
                if recorded.as_ref() != Some(tag) {
                    self.value_cache.discard(key).await?;
                    self.etag_cache.put(key, tag.clone()).await?;
                }
            }
            return Ok(());
        }
        if let ValueState::Value(v) = &res.new_value {
            self.value_cache.put(key, v.clone()).await?;
            if let TagState::Present(tag) = &res.resulting_etag {
                self.etag_cache.put(key, tag.clone()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<V, M, C, E> PersiDict<V> for MutableCacheWrapper<V, M, C, E>
where
    V: Clone + Send + Sync + 'static,
    M: PersiDict<V>,
    C: PersiDict<V>,
    E: PersiDict<ETag>,
{
    fn config(&self) -> &DictConfig {
        &self.config
    }

    async fn contains(&self, key: &SafeKey) -> Result<bool> {
        self.main.contains(key).await
    }

    /// Read through the cache, validating against the main store's ETag.
    async fn get(&self, key: &SafeKey) -> Result<V> {
        let cached_etag = self.etag_cache.get_opt(key).await?;
        let has_cached_value = self.value_cache.contains(key).await?;

        if cached_etag.is_some() && !has_cached_value {
            // An ETag without a value makes the conditional round-trip
            // pointless; fetch outright.
            let res = self
                .get_item_if(
                    key,
                    TagState::Absent,
                    TagCondition::MustDiffer,
                    Retrieve::IfChanged,
                )
                .await?;
            return res
                .new_value
                .into_value()
                .ok_or_else(|| CairnError::KeyMissing { key: key.clone() });
        }

        let expected = cached_etag
            .map(TagState::Present)
            .unwrap_or(TagState::Absent);
        let res = self
            .get_item_if(key, expected, TagCondition::MustDiffer, Retrieve::IfChanged)
            .await?;
        match res.new_value {
            ValueState::Value(v) => Ok(v),
            ValueState::Absent => Err(CairnError::KeyMissing { key: key.clone() }),
            ValueState::NotRetrieved => match self.value_cache.get_opt(key).await? {
                Some(v) => {
                    debug!(key = %key, "cache hit");
                    Ok(v)
                }
                None => {
                    // The cached value raced away; self-heal with a fresh
                    // fetch.
                    let res = self
                        .get_item_if(
                            key,
                            TagState::Absent,
                            TagCondition::MustDiffer,
                            Retrieve::IfChanged,
                        )
                        .await?;
                    res.new_value
                        .into_value()
                        .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
                }
            },
        }
    }

    async fn put(&self, key: &SafeKey, value: V) -> Result<()> {
        self.main.put(key, value.clone()).await?;
        self.value_cache.put(key, value).await?;
        let etag = self.main.etag(key).await?;
        self.etag_cache.put(key, etag).await?;
        Ok(())
    }

    async fn remove(&self, key: &SafeKey) -> Result<()> {
        self.main.remove(key).await?;
        self.purge(key).await
    }

    async fn keys(&self) -> Result<Vec<SafeKey>> {
        self.main.keys().await
    }

    async fn items(&self) -> Result<Vec<(SafeKey, V)>> {
        self.main.items().await
    }

    /// Serve the ETag from the cache when possible, back-filling on a miss.
    ///
    /// The cached tag can lag a writer that bypassed this wrapper; reads
    /// through [`MutableCacheWrapper::get`] detect and repair that on the
    /// next fetch.
    async fn etag(&self, key: &SafeKey) -> Result<ETag> {
        if let Some(tag) = self.etag_cache.get_opt(key).await? {
            return Ok(tag);
        }
        let tag = self.main.etag(key).await?;
        self.etag_cache.put(key, tag.clone()).await?;
        Ok(tag)
    }

    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>> {
        self.main.timestamp(key).await
    }

    async fn subdict(&self, prefix: &SafeKey) -> Result<Self> {
        Self::new(
            self.main.subdict(prefix).await?,
            self.value_cache.subdict(prefix).await?,
            self.etag_cache.subdict(prefix).await?,
        )
    }

    async fn get_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let res = self
            .main
            .get_item_if(key, expected, condition, retrieve)
            .await?;
        self.sync_caches(key, &res).await?;
        Ok(res)
    }

    async fn set_item_if(
        &self,
        key: &SafeKey,
        value: ValueInput<V>,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let res = self
            .main
            .set_item_if(key, value, expected, condition, retrieve)
            .await?;
        self.sync_caches(key, &res).await?;
        Ok(res)
    }

    async fn setdefault_if(
        &self,
        key: &SafeKey,
        default: V,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let res = self
            .main
            .setdefault_if(key, default, expected, condition, retrieve)
            .await?;
        self.sync_caches(key, &res).await?;
        Ok(res)
    }

    async fn discard_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>> {
        let res = self.main.discard_item_if(key, expected, condition).await?;
        self.sync_caches(key, &res).await?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_storage::MemoryBackend;

    type Wrapped =
        MutableCacheWrapper<i64, MemoryBackend<i64>, MemoryBackend<i64>, MemoryBackend<ETag>>;

    fn key(parts: &[&str]) -> SafeKey {
        SafeKey::new(parts.to_vec()).unwrap()
    }

    fn wrapped() -> (Wrapped, MemoryBackend<i64>) {
        let main: MemoryBackend<i64> = MemoryBackend::new();
        let wrapper = MutableCacheWrapper::new(
            main.clone(),
            MemoryBackend::new(),
            MemoryBackend::new(),
        )
        .unwrap();
        (wrapper, main)
    }

    #[tokio::test]
    async fn test_rejects_append_only_parts() {
        let main: MemoryBackend<i64> = MemoryBackend::new_append_only();
        let err = MutableCacheWrapper::new(
            main,
            MemoryBackend::<i64>::new(),
            MemoryBackend::<ETag>::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CairnError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_write_populates_caches() {
        let (dict, _main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 5).await.unwrap();
        assert_eq!(dict.value_cache.get(&k).await.unwrap(), 5);
        let cached_tag = dict.etag_cache.get(&k).await.unwrap();
        assert_eq!(dict.main.etag(&k).await.unwrap(), cached_tag);
    }

    #[tokio::test]
    async fn test_satisfied_conditional_write_updates_caches() {
        let (dict, _main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();
        let e1 = dict.etag(&k).await.unwrap();

        let out = dict
            .set_item_if(
                &k,
                ValueInput::Value(2),
                TagState::Present(e1),
                TagCondition::MustMatch,
                Retrieve::Always,
            )
            .await
            .unwrap();
        assert!(out.satisfied);
        assert_eq!(dict.value_cache.get(&k).await.unwrap(), 2);
        assert_eq!(
            TagState::Present(dict.etag_cache.get(&k).await.unwrap()),
            out.resulting_etag
        );
    }

    #[tokio::test]
    async fn test_failed_conditional_write_never_caches_proposed_value() {
        let (dict, _main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();

        let out = dict
            .set_item_if(
                &k,
                ValueInput::Value(99),
                TagState::Present(ETag::new("stale")),
                TagCondition::MustMatch,
                Retrieve::Always,
            )
            .await
            .unwrap();
        assert!(!out.satisfied);
        // The cache tracks the store, not the rejected proposal.
        assert_eq!(dict.value_cache.get(&k).await.unwrap(), 1);
        assert_eq!(dict.get(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_self_heals_after_external_write() {
        let (dict, main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();
        assert_eq!(dict.get(&k).await.unwrap(), 1);

        // A writer bypasses the wrapper.
        main.put(&k, 2).await.unwrap();
        assert_eq!(dict.get(&k).await.unwrap(), 2);
        assert_eq!(dict.value_cache.get(&k).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_purges_caches() {
        let (dict, _main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();
        dict.remove(&k).await.unwrap();
        assert!(!dict.value_cache.contains(&k).await.unwrap());
        assert!(!dict.etag_cache.contains(&k).await.unwrap());
        assert!(dict.get(&k).await.unwrap_err().is_key_missing());
    }

    #[tokio::test]
    async fn test_observed_mutation_without_value_drops_stale_cache() {
        let (dict, main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();
        main.put(&k, 2).await.unwrap();

        // A Never-retrieve probe reveals the tag moved without a body.
        let out = dict
            .get_item_if(
                &k,
                TagState::Absent,
                TagCondition::MustDiffer,
                Retrieve::Never,
            )
            .await
            .unwrap();
        assert!(out.new_value.is_not_retrieved());
        assert!(!dict.value_cache.contains(&k).await.unwrap());
        assert_eq!(
            TagState::Present(dict.etag_cache.get(&k).await.unwrap()),
            out.resulting_etag
        );
    }

    #[tokio::test]
    async fn test_transform_through_wrapper_keeps_caches_coherent() {
        let (dict, _main) = wrapped();
        let k = key(&["counter"]);
        for _ in 0..3 {
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
        assert_eq!(dict.get(&k).await.unwrap(), 3);
        assert_eq!(dict.value_cache.get(&k).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_subdict_composes_all_three_parts() {
        let (dict, _main) = wrapped();
        dict.put(&key(&["users", "alice"]), 1).await.unwrap();
        let users = dict.subdict(&key(&["users"])).await.unwrap();
        assert_eq!(users.get(&key(&["alice"])).await.unwrap(), 1);
        users.put(&key(&["bob"]), 2).await.unwrap();
        assert_eq!(dict.get(&key(&["users", "bob"])).await.unwrap(), 2);
    }
}
