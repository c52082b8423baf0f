//! Aggressive read-through caching for append-only stores.
//!
//! When a store forbids overwrites and deletes, a value observed once can
//! be trusted forever. [`AppendOnlyCacheWrapper`] exploits that: reads hit
//! the value cache first and never re-validate against the main store's
//! ETag. Operations that would remove or mutate an item are rejected at the
//! wrapper boundary.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use cairn_core::{
    CairnError, ConditionalOutcome, DictConfig, ETag, PersiDict, Result, Retrieve, SafeKey,
    TagCondition, TagState, TransformOutcome, ValueInput, ValueState,
};

/// An append-only [`PersiDict`] facade with a trusted value cache.
pub struct AppendOnlyCacheWrapper<V, M, C> {
    main: M,
    cache: C,
    config: DictConfig,
    _values: PhantomData<fn() -> V>,
}

impl<V, M, C> AppendOnlyCacheWrapper<V, M, C>
where
    V: Clone + Send + Sync + 'static,
    M: PersiDict<V>,
    C: PersiDict<V>,
{
    /// Compose an append-only main store with an append-only value cache.
    pub fn new(main: M, cache: C) -> Result<Self> {
        if !main.config().append_only || !cache.config().append_only {
            return Err(CairnError::Unsupported {
                message: "both the main store and the cache must be append-only".to_string(),
            });
        }
        let config = main.config().clone();
        Ok(Self {
            main,
            cache,
            config,
            _values: PhantomData,
        })
    }

    /// The wrapped main store.
    pub fn main(&self) -> &M {
        &self.main
    }

    /// Mirror a value into the cache.
    ///
    /// Two readers can race to fill the same slot; the append-only cache
    /// rejects the second write of the identical immutable value, which is
    /// absorbed here.
    async fn cache_fill(&self, key: &SafeKey, value: &V) -> Result<()> {
        match self.cache.put(key, value.clone()).await {
            Ok(()) => Ok(()),
            Err(CairnError::MutationPolicy { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn cache_from_outcome(&self, key: &SafeKey, res: &ConditionalOutcome<V>) -> Result<()> {
        if let ValueState::Value(v) = &res.new_value {
            if !self.cache.contains(key).await? {
                self.cache_fill(key, v).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<V, M, C> PersiDict<V> for AppendOnlyCacheWrapper<V, M, C>
where
    V: Clone + Send + Sync + 'static,
    M: PersiDict<V>,
    C: PersiDict<V>,
{
    fn config(&self) -> &DictConfig {
        &self.config
    }

    async fn contains(&self, key: &SafeKey) -> Result<bool> {
        // Items never leave the main store, so a cached key is proof.
        if self.cache.contains(key).await? {
            return Ok(true);
        }
        self.main.contains(key).await
    }

    async fn get(&self, key: &SafeKey) -> Result<V> {
        if let Some(v) = self.cache.get_opt(key).await? {
            debug!(key = %key, "cache hit");
            return Ok(v);
        }
        let value = self.main.get(key).await?;
        self.cache_fill(key, &value).await?;
        Ok(value)
    }

    async fn put(&self, key: &SafeKey, value: V) -> Result<()> {
        let res = self
            .main
            .setdefault_if(
                key,
                value.clone(),
                TagState::Absent,
                TagCondition::Any,
                Retrieve::Never,
            )
            .await?;
        if !res.value_was_mutated() {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        self.cache_fill(key, &value).await
    }

    async fn remove(&self, _key: &SafeKey) -> Result<()> {
        Err(CairnError::MutationPolicy {
            policy: "append-only",
        })
    }

    async fn keys(&self) -> Result<Vec<SafeKey>> {
        self.main.keys().await
    }

    async fn items(&self) -> Result<Vec<(SafeKey, V)>> {
        self.main.items().await
    }

    /// Delegated to the main store to preserve backend-native ETag
    /// semantics.
    async fn etag(&self, key: &SafeKey) -> Result<ETag> {
        self.main.etag(key).await
    }

    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>> {
        self.main.timestamp(key).await
    }

    async fn subdict(&self, prefix: &SafeKey) -> Result<Self> {
        Self::new(
            self.main.subdict(prefix).await?,
            self.cache.subdict(prefix).await?,
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
        self.cache_from_outcome(key, &res).await?;
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
        self.cache_from_outcome(key, &res).await?;
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
        self.cache_from_outcome(key, &res).await?;
        Ok(res)
    }

    async fn discard_item_if(
        &self,
        _key: &SafeKey,
        _expected: TagState,
        _condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>> {
        Err(CairnError::Unsupported {
            message: "append-only dictionaries do not support conditional deletion".to_string(),
        })
    }

    async fn transform_item<F>(
        &self,
        _key: &SafeKey,
        _transformer: F,
        _n_retries: Option<u32>,
    ) -> Result<TransformOutcome<V>>
    where
        F: Fn(&ValueState<V>) -> ValueInput<V> + Send + Sync,
        V: Clone,
        Self: Sized,
    {
        Err(CairnError::Unsupported {
            message: "append-only dictionaries do not support transforms".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_storage::MemoryBackend;

    type Wrapped = AppendOnlyCacheWrapper<i64, MemoryBackend<i64>, MemoryBackend<i64>>;

    fn key(parts: &[&str]) -> SafeKey {
        SafeKey::new(parts.to_vec()).unwrap()
    }

    fn wrapped() -> (Wrapped, MemoryBackend<i64>) {
        let main: MemoryBackend<i64> = MemoryBackend::new_append_only();
        let wrapper =
            AppendOnlyCacheWrapper::new(main.clone(), MemoryBackend::new_append_only()).unwrap();
        (wrapper, main)
    }

    #[tokio::test]
    async fn test_rejects_mutable_parts() {
        let err = AppendOnlyCacheWrapper::new(
            MemoryBackend::<i64>::new(),
            MemoryBackend::<i64>::new_append_only(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CairnError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_read_populates_cache_then_trusts_it() {
        let (dict, main) = wrapped();
        let k = key(&["k"]);
        main.put(&k, 5).await.unwrap();

        assert_eq!(dict.get(&k).await.unwrap(), 5);
        assert_eq!(dict.cache.get(&k).await.unwrap(), 5);
        // Second read is served from the cache.
        assert_eq!(dict.get(&k).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_write_mirrors_into_cache() {
        let (dict, main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();
        assert_eq!(main.get(&k).await.unwrap(), 1);
        assert_eq!(dict.cache.get(&k).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_rejected() {
        let (dict, _main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();
        assert!(matches!(
            dict.put(&k, 2).await.unwrap_err(),
            CairnError::MutationPolicy { .. }
        ));
    }

    #[tokio::test]
    async fn test_removal_and_transform_rejected_at_boundary() {
        let (dict, _main) = wrapped();
        let k = key(&["k"]);
        dict.put(&k, 1).await.unwrap();

        assert!(matches!(
            dict.remove(&k).await.unwrap_err(),
            CairnError::MutationPolicy { .. }
        ));
        assert!(matches!(
            dict.discard_item_if(&k, TagState::Absent, TagCondition::Any)
                .await
                .unwrap_err(),
            CairnError::Unsupported { .. }
        ));
        assert!(matches!(
            dict.transform_item(&k, |_| ValueInput::Value(2), Some(1))
                .await
                .unwrap_err(),
            CairnError::Unsupported { .. }
        ));
    }

    #[tokio::test]
    async fn test_conditional_insert_delegates_and_caches() {
        let (dict, main) = wrapped();
        let k = key(&["k"]);
        let out = dict
            .setdefault_if(
                &k,
                9,
                TagState::Absent,
                TagCondition::MustMatch,
                Retrieve::Always,
            )
            .await
            .unwrap();
        assert!(out.satisfied);
        assert_eq!(main.get(&k).await.unwrap(), 9);
        assert_eq!(dict.cache.get(&k).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_contains_trusts_cache() {
        let (dict, main) = wrapped();
        let k = key(&["k"]);
        main.put(&k, 1).await.unwrap();
        assert!(dict.contains(&k).await.unwrap());
        dict.get(&k).await.unwrap();
        assert!(dict.contains(&k).await.unwrap());
    }
}
