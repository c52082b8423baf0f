//! First-write-wins policy layer.
//!
//! [`WriteOnceWrapper`] assumes every write to a given key carries the same
//! value, so repeated writes are silently ignored instead of rejected. An
//! optional sampling probability spot-checks that assumption: when a
//! repeated write is sampled, the incoming value is compared against the
//! stored one and a mismatch surfaces as a policy violation. Deletes always
//! violate the policy.
//!
//! The insert itself routes through the inner dictionary's conditional
//! surface, so it is exactly as atomic as the backend underneath.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

use cairn_core::{
    CairnError, ConditionalOutcome, DictConfig, ETag, PersiDict, Result, Retrieve, SafeKey,
    TagCondition, TagState, TransformOutcome, ValueInput, ValueState,
};

/// A [`PersiDict`] facade that keeps the first value written per key.
pub struct WriteOnceWrapper<V, W> {
    inner: W,
    p_consistency_checks: f64,
    checks_attempted: AtomicU64,
    checks_passed: AtomicU64,
    config: DictConfig,
    _values: PhantomData<fn() -> V>,
}

impl<V, W> WriteOnceWrapper<V, W>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    W: PersiDict<V>,
{
    /// Wrap an append-only dictionary.
    ///
    /// `p_consistency_checks` is the probability in `[0, 1]` that a write
    /// to an existing key is verified against the stored value; 0 disables
    /// checking, 1 checks every repeated write.
    pub fn new(inner: W, p_consistency_checks: f64) -> Result<Self> {
        if !inner.config().append_only {
            return Err(CairnError::Unsupported {
                message: "the wrapped dictionary must be append-only".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&p_consistency_checks) {
            return Err(CairnError::Unsupported {
                message: format!(
                    "p_consistency_checks must be in [0, 1], got {p_consistency_checks}"
                ),
            });
        }
        let config = inner.config().clone();
        Ok(Self {
            inner,
            p_consistency_checks,
            checks_attempted: AtomicU64::new(0),
            checks_passed: AtomicU64::new(0),
            config,
            _values: PhantomData,
        })
    }

    /// The wrapped dictionary.
    pub fn inner(&self) -> &W {
        &self.inner
    }

    /// Configured sampling probability.
    pub fn p_consistency_checks(&self) -> f64 {
        self.p_consistency_checks
    }

    /// Number of sampled checks run so far.
    pub fn consistency_checks_attempted(&self) -> u64 {
        self.checks_attempted.load(Ordering::Relaxed)
    }

    /// Number of sampled checks that found matching values.
    pub fn consistency_checks_passed(&self) -> u64 {
        self.checks_passed.load(Ordering::Relaxed)
    }

    /// Number of sampled checks that found diverging values.
    pub fn consistency_checks_failed(&self) -> u64 {
        self.consistency_checks_attempted() - self.consistency_checks_passed()
    }

    /// Compare decoded values structurally; a mismatch is a policy
    /// violation, not a codec concern.
    fn run_check(&self, key: &SafeKey, incoming: &V, stored: &V) -> Result<()> {
        self.checks_attempted.fetch_add(1, Ordering::Relaxed);
        if incoming != stored {
            return Err(CairnError::MutationPolicy {
                policy: "write-once",
            });
        }
        self.checks_passed.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "repeated write matched stored value");
        Ok(())
    }
}

#[async_trait]
impl<V, W> PersiDict<V> for WriteOnceWrapper<V, W>
where
    V: Clone + PartialEq + Send + Sync + 'static,
    W: PersiDict<V>,
{
    fn config(&self) -> &DictConfig {
        &self.config
    }

    async fn contains(&self, key: &SafeKey) -> Result<bool> {
        self.inner.contains(key).await
    }

    async fn get(&self, key: &SafeKey) -> Result<V> {
        self.inner.get(key).await
    }

    /// Insert if absent; ignore (optionally verify) otherwise.
    async fn put(&self, key: &SafeKey, value: V) -> Result<()> {
        let always_check = self.p_consistency_checks >= 1.0;
        let retrieve = if always_check {
            Retrieve::Always
        } else {
            Retrieve::Never
        };
        let res = self
            .inner
            .setdefault_if(
                key,
                value.clone(),
                TagState::Absent,
                TagCondition::Any,
                retrieve,
            )
            .await?;

        if res.value_was_mutated() {
            return Ok(());
        }
        if always_check {
            if let ValueState::Value(stored) = &res.new_value {
                self.run_check(key, &value, stored)?;
            }
        } else if self.p_consistency_checks > 0.0
            && rand::thread_rng().gen::<f64>() < self.p_consistency_checks
        {
            if let Some(stored) = self.inner.get_opt(key).await? {
                self.run_check(key, &value, &stored)?;
            }
        }
        Ok(())
    }

    async fn remove(&self, _key: &SafeKey) -> Result<()> {
        Err(CairnError::MutationPolicy {
            policy: "write-once",
        })
    }

    async fn keys(&self) -> Result<Vec<SafeKey>> {
        self.inner.keys().await
    }

    async fn items(&self) -> Result<Vec<(SafeKey, V)>> {
        self.inner.items().await
    }

    async fn etag(&self, key: &SafeKey) -> Result<ETag> {
        self.inner.etag(key).await
    }

    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>> {
        self.inner.timestamp(key).await
    }

    async fn subdict(&self, prefix: &SafeKey) -> Result<Self> {
        Self::new(
            self.inner.subdict(prefix).await?,
            self.p_consistency_checks,
        )
    }

    async fn get_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        self.inner
            .get_item_if(key, expected, condition, retrieve)
            .await
    }

    /// Conditional overwrites contradict first-write-wins; use
    /// [`PersiDict::setdefault_if`] for conditional inserts.
    async fn set_item_if(
        &self,
        _key: &SafeKey,
        _value: ValueInput<V>,
        _expected: TagState,
        _condition: TagCondition,
        _retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        Err(CairnError::Unsupported {
            message: "write-once dictionaries do not support conditional overwrites".to_string(),
        })
    }

    async fn setdefault_if(
        &self,
        key: &SafeKey,
        default: V,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        self.inner
            .setdefault_if(key, default, expected, condition, retrieve)
            .await
    }

    async fn discard_item_if(
        &self,
        _key: &SafeKey,
        _expected: TagState,
        _condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>> {
        Err(CairnError::MutationPolicy {
            policy: "write-once",
        })
    }

    async fn clear(&self) -> Result<()> {
        Err(CairnError::MutationPolicy {
            policy: "write-once",
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
            message: "write-once dictionaries do not support transforms".to_string(),
        })
    }
}
