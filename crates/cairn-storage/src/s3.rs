//! S3-compatible object storage backend.
//!
//! [`S3Backend`] stores each item as one object: key components joined with
//! `/` under an optional root prefix, with the codec's extension appended.
//! It uses the `object_store` crate and works against any S3-compatible
//! endpoint (AWS S3, MinIO, Ceph, GCS in S3 mode).
//!
//! The item ETag is the native object ETag reported by HEAD/PUT. Conditional
//! writes map onto `object_store` put modes: `PutMode::Create` for
//! insert-iff-absent (`If-None-Match: *`) and `PutMode::Update` with an
//! expected tag for write-iff-unchanged (`If-Match`). The whole
//! check-and-act runs server-side, so these paths are atomic across
//! processes and machines. Variants that condition on "different from a
//! known tag" need a preceding HEAD to learn the actual tag to CAS against.
//!
//! A 412/409 response surfaces as a not-satisfied outcome after a re-read
//! of the current tag; it is never propagated as a transport error.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Error as StoreError, GetOptions, ObjectStore, PutMode, PutOptions, PutPayload, PutResult,
    UpdateVersion,
};
use tracing::{debug, instrument};

use cairn_core::key::is_safe_component;
use cairn_core::{
    CairnError, Codec, ConditionalOutcome, DictConfig, ETag, PersiDict, Result, Retrieve, SafeKey,
    TagCondition, TagState, ValueInput, ValueState,
};

/// Construction options for [`S3Backend::connect`].
#[derive(Debug, Clone)]
pub struct S3Options {
    /// Target bucket.
    pub bucket: String,
    /// AWS region; falls back to `AWS_REGION` when unset.
    pub region: Option<String>,
    /// Custom endpoint for MinIO and other S3-compatible services.
    pub endpoint: Option<String>,
    /// Common object-key prefix under which all items live.
    pub root_prefix: String,
    /// Forbid overwrites and deletes of existing items.
    pub append_only: bool,
}

impl S3Options {
    /// Options for a bucket with defaults for everything else.
    pub fn bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            root_prefix: String::new(),
            append_only: false,
        }
    }
}

/// Normalize a root prefix to either `""` or `"segment/segment/"`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Outcome of one conditional PUT attempt.
enum PutAttempt {
    Committed(PutResult),
    /// The store rejected the precondition (412) or the create collided
    /// with an existing object (409).
    Conflict,
}

/// A [`PersiDict`] backed by S3-compatible object storage.
pub struct S3Backend<V> {
    store: Arc<dyn ObjectStore>,
    root_prefix: String,
    codec: Arc<dyn Codec<V>>,
    config: DictConfig,
}

impl<V> Clone for S3Backend<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root_prefix: self.root_prefix.clone(),
            codec: Arc::clone(&self.codec),
            config: self.config.clone(),
        }
    }
}

impl<V> S3Backend<V>
where
    V: Send + Sync + 'static,
{
    /// Connect to an S3-compatible endpoint.
    ///
    /// Credentials come from the usual `AWS_ACCESS_KEY_ID` /
    /// `AWS_SECRET_ACCESS_KEY` environment. Bucket lifecycle is an
    /// infrastructure concern; a missing bucket surfaces as a backend
    /// failure on first use.
    pub fn connect(options: S3Options, codec: Arc<dyn Codec<V>>) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&options.bucket);
        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &options.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        let store = builder.build().map_err(|e| {
            CairnError::backend(
                "s3",
                "init",
                None,
                format!("failed to create S3 client for bucket {}", options.bucket),
                e,
            )
        })?;
        debug!(bucket = %options.bucket, prefix = %options.root_prefix, "S3Backend initialised");
        Ok(Self::with_store(
            Arc::new(store),
            &options.root_prefix,
            codec,
            options.append_only,
        ))
    }

    /// Wrap an existing `ObjectStore`.
    ///
    /// Useful for tests (`object_store::memory::InMemory`) and for
    /// alternative object stores with S3 semantics.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        root_prefix: &str,
        codec: Arc<dyn Codec<V>>,
        append_only: bool,
    ) -> Self {
        let config = DictConfig::new(codec.extension()).append_only(append_only);
        Self {
            store,
            root_prefix: normalize_prefix(root_prefix),
            codec,
            config,
        }
    }

    fn extension(&self) -> &str {
        &self.config.serialization_format
    }

    fn object_path(&self, key: &SafeKey) -> ObjectPath {
        ObjectPath::from(format!(
            "{}{}.{}",
            self.root_prefix,
            key.components().join("/"),
            self.extension()
        ))
    }

    fn list_prefix(&self) -> Option<ObjectPath> {
        if self.root_prefix.is_empty() {
            None
        } else {
            Some(ObjectPath::from(self.root_prefix.trim_end_matches('/')))
        }
    }

    /// Map an object location back to a key; foreign objects yield `None`.
    fn key_from_object(&self, location: &ObjectPath) -> Option<SafeKey> {
        let full = location.to_string();
        let rel = if self.root_prefix.is_empty() {
            full.as_str()
        } else {
            full.strip_prefix(self.root_prefix.as_str())?
        };
        let suffix = format!(".{}", self.extension());
        let stem = rel.strip_suffix(suffix.as_str())?;
        let parts: Vec<&str> = stem.split('/').collect();
        if !parts.iter().all(|p| is_safe_component(p)) {
            return None;
        }
        SafeKey::new(parts).ok()
    }

    async fn head_state(&self, key: &SafeKey) -> Result<TagState> {
        match self.store.head(&self.object_path(key)).await {
            Ok(meta) => match meta.e_tag {
                Some(tag) => Ok(TagState::Present(ETag::new(tag))),
                None => Err(CairnError::backend_msg(
                    "s3",
                    "head",
                    Some(key.clone()),
                    "object store reported no etag",
                )),
            },
            Err(StoreError::NotFound { .. }) => Ok(TagState::Absent),
            Err(e) => Err(CairnError::backend(
                "s3",
                "head",
                Some(key.clone()),
                format!("HEAD failed for {key}"),
                e,
            )),
        }
    }

    /// Plain GET + decode; `None` when the object is gone.
    async fn fetch(&self, key: &SafeKey) -> Result<Option<V>> {
        match self.store.get(&self.object_path(key)).await {
            Ok(got) => {
                let data = got.bytes().await.map_err(|e| {
                    CairnError::backend(
                        "s3",
                        "get",
                        Some(key.clone()),
                        format!("body read failed for {key}"),
                        e,
                    )
                })?;
                Ok(Some(self.codec.decode(&data)?))
            }
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(CairnError::backend(
                "s3",
                "get",
                Some(key.clone()),
                format!("GET failed for {key}"),
                e,
            )),
        }
    }

    async fn try_put(&self, key: &SafeKey, data: Bytes, mode: PutMode) -> Result<PutAttempt> {
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        match self
            .store
            .put_opts(&self.object_path(key), PutPayload::from(data), opts)
            .await
        {
            Ok(res) => Ok(PutAttempt::Committed(res)),
            // 412 Precondition Failed / 409 Conflict: another writer holds
            // the version we demanded. A NotFound on an If-Match PUT means
            // the object vanished under the demanded version, which is the
            // same lost race. Reported as a result, not an error.
            Err(StoreError::Precondition { .. })
            | Err(StoreError::AlreadyExists { .. })
            | Err(StoreError::NotFound { .. }) => Ok(PutAttempt::Conflict),
            Err(e) => Err(CairnError::backend(
                "s3",
                "put",
                Some(key.clone()),
                format!("conditional PUT failed for {key}"),
                e,
            )),
        }
    }

    /// The tag to report after a committed PUT; falls back to a HEAD when
    /// the store did not echo one.
    async fn resulting_tag(&self, key: &SafeKey, res: PutResult) -> Result<TagState> {
        match res.e_tag {
            Some(tag) => Ok(TagState::Present(ETag::new(tag))),
            None => self.head_state(key).await,
        }
    }

    /// A no-mutation outcome for the given observed state, with the value
    /// slot filled per the retrieval rules.
    async fn state_outcome(
        &self,
        key: &SafeKey,
        expected: &TagState,
        actual: TagState,
        satisfied: bool,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        if actual.is_absent() {
            return Ok(ConditionalOutcome::absent(satisfied));
        }
        let new_value = if retrieve.wants_fetch(expected, &actual) {
            match self.fetch(key).await? {
                Some(v) => ValueState::Value(v),
                None => ValueState::Absent,
            }
        } else {
            ValueState::NotRetrieved
        };
        Ok(ConditionalOutcome {
            satisfied,
            actual_etag: actual.clone(),
            resulting_etag: actual,
            new_value,
        })
    }

    /// Re-read the current state after a conflicting PUT and report
    /// not-satisfied.
    async fn conflict_outcome(
        &self,
        key: &SafeKey,
        expected: &TagState,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let actual = self.head_state(key).await?;
        let satisfied = false;
        self.state_outcome(key, expected, actual, satisfied, retrieve)
            .await
    }

    fn committed_value(&self, v: V, expected: &TagState, resulting: &TagState, retrieve: Retrieve) -> ValueState<V> {
        match retrieve {
            Retrieve::Never => ValueState::NotRetrieved,
            Retrieve::Always => ValueState::Value(v),
            Retrieve::IfChanged => {
                if resulting != expected {
                    ValueState::Value(v)
                } else {
                    ValueState::NotRetrieved
                }
            }
        }
    }
}

#[async_trait]
impl<V> PersiDict<V> for S3Backend<V>
where
    V: Send + Sync + 'static,
{
    fn config(&self) -> &DictConfig {
        &self.config
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn contains(&self, key: &SafeKey) -> Result<bool> {
        Ok(!self.head_state(key).await?.is_absent())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &SafeKey) -> Result<V> {
        self.fetch(key)
            .await?
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn put(&self, key: &SafeKey, value: V) -> Result<()> {
        let data = self.codec.encode(&value)?;
        let mode = if self.config.append_only {
            PutMode::Create
        } else {
            PutMode::Overwrite
        };
        match self.try_put(key, data, mode).await? {
            PutAttempt::Committed(_) => Ok(()),
            PutAttempt::Conflict => Err(CairnError::MutationPolicy {
                policy: "append-only",
            }),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn remove(&self, key: &SafeKey) -> Result<()> {
        if self.config.append_only {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        if self.head_state(key).await?.is_absent() {
            return Err(CairnError::KeyMissing { key: key.clone() });
        }
        match self.store.delete(&self.object_path(key)).await {
            Ok(()) => Ok(()),
            // Deleted by someone else between the HEAD and the DELETE;
            // the key is gone either way.
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(CairnError::backend(
                "s3",
                "delete",
                Some(key.clone()),
                format!("DELETE failed for {key}"),
                e,
            )),
        }
    }

    async fn keys(&self) -> Result<Vec<SafeKey>> {
        let prefix = self.list_prefix();
        let mut stream = self.store.list(prefix.as_ref());
        let mut out = Vec::new();
        while let Some(meta) = stream.try_next().await.map_err(|e| {
            CairnError::backend("s3", "list", None, "LIST failed", e)
        })? {
            if let Some(key) = self.key_from_object(&meta.location) {
                out.push(key);
            }
        }
        Ok(out)
    }

    async fn items(&self) -> Result<Vec<(SafeKey, V)>> {
        let mut out = Vec::new();
        for key in self.keys().await? {
            // Objects can vanish between LIST and GET.
            if let Some(value) = self.fetch(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn etag(&self, key: &SafeKey) -> Result<ETag> {
        match self.head_state(key).await? {
            TagState::Present(tag) => Ok(tag),
            TagState::Absent => Err(CairnError::KeyMissing { key: key.clone() }),
        }
    }

    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>> {
        match self.store.head(&self.object_path(key)).await {
            Ok(meta) => Ok(meta.last_modified),
            Err(StoreError::NotFound { .. }) => Err(CairnError::KeyMissing { key: key.clone() }),
            Err(e) => Err(CairnError::backend(
                "s3",
                "head",
                Some(key.clone()),
                format!("HEAD failed for {key}"),
                e,
            )),
        }
    }

    async fn subdict(&self, prefix: &SafeKey) -> Result<Self> {
        let extended = format!("{}{}/", self.root_prefix, prefix.components().join("/"));
        Ok(Self {
            store: Arc::clone(&self.store),
            root_prefix: extended,
            codec: Arc::clone(&self.codec),
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
        // Bandwidth fast path: let the server decide via If-None-Match, so
        // an unchanged body is never transferred. Only valid for IfChanged:
        // an Always retrieve wants the body even when the tag matches.
        if let (TagCondition::MustDiffer, TagState::Present(e)) = (&condition, &expected) {
            if retrieve == Retrieve::IfChanged {
                let opts = GetOptions {
                    if_none_match: Some(e.0.clone()),
                    ..Default::default()
                };
                return match self.store.get_opts(&self.object_path(key), opts).await {
                    Ok(got) => {
                        let actual = match &got.meta.e_tag {
                            Some(tag) => TagState::Present(ETag::new(tag.clone())),
                            None => {
                                return Err(CairnError::backend_msg(
                                    "s3",
                                    "get",
                                    Some(key.clone()),
                                    "object store reported no etag",
                                ))
                            }
                        };
                        let data = got.bytes().await.map_err(|e| {
                            CairnError::backend(
                                "s3",
                                "get",
                                Some(key.clone()),
                                format!("body read failed for {key}"),
                                e,
                            )
                        })?;
                        let value = self.codec.decode(&data)?;
                        Ok(ConditionalOutcome {
                            satisfied: true,
                            actual_etag: actual.clone(),
                            resulting_etag: actual,
                            new_value: ValueState::Value(value),
                        })
                    }
                    Err(StoreError::NotModified { .. }) => Ok(ConditionalOutcome {
                        satisfied: false,
                        actual_etag: expected.clone(),
                        resulting_etag: expected,
                        new_value: ValueState::NotRetrieved,
                    }),
                    Err(StoreError::NotFound { .. }) => Ok(ConditionalOutcome::absent(
                        condition.satisfied_by(&expected, &TagState::Absent),
                    )),
                    Err(e) => Err(CairnError::backend(
                        "s3",
                        "get",
                        Some(key.clone()),
                        format!("conditional GET failed for {key}"),
                        e,
                    )),
                };
            }
        }

        let actual = self.head_state(key).await?;
        let satisfied = condition.satisfied_by(&expected, &actual);
        self.state_outcome(key, &expected, actual, satisfied, retrieve)
            .await
    }

    async fn set_item_if(
        &self,
        key: &SafeKey,
        value: ValueInput<V>,
        expected: TagState,
        condition: TagCondition,
        retrieve: Retrieve,
    ) -> Result<ConditionalOutcome<V>> {
        let v = match value {
            ValueInput::Value(v) => v,
            ValueInput::KeepCurrent => {
                let actual = self.head_state(key).await?;
                let satisfied = condition.satisfied_by(&expected, &actual);
                return self
                    .state_outcome(key, &expected, actual, satisfied, retrieve)
                    .await;
            }
            ValueInput::DeleteCurrent => {
                return self.discard_item_if(key, expected, condition).await;
            }
        };
        let data = self.codec.encode(&v)?;

        // Fast path: write-iff-unchanged runs as a single conditional PUT.
        if let (TagCondition::MustMatch, TagState::Present(e)) = (&condition, &expected) {
            if !self.config.append_only {
                let mode = PutMode::Update(UpdateVersion {
                    e_tag: Some(e.0.clone()),
                    version: None,
                });
                return match self.try_put(key, data, mode).await? {
                    PutAttempt::Committed(res) => {
                        let resulting = self.resulting_tag(key, res).await?;
                        let new_value = self.committed_value(v, &expected, &resulting, retrieve);
                        Ok(ConditionalOutcome {
                            satisfied: true,
                            actual_etag: expected,
                            resulting_etag: resulting,
                            new_value,
                        })
                    }
                    PutAttempt::Conflict => self.conflict_outcome(key, &expected, retrieve).await,
                };
            }
        }

        // Insert-iff-absent runs as a single PUT with If-None-Match: *.
        if let (TagCondition::MustMatch, TagState::Absent) = (&condition, &expected) {
            return match self.try_put(key, data, PutMode::Create).await? {
                PutAttempt::Committed(res) => {
                    let resulting = self.resulting_tag(key, res).await?;
                    let new_value = self.committed_value(v, &expected, &resulting, retrieve);
                    Ok(ConditionalOutcome {
                        satisfied: true,
                        actual_etag: TagState::Absent,
                        resulting_etag: resulting,
                        new_value,
                    })
                }
                PutAttempt::Conflict => self.conflict_outcome(key, &expected, retrieve).await,
            };
        }

        // Remaining variants need the actual tag first: ANY_ETAG (no
        // condition header but the result reports the prior state) and
        // write-iff-different (CAS against the tag observed by the HEAD).
        let actual = self.head_state(key).await?;
        let satisfied = condition.satisfied_by(&expected, &actual);
        if !satisfied {
            return self
                .state_outcome(key, &expected, actual, false, retrieve)
                .await;
        }
        if self.config.append_only && !actual.is_absent() {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        let mode = match (&condition, &actual) {
            (_, TagState::Absent) => PutMode::Create,
            (TagCondition::Any, TagState::Present(_)) => PutMode::Overwrite,
            (_, TagState::Present(a)) => PutMode::Update(UpdateVersion {
                e_tag: Some(a.0.clone()),
                version: None,
            }),
        };
        match self.try_put(key, data, mode).await? {
            PutAttempt::Committed(res) => {
                let resulting = self.resulting_tag(key, res).await?;
                let new_value = self.committed_value(v, &expected, &resulting, retrieve);
                Ok(ConditionalOutcome {
                    satisfied: true,
                    actual_etag: actual,
                    resulting_etag: resulting,
                    new_value,
                })
            }
            PutAttempt::Conflict => self.conflict_outcome(key, &expected, retrieve).await,
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
        let actual = self.head_state(key).await?;
        if !actual.is_absent() {
            let satisfied = condition.satisfied_by(&expected, &actual);
            return self
                .state_outcome(key, &expected, actual, satisfied, retrieve)
                .await;
        }
        if !condition.satisfied_by(&expected, &TagState::Absent) {
            return Ok(ConditionalOutcome::absent(false));
        }

        let data = self.codec.encode(&default)?;
        match self.try_put(key, data, PutMode::Create).await? {
            PutAttempt::Committed(res) => {
                let resulting = self.resulting_tag(key, res).await?;
                let new_value = match retrieve {
                    Retrieve::Never => ValueState::NotRetrieved,
                    _ => ValueState::Value(default),
                };
                Ok(ConditionalOutcome {
                    satisfied: true,
                    actual_etag: TagState::Absent,
                    resulting_etag: resulting,
                    new_value,
                })
            }
            // Lost the insert race: report the freshly observed state.
            PutAttempt::Conflict => {
                let actual = self.head_state(key).await?;
                let satisfied = condition.satisfied_by(&expected, &actual);
                self.state_outcome(key, &expected, actual, satisfied, retrieve)
                    .await
            }
        }
    }

    /// Conditionally delete. `object_store` exposes no conditional DELETE,
    /// so this is check-then-act: HEAD, evaluate, DELETE. The window is the
    /// same one the filesystem backend documents.
    async fn discard_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>> {
        let actual = self.head_state(key).await?;
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
        match self.store.delete(&self.object_path(key)).await {
            Ok(()) => {}
            // Already deleted by a concurrent caller; the end state is the
            // one we wanted.
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => {
                return Err(CairnError::backend(
                    "s3",
                    "delete",
                    Some(key.clone()),
                    format!("DELETE failed for {key}"),
                    e,
                ))
            }
        }
        Ok(ConditionalOutcome {
            satisfied: true,
            actual_etag: actual,
            resulting_etag: TagState::Absent,
            new_value: ValueState::Absent,
        })
    }
}
