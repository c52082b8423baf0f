//! Filesystem-backed persistent dictionary.
//!
//! [`FileDirBackend`] stores one file per item: the key's non-terminal
//! components become nested subdirectories under a base directory, the
//! terminal component (digest-suffixed when configured) becomes the
//! filename, and the codec's extension is appended.
//!
//! Writes materialize to a temporary sibling file and are moved into place
//! with an atomic rename, so readers observe either the whole old or the
//! whole new content, never a partial file. Conditional operations are
//! check-then-act: the current ETag is read, the condition evaluated, then
//! the mutation performed. This window is deliberate — advisory OS file
//! locks are not reliably propagated by shared-folder sync services, so
//! callers needing cross-process atomicity are directed to the S3 backend.
//!
//! ETags derive from stat data as `mtime_ns:size:inode`. The rename
//! replaces the inode, which keeps successive writes distinguishable even
//! under coarse clock resolution; size and mtime cover platforms without
//! stable inode identity.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::fs;
use tracing::{debug, instrument, warn};

use cairn_core::key::is_safe_component;
use cairn_core::{
    CairnError, Codec, ConditionalOutcome, DictConfig, ETag, PersiDict, Result, Retrieve, SafeKey,
    TagCondition, TagState, ValueInput, ValueState,
};

use crate::signing::{sign_component, unsign_component};

/// How many times a failed rename is retried before surfacing as a backend
/// failure. Transient `PermissionDenied` during rename is a known Windows
/// antivirus artifact.
const RENAME_RETRIES: u32 = 5;

/// Construction options for [`FileDirBackend`].
#[derive(Debug, Clone)]
pub struct FileDirOptions {
    /// Forbid overwrites and deletes of existing items.
    pub append_only: bool,
    /// Hex chars of digest suffix per rendered component; 0 disables.
    pub digest_len: usize,
}

impl Default for FileDirOptions {
    fn default() -> Self {
        Self {
            append_only: false,
            digest_len: 8,
        }
    }
}

/// A [`PersiDict`] storing each item as a file under a base directory.
pub struct FileDirBackend<V> {
    base_dir: PathBuf,
    codec: Arc<dyn Codec<V>>,
    config: DictConfig,
}

impl<V> Clone for FileDirBackend<V> {
    fn clone(&self) -> Self {
        Self {
            base_dir: self.base_dir.clone(),
            codec: Arc::clone(&self.codec),
            config: self.config.clone(),
        }
    }
}

/// Derive the item ETag from stat data.
fn etag_from_metadata(meta: &std::fs::Metadata) -> ETag {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    #[cfg(unix)]
    let inode = std::os::unix::fs::MetadataExt::ino(meta);
    #[cfg(not(unix))]
    let inode: u64 = 0;
    ETag::new(format!("{mtime_ns}:{}:{inode}", meta.len()))
}

impl<V> FileDirBackend<V>
where
    V: Send + Sync + 'static,
{
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    pub async fn open(base_dir: impl Into<PathBuf>, codec: Arc<dyn Codec<V>>) -> Result<Self> {
        Self::open_with(base_dir, codec, FileDirOptions::default()).await
    }

    /// Open a store with explicit options.
    pub async fn open_with(
        base_dir: impl Into<PathBuf>,
        codec: Arc<dyn Codec<V>>,
        options: FileDirOptions,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await.map_err(|e| {
            CairnError::backend(
                "filesystem",
                "init",
                None,
                format!("failed to create base directory {}", base_dir.display()),
                e,
            )
        })?;
        let config = DictConfig::new(codec.extension())
            .append_only(options.append_only)
            .digest_len(options.digest_len);
        debug!(base_dir = %base_dir.display(), format = %config.serialization_format, "FileDirBackend initialised");
        Ok(Self {
            base_dir,
            codec,
            config,
        })
    }

    /// The root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn extension(&self) -> &str {
        &self.config.serialization_format
    }

    /// Render a key to its file path, applying the digest suffix to every
    /// component.
    fn file_path(&self, key: &SafeKey) -> PathBuf {
        let mut path = self.base_dir.clone();
        for component in key.parents() {
            path.push(sign_component(component, self.config.digest_len));
        }
        let leaf = sign_component(key.leaf(), self.config.digest_len);
        path.push(format!("{leaf}.{}", self.extension()));
        path
    }

    /// Render a key prefix to its directory path.
    fn dir_path(&self, prefix: &SafeKey) -> PathBuf {
        let mut path = self.base_dir.clone();
        for component in prefix.components() {
            path.push(sign_component(component, self.config.digest_len));
        }
        path
    }

    async fn stat(&self, key: &SafeKey) -> Result<Option<std::fs::Metadata>> {
        match fs::metadata(self.file_path(key)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CairnError::backend(
                "filesystem",
                "stat",
                Some(key.clone()),
                format!("failed to stat {}", self.file_path(key).display()),
                e,
            )),
        }
    }

    async fn tag_state(&self, key: &SafeKey) -> Result<TagState> {
        Ok(self
            .stat(key)
            .await?
            .map(|meta| TagState::Present(etag_from_metadata(&meta)))
            .unwrap_or(TagState::Absent))
    }

    /// Read and decode the item, or `None` when the file is gone.
    async fn read_value(&self, key: &SafeKey) -> Result<Option<V>> {
        match fs::read(self.file_path(key)).await {
            Ok(data) => Ok(Some(self.codec.decode(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CairnError::backend(
                "filesystem",
                "read",
                Some(key.clone()),
                format!("failed to read {}", self.file_path(key).display()),
                e,
            )),
        }
    }

    /// Write via temp sibling + atomic rename; returns the fresh ETag.
    async fn write_atomic(&self, key: &SafeKey, data: &[u8]) -> Result<ETag> {
        let path = self.file_path(key);
        let parent = path.parent().map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent).await.map_err(|e| {
                CairnError::backend(
                    "filesystem",
                    "write",
                    Some(key.clone()),
                    format!("failed to create parent directories for {}", path.display()),
                    e,
                )
            })?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.{:08x}.tmp", rand::random::<u32>()));
        fs::write(&tmp, data).await.map_err(|e| {
            CairnError::backend(
                "filesystem",
                "write",
                Some(key.clone()),
                format!("failed to write temp file {}", tmp.display()),
                e,
            )
        })?;

        let mut attempt = 0;
        loop {
            match fs::rename(&tmp, &path).await {
                Ok(()) => break,
                Err(e)
                    if e.kind() == std::io::ErrorKind::PermissionDenied
                        && attempt < RENAME_RETRIES =>
                {
                    attempt += 1;
                    let backoff = rand::thread_rng().gen_range(10..60) * u64::from(attempt);
                    warn!(
                        key = %key,
                        attempt,
                        "rename denied, backing off {backoff}ms before retry"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(CairnError::backend(
                        "filesystem",
                        "rename",
                        Some(key.clone()),
                        format!("failed to move {} into place", path.display()),
                        e,
                    ));
                }
            }
        }

        // Best-effort durability: directory fsync is rejected by some
        // platforms and shared-folder providers, so failures are absorbed.
        if let Some(parent) = &parent {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        let meta = fs::metadata(&path).await.map_err(|e| {
            CairnError::backend(
                "filesystem",
                "stat",
                Some(key.clone()),
                format!("failed to stat {} after write", path.display()),
                e,
            )
        })?;
        debug!(key = %key, bytes = data.len(), "wrote item");
        Ok(etag_from_metadata(&meta))
    }

    async fn remove_file(&self, key: &SafeKey) -> Result<bool> {
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(true),
            // Already gone; benign for discard-style deletes.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CairnError::backend(
                "filesystem",
                "delete",
                Some(key.clone()),
                format!("failed to delete {}", self.file_path(key).display()),
                e,
            )),
        }
    }

    /// Value slot for a present item per the retrieval rules; a vanished
    /// file reads as absence.
    async fn fetch_per_rules(
        &self,
        key: &SafeKey,
        expected: &TagState,
        actual: &TagState,
        retrieve: Retrieve,
    ) -> Result<ValueState<V>> {
        if retrieve.wants_fetch(expected, actual) {
            Ok(match self.read_value(key).await? {
                Some(v) => ValueState::Value(v),
                None => ValueState::Absent,
            })
        } else {
            Ok(ValueState::NotRetrieved)
        }
    }

    /// Recursively walk the tree, collecting keys of files that carry this
    /// store's extension and a verifying digest suffix. Foreign entries and
    /// entries that vanish mid-walk are skipped.
    fn walk_keys<'a>(
        &'a self,
        dir: PathBuf,
        prefix: Vec<String>,
        out: &'a mut Vec<SafeKey>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    return Err(CairnError::backend(
                        "filesystem",
                        "list",
                        None,
                        format!("failed to read directory {}", dir.display()),
                        e,
                    ))
                }
            };

            let suffix = format!(".{}", self.extension());
            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                CairnError::backend(
                    "filesystem",
                    "list",
                    None,
                    format!("failed to read directory entry in {}", dir.display()),
                    e,
                )
            })? {
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    // Vanished between listing and stat.
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    let component = match unsign_component(&name, self.config.digest_len) {
                        Some(c) if is_safe_component(&c) => c,
                        _ => continue,
                    };
                    let mut child_prefix = prefix.clone();
                    child_prefix.push(component);
                    self.walk_keys(entry.path(), child_prefix, out).await?;
                } else if file_type.is_file() {
                    let Some(stem) = name.strip_suffix(&suffix) else {
                        continue;
                    };
                    let component = match unsign_component(stem, self.config.digest_len) {
                        Some(c) if is_safe_component(&c) => c,
                        _ => continue,
                    };
                    let mut components = prefix.clone();
                    components.push(component);
                    if let Ok(key) = SafeKey::new(components) {
                        out.push(key);
                    }
                }
            }
            Ok(())
        })
    }

    /// Remove empty directories left behind under `dir` after a clear.
    fn prune_empty_dirs<'a>(
        &'a self,
        dir: PathBuf,
        is_root: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                return;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    self.prune_empty_dirs(entry.path(), false).await;
                }
            }
            if !is_root {
                // Fails while non-empty, which is exactly what we want.
                let _ = fs::remove_dir(&dir).await;
            }
        })
    }
}

#[async_trait]
impl<V> PersiDict<V> for FileDirBackend<V>
where
    V: Send + Sync + 'static,
{
    fn config(&self) -> &DictConfig {
        &self.config
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn contains(&self, key: &SafeKey) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &SafeKey) -> Result<V> {
        self.read_value(key)
            .await?
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn put(&self, key: &SafeKey, value: V) -> Result<()> {
        if self.config.append_only && self.stat(key).await?.is_some() {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        let data = self.codec.encode(&value)?;
        self.write_atomic(key, &data).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn remove(&self, key: &SafeKey) -> Result<()> {
        if self.config.append_only {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        if self.remove_file(key).await? {
            Ok(())
        } else {
            Err(CairnError::KeyMissing { key: key.clone() })
        }
    }

    async fn keys(&self) -> Result<Vec<SafeKey>> {
        let mut out = Vec::new();
        self.walk_keys(self.base_dir.clone(), Vec::new(), &mut out)
            .await?;
        Ok(out)
    }

    async fn items(&self) -> Result<Vec<(SafeKey, V)>> {
        let mut out = Vec::new();
        for key in self.keys().await? {
            // Skip entries that vanish between listing and reading.
            if let Some(value) = self.read_value(&key).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn etag(&self, key: &SafeKey) -> Result<ETag> {
        self.stat(key)
            .await?
            .map(|meta| etag_from_metadata(&meta))
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })
    }

    async fn timestamp(&self, key: &SafeKey) -> Result<DateTime<Utc>> {
        let meta = self
            .stat(key)
            .await?
            .ok_or_else(|| CairnError::KeyMissing { key: key.clone() })?;
        let modified = meta.modified().map_err(|e| {
            CairnError::backend(
                "filesystem",
                "stat",
                Some(key.clone()),
                "platform reports no modification time",
                e,
            )
        })?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn subdict(&self, prefix: &SafeKey) -> Result<Self> {
        let dir = self.dir_path(prefix);
        fs::create_dir_all(&dir).await.map_err(|e| {
            CairnError::backend(
                "filesystem",
                "init",
                None,
                format!("failed to create subdict directory {}", dir.display()),
                e,
            )
        })?;
        Ok(Self {
            base_dir: dir,
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
        let actual = self.tag_state(key).await?;
        let satisfied = condition.satisfied_by(&expected, &actual);
        if actual.is_absent() {
            return Ok(ConditionalOutcome::absent(satisfied));
        }
        let new_value = self.fetch_per_rules(key, &expected, &actual, retrieve).await?;
        if new_value.is_absent() {
            // Vanished between the stat and the read.
            return Ok(ConditionalOutcome::absent(
                condition.satisfied_by(&expected, &TagState::Absent),
            ));
        }
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
        let actual = self.tag_state(key).await?;
        let satisfied = condition.satisfied_by(&expected, &actual);

        if !satisfied {
            let new_value = if actual.is_absent() {
                ValueState::Absent
            } else {
                self.fetch_per_rules(key, &expected, &actual, retrieve).await?
            };
            return Ok(ConditionalOutcome {
                satisfied: false,
                actual_etag: actual.clone(),
                resulting_etag: actual,
                new_value,
            });
        }

        match value {
            ValueInput::KeepCurrent => {
                let new_value = if actual.is_absent() {
                    ValueState::Absent
                } else {
                    self.fetch_per_rules(key, &expected, &actual, retrieve).await?
                };
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
                    self.remove_file(key).await?;
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
                let data = self.codec.encode(&v)?;
                let etag = self.write_atomic(key, &data).await?;
                let resulting = TagState::Present(etag);
                let new_value = match retrieve {
                    Retrieve::Never => ValueState::NotRetrieved,
                    Retrieve::Always => ValueState::Value(v),
                    Retrieve::IfChanged => {
                        if resulting != expected {
                            ValueState::Value(v)
                        } else {
                            ValueState::NotRetrieved
                        }
                    }
                };
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
        let actual = self.tag_state(key).await?;
        let satisfied = condition.satisfied_by(&expected, &actual);

        if !actual.is_absent() {
            let new_value = self.fetch_per_rules(key, &expected, &actual, retrieve).await?;
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

        let data = self.codec.encode(&default)?;
        let etag = self.write_atomic(key, &data).await?;
        let new_value = match retrieve {
            Retrieve::Never => ValueState::NotRetrieved,
            _ => ValueState::Value(default),
        };
        Ok(ConditionalOutcome {
            satisfied: true,
            actual_etag: TagState::Absent,
            resulting_etag: TagState::Present(etag),
            new_value,
        })
    }

    async fn discard_item_if(
        &self,
        key: &SafeKey,
        expected: TagState,
        condition: TagCondition,
    ) -> Result<ConditionalOutcome<V>> {
        let actual = self.tag_state(key).await?;
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
        self.remove_file(key).await?;
        Ok(ConditionalOutcome {
            satisfied: true,
            actual_etag: actual,
            resulting_etag: TagState::Absent,
            new_value: ValueState::Absent,
        })
    }

    async fn clear(&self) -> Result<()> {
        if self.config.append_only {
            return Err(CairnError::MutationPolicy {
                policy: "append-only",
            });
        }
        for key in self.keys().await? {
            self.discard(&key).await?;
        }
        self.prune_empty_dirs(self.base_dir.clone(), true).await;
        Ok(())
    }
}
