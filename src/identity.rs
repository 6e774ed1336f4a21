//! # Identity Resolver
//!
//! Maps document paths to stable [`LogicalFileId`]s and back, so work that references a
//! document keeps pointing at the same file across renames and moves.
//!
//! [`FileIdResolver`] wraps an optional [`IdentityStore`]. Without a store every operation
//! degrades to path pass-through: the "id" of a document is its api path, `path_for_id` is the
//! identity function and `save`/`move_path` do nothing. Callers never need to know which mode
//! they are in.
//!
//! ## Resolving an id
//!
//! A recorded path is not proof that the file is still there. [`FileIdResolver::path_for_id`]
//! stats the recorded path and only trusts it when the inode still matches the recorded inode.
//! Otherwise it asks the store for an authoritative re-sync, and if that fails too it hands
//! back the id itself as a degraded path.

use crate::{
    error::ExecutorError,
    paths::{api_to_contained_os_path, api_to_os_path, clean_path, os_to_api_path, trim_api_path},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tokio::sync::{Mutex, MutexGuard};

/// Stable identifier for a document, independent of where the document currently lives.
///
/// When identity tracking is disabled this holds the raw api path of the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalFileId(String);

impl LogicalFileId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        LogicalFileId(id.into())
    }

    pub fn generate() -> Self {
        LogicalFileId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LogicalFileId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: LogicalFileId,
    pub path: PathBuf,
    /// Modification time in nanoseconds since the unix epoch.
    pub mtime: i64,
    pub ino: u64,
}

/// The parts of a `stat` call the identity store cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: i64,
    pub ino: u64,
    pub is_dir: bool,
}

impl FileStat {
    /// `None` if the path does not exist or cannot be inspected.
    pub fn of<P: AsRef<Path>>(path: P) -> Option<FileStat> {
        let metadata = fs::metadata(path.as_ref()).ok()?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|duration| duration.as_nanos() as i64)?;
        Some(FileStat {
            mtime,
            ino: inode(&metadata),
            is_dir: metadata.is_dir(),
        })
    }
}

#[cfg(unix)]
fn inode(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &fs::Metadata) -> u64 {
    0
}

/// Persistent path <-> id bookkeeping. All paths are absolute OS paths.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Return the id for `path`, creating a record if there is none. `None` if the path does not
    /// exist on disk.
    async fn index(&self, path: &Path) -> Result<Option<LogicalFileId>, ExecutorError>;

    async fn get_id(&self, path: &Path) -> Result<Option<LogicalFileId>, ExecutorError>;

    /// Authoritative lookup: re-syncs the record against the filesystem before answering.
    async fn get_path(&self, id: &LogicalFileId) -> Result<Option<PathBuf>, ExecutorError>;

    /// The stored record, as-is, without consulting the filesystem.
    async fn record(&self, id: &LogicalFileId) -> Result<Option<IdentityRecord>, ExecutorError>;

    /// Last recorded modification time for `path`. Works after the file is gone.
    async fn recorded_mtime(&self, path: &Path) -> Result<Option<i64>, ExecutorError>;

    /// Refresh mtime/inode of the record at `path`.
    async fn save(&self, path: &Path) -> Result<(), ExecutorError>;

    /// Repoint the record at `old_path` to `new_path`, keeping its id.
    async fn move_path(&self, old_path: &Path, new_path: &Path) -> Result<(), ExecutorError>;
}

/// Proof that the caller holds the document lock.
pub type DocumentLockGuard<'a> = MutexGuard<'a, ()>;

#[derive(Clone)]
pub struct FileIdResolver {
    root_dir: PathBuf,
    store: Option<Arc<dyn IdentityStore>>,
    document_lock: Arc<Mutex<()>>,
}

impl FileIdResolver {
    pub fn new(root_dir: PathBuf, store: Option<Arc<dyn IdentityStore>>) -> Self {
        FileIdResolver {
            root_dir,
            store,
            document_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A resolver without identity store: ids are paths.
    pub fn disabled(root_dir: PathBuf) -> Self {
        Self::new(root_dir, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The process-wide lock serializing document read-modify-write with identity lookups.
    pub fn document_lock(&self) -> &Arc<Mutex<()>> {
        &self.document_lock
    }

    /// Canonical key for a request path. Empty input and paths leaving the root have no key.
    ///
    /// With identity tracking the key is the absolute path below the root; without it the key is
    /// the cleaned api path minus leading separators.
    pub fn normalize(&self, path: &str) -> Option<PathBuf> {
        let trimmed = trim_api_path(path)?;
        let os_path = api_to_contained_os_path(&self.root_dir, trimmed)?;
        if self.is_enabled() {
            Some(os_path)
        } else {
            let cleaned = clean_path(trimmed);
            (cleaned.as_os_str() != "").then_some(cleaned)
        }
    }

    /// Turn an absolute path back into the api path clients use.
    pub fn to_api_path(&self, os_path: &Path) -> String {
        os_to_api_path(&self.root_dir, os_path)
    }

    /// Absolute location of an api path below the root.
    pub fn to_os_path(&self, api_path: &str) -> PathBuf {
        api_to_os_path(&self.root_dir, api_path)
    }

    /// Look up the id for `path`, indexing it if it is not tracked yet.
    ///
    /// Never fails: if the store is unavailable or the file does not exist the normalized path
    /// itself serves as the id.
    pub async fn index(&self, path: &str) -> Option<LogicalFileId> {
        let normalized = self.normalize(path)?;
        let Some(store) = &self.store else {
            return Some(LogicalFileId::new(crate::paths::os_path_to_string(
                &normalized,
            )));
        };
        let fallback = || LogicalFileId::new(self.to_api_path(&normalized));
        let looked_up = match store.get_id(&normalized).await {
            Ok(Some(id)) => Ok(Some(id)),
            Ok(None) => store.index(&normalized).await,
            Err(e) => Err(e),
        };
        match looked_up {
            Ok(Some(id)) => {
                tracing::debug!("tracking file {:?} with id {}", normalized, id);
                Some(id)
            }
            Ok(None) => {
                tracing::debug!("{:?} does not exist, using its path as id", normalized);
                Some(fallback())
            }
            Err(e) => {
                tracing::warn!(
                    "Identity store unavailable while indexing {:?}, using path as id. Error: {}",
                    normalized,
                    e
                );
                Some(fallback())
            }
        }
    }

    /// Best-effort current api path for `id`. Takes the document lock.
    pub async fn path_for_id(&self, id: &LogicalFileId) -> String {
        if !self.is_enabled() {
            return id.to_string();
        }
        let guard = self.document_lock.lock().await;
        self.path_for_id_locked(id, &guard).await
    }

    /// [`Self::path_for_id`] for callers that already hold the document lock.
    pub async fn path_for_id_locked(
        &self,
        id: &LogicalFileId,
        _guard: &DocumentLockGuard<'_>,
    ) -> String {
        let Some(store) = &self.store else {
            return id.to_string();
        };

        match store.record(id).await {
            Ok(Some(record)) => {
                // Same inode at the recorded path: same file.
                if FileStat::of(&record.path).is_some_and(|stat| stat.ino == record.ino) {
                    return self.to_api_path(&record.path);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Identity store record lookup failed for {}: {}", id, e);
            }
        }

        let path = match store.get_path(id).await {
            Ok(Some(path)) => self.to_api_path(&path),
            Ok(None) => id.to_string(),
            Err(e) => {
                tracing::warn!(
                    "Identity store re-sync failed for {}, falling back to the id. Error: {}",
                    id,
                    e
                );
                id.to_string()
            }
        };
        tracing::debug!("convert id {} to file {}", id, path);
        path
    }

    /// Refresh bookkeeping for an existing record. Relative paths are taken below the root.
    pub async fn save(&self, path: &Path) -> Result<(), ExecutorError> {
        match &self.store {
            Some(store) => store.save(&self.absolute(path)).await,
            None => Ok(()),
        }
    }

    pub async fn move_path(&self, old_path: &Path, new_path: &Path) -> Result<(), ExecutorError> {
        match &self.store {
            Some(store) => {
                store
                    .move_path(&self.absolute(old_path), &self.absolute(new_path))
                    .await
            }
            None => Ok(()),
        }
    }

    /// Modification time for change correlation: from disk if the file exists, otherwise from
    /// the identity store.
    pub async fn last_known_mtime(&self, path: &Path) -> Option<i64> {
        let path = self.absolute(path);
        if let Some(stat) = FileStat::of(&path) {
            return Some(stat.mtime);
        }
        let store = self.store.as_ref()?;
        match store.recorded_mtime(&path).await {
            Ok(mtime) => mtime,
            Err(e) => {
                tracing::warn!("Could not read recorded mtime for {:?}: {}", path, e);
                None
            }
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            clean_path(path)
        } else {
            clean_path(self.root_dir.join(path))
        }
    }
}
