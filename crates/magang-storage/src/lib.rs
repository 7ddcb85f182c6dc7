//! Local persistence for region snapshots, saved listings and view sessions.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magang_core::{Listing, RegionKey, Snapshot, ViewSession};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "magang-storage";

/// Maximum number of listings held in the saved-jobs slot.
pub const MAX_SAVED_JOBS: usize = 10;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("invalid region code {0:?}")]
    InvalidRegion(String),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Key-partitioned store holding one listing snapshot per region.
///
/// No eviction and no freshness policy: a snapshot lives until it is
/// overwritten by `put` or dropped by `clear`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persisted snapshot for `region`, or `None` when nothing was stored.
    async fn get(&self, region: &RegionKey) -> Result<Option<Snapshot>, StorageError>;

    /// Create or wholly replace the snapshot for `region`, stamped with the current time.
    async fn put(
        &self,
        region: &RegionKey,
        listings: &[Listing],
        total_pages: u32,
    ) -> Result<DateTime<Utc>, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

/// Current time truncated to the millisecond precision snapshots are stored with.
fn capture_time() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_region(region: &RegionKey) -> Result<(), StorageError> {
    let code = region.as_str();
    let safe = !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(StorageError::InvalidRegion(code.to_string()))
    }
}

/// Write bytes to `path` through a temp file and an atomic rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StorageError::io(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path, err));
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::io(path, err)),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    region: RegionKey,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    captured_at: DateTime<Utc>,
    total_pages: u32,
    content_hash: String,
    listings: Vec<Listing>,
}

/// JSON-file snapshot store: `<root>/snapshots/<region>.json`, one file per region.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_path(&self, region: &RegionKey) -> Result<PathBuf, StorageError> {
        validate_region(region)?;
        Ok(self.snapshots_dir().join(format!("{}.json", region.as_str())))
    }
}

fn listings_hash(listings: &[Listing]) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_vec(listings)?))
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, region: &RegionKey) -> Result<Option<Snapshot>, StorageError> {
        let path = self.snapshot_path(region)?;
        let Some(bytes) = read_optional(&path).await? else {
            debug!(region = %region, "no snapshot on disk");
            return Ok(None);
        };

        let file: SnapshotFile =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if &file.region != region {
            return Err(StorageError::Corrupt {
                path,
                reason: format!("snapshot belongs to region {}", file.region),
            });
        }
        let actual = listings_hash(&file.listings).map_err(|e| StorageError::Encode {
            what: format!("listings for region {region}"),
            source: e,
        })?;
        if actual != file.content_hash {
            return Err(StorageError::Corrupt {
                path,
                reason: format!("content hash mismatch ({} != {})", actual, file.content_hash),
            });
        }

        Ok(Some(Snapshot {
            region: file.region,
            listings: file.listings,
            captured_at: file.captured_at,
            total_pages: file.total_pages,
        }))
    }

    async fn put(
        &self,
        region: &RegionKey,
        listings: &[Listing],
        total_pages: u32,
    ) -> Result<DateTime<Utc>, StorageError> {
        let path = self.snapshot_path(region)?;
        let captured_at = capture_time();
        let encode_err = |source| StorageError::Encode {
            what: format!("snapshot for region {region}"),
            source,
        };

        let content_hash = listings_hash(listings).map_err(encode_err)?;
        let file = SnapshotFile {
            region: region.clone(),
            captured_at,
            total_pages,
            content_hash,
            listings: listings.to_vec(),
        };
        let bytes = serde_json::to_vec(&file).map_err(encode_err)?;
        write_atomic(&path, &bytes).await?;
        debug!(region = %region, listings = listings.len(), total_pages, "snapshot written");
        Ok(captured_at)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let dir = self.snapshots_dir();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(&dir, err)),
        }
    }
}

/// In-process snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<RegionKey, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.lock().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, region: &RegionKey) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshots.lock().await.get(region).cloned())
    }

    async fn put(
        &self,
        region: &RegionKey,
        listings: &[Listing],
        total_pages: u32,
    ) -> Result<DateTime<Utc>, StorageError> {
        let captured_at = capture_time();
        self.snapshots.lock().await.insert(
            region.clone(),
            Snapshot {
                region: region.clone(),
                listings: listings.to_vec(),
                captured_at,
                total_pages,
            },
        );
        Ok(captured_at)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.snapshots.lock().await.clear();
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SavedJobsError {
    #[error("saved jobs slot is full ({MAX_SAVED_JOBS} listings)")]
    Full,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Single-slot list of favorited listings, capped at [`MAX_SAVED_JOBS`].
#[derive(Debug, Clone)]
pub struct SavedJobsStore {
    path: PathBuf,
}

impl SavedJobsStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("saved_jobs.json"),
        }
    }

    pub async fn list(&self) -> Result<Vec<Listing>, StorageError> {
        let Some(bytes) = read_optional(&self.path).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Save a listing. Returns false when it was already saved.
    pub async fn save(&self, listing: &Listing) -> Result<bool, SavedJobsError> {
        let mut saved = self.list().await?;
        if saved.iter().any(|l| l.id == listing.id) {
            return Ok(false);
        }
        if saved.len() >= MAX_SAVED_JOBS {
            return Err(SavedJobsError::Full);
        }
        saved.push(listing.clone());
        self.write(&saved).await?;
        Ok(true)
    }

    /// Remove a listing by id. Returns false when it was not saved.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let mut saved = self.list().await?;
        let before = saved.len();
        saved.retain(|l| l.id != id);
        if saved.len() == before {
            return Ok(false);
        }
        self.write(&saved).await?;
        Ok(true)
    }

    async fn write(&self, saved: &[Listing]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(saved).map_err(|e| StorageError::Encode {
            what: "saved jobs".to_string(),
            source: e,
        })?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Explicit load/save boundary for [`ViewSession`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("session.json"),
        }
    }

    /// Stored session, or the default one when absent or unreadable.
    pub async fn load(&self) -> ViewSession {
        match read_optional(&self.path).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %self.path.display(), error = %err, "discarding unreadable session");
                ViewSession::default()
            }),
            Ok(None) => ViewSession::default(),
            Err(err) => {
                warn!(error = %err, "session unavailable; using defaults");
                ViewSession::default()
            }
        }
    }

    pub async fn save(&self, session: &ViewSession) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(session).map_err(|e| StorageError::Encode {
            what: "view session".to_string(),
            source: e,
        })?;
        write_atomic(&self.path, &bytes).await
    }
}
