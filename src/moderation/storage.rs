//! Case storage
//!
//! The durable copy of the case set. A store always reads and writes the whole
//! collection; there is no append path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::moderation::{Case, ModerationError, ModerationResult};

/// Durable storage for the full case collection
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Read every persisted case, in document order
    ///
    /// # Errors
    /// `StorageCorrupt` if the document is not an array of cases, `StorageIo` on read failure.
    async fn load(&self) -> ModerationResult<Vec<Case>>;

    /// Replace the persisted collection with `cases`
    ///
    /// # Errors
    /// `StorageIo` if the write did not complete. The previous document is left intact.
    async fn save_all(&self, cases: &[Case]) -> ModerationResult<()>;
}

/// Stores cases as a JSON array in a single file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn parse(&self, bytes: &[u8]) -> ModerationResult<Vec<Case>> {
        let document: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
            ModerationError::StorageCorrupt(format!("{} is not valid JSON: {e}", self.path.display()))
        })?;

        if !document.is_array() {
            return Err(ModerationError::StorageCorrupt(format!(
                "{} does not hold an array of cases",
                self.path.display()
            )));
        }

        serde_json::from_value(document).map_err(|e| {
            ModerationError::StorageCorrupt(format!(
                "{} holds a malformed case record: {e}",
                self.path.display()
            ))
        })
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Write to a sibling temp file, sync it, rename over the document, then
    /// sync the directory so the rename itself survives a crash
    async fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        let parent = self.parent_dir();
        tokio::fs::create_dir_all(parent).await?;

        let temp_path = self.temp_path();
        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &self.path).await?;
            sync_dir(parent).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                debug!(path = %temp_path.display(), error = %e, "Could not remove temp file");
            }
        }
        result
    }
}

/// Flush a directory entry table to disk
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

/// Directories cannot be opened for syncing off unix
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl CaseStore for JsonFileStore {
    async fn load(&self) -> ModerationResult<Vec<Case>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let cases = self.parse(&bytes)?;
                info!(path = %self.path.display(), count = cases.len(), "Loaded cases");
                Ok(cases)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No case document found, creating an empty one");
                self.save_all(&[]).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(ModerationError::storage_io(&self.path, e)),
        }
    }

    async fn save_all(&self, cases: &[Case]) -> ModerationResult<()> {
        let bytes = serde_json::to_vec(cases)
            .map_err(|e| ModerationError::storage_io(&self.path, std::io::Error::other(e)))?;

        self.write_atomic(&bytes).await.map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to write case document");
            ModerationError::storage_io(&self.path, e)
        })
    }
}

/// In-memory store, for tests and for running without a disk
#[derive(Debug, Default)]
pub struct MemoryStore {
    cases: Mutex<Vec<Case>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cases(cases: Vec<Case>) -> Self {
        Self {
            cases: Mutex::new(cases),
            ..Self::default()
        }
    }

    /// Make every subsequent `save_all` fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// The collection as last persisted
    #[must_use]
    pub fn saved(&self) -> Vec<Case> {
        self.cases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn load(&self) -> ModerationResult<Vec<Case>> {
        Ok(self.saved())
    }

    async fn save_all(&self, cases: &[Case]) -> ModerationResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ModerationError::storage_io(
                "memory",
                std::io::Error::other("write refused"),
            ));
        }
        *self.cases.lock().unwrap_or_else(PoisonError::into_inner) = cases.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
