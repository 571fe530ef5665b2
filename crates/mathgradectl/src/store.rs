//! Result store collaborator
//!
//! Create/read/update/delete of finished grading results keyed by run id.
//! The orchestrator only needs `create`; the rest serves the CLI and tests.

use async_trait::async_trait;
use mathgrade_shared::GradingResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("result {0} not found")]
    NotFound(Uuid),

    #[error("result {0} already exists")]
    AlreadyExists(Uuid),

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode result: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create(&self, result: &GradingResult) -> Result<Uuid, StoreError>;

    async fn read(&self, id: Uuid) -> Result<GradingResult, StoreError>;

    async fn update(&self, result: &GradingResult) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// In-memory store. Can be told to fail every write.
#[derive(Default)]
pub struct InMemoryStore {
    results: RwLock<HashMap<Uuid, GradingResult>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose writes all fail with `Unavailable`
    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_writes.store(true, Ordering::SeqCst);
        store
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn create(&self, result: &GradingResult) -> Result<Uuid, StoreError> {
        self.check_writable()?;
        let mut results = self.results.write().await;
        if results.contains_key(&result.run_id) {
            return Err(StoreError::AlreadyExists(result.run_id));
        }
        results.insert(result.run_id, result.clone());
        Ok(result.run_id)
    }

    async fn read(&self, id: Uuid) -> Result<GradingResult, StoreError> {
        self.results
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, result: &GradingResult) -> Result<(), StoreError> {
        self.check_writable()?;
        match self.results.write().await.get_mut(&result.run_id) {
            Some(existing) => {
                *existing = result.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(result.run_id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.check_writable()?;
        self.results
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}

/// One pretty-printed JSON file per result: `<dir>/<run_id>.json`
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, result: &GradingResult) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(result)?;
        let path = self.path_for(result.run_id);
        // temp file + rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ResultStore for JsonFileStore {
    async fn create(&self, result: &GradingResult) -> Result<Uuid, StoreError> {
        if tokio::fs::try_exists(self.path_for(result.run_id)).await? {
            return Err(StoreError::AlreadyExists(result.run_id));
        }
        self.write(result).await?;
        Ok(result.run_id)
    }

    async fn read(&self, id: Uuid) -> Result<GradingResult, StoreError> {
        let contents = match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    async fn update(&self, result: &GradingResult) -> Result<(), StoreError> {
        if !tokio::fs::try_exists(self.path_for(result.run_id)).await? {
            return Err(StoreError::NotFound(result.run_id));
        }
        self.write(result).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}
