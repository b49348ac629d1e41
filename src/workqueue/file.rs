// src/workqueue/file.rs

//! Registry backed by a JSON document on disk.
//!
//! ```json
//! { "units": [
//!     { "id": "core", "priority": 10, "dependencies": [], "status": "pending" },
//!     { "id": "cli", "dependencies": ["core"], "status": "pending" }
//! ] }
//! ```
//!
//! Every call re-reads the document, so other tools may edit it between
//! polls. Status updates rewrite it atomically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::fs::{FileSystem, RealFileSystem};
use crate::types::{UnitId, UnitStatus};

use super::{
    incomplete_among, ready_entries, RegistryEntry, RegistryError, RegistryFuture, UnitRef,
    WorkQueueClient,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub units: Vec<RegistryEntry>,
}

#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    /// Serializes read-modify-write cycles from this process.
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_fs(path, Arc::new(RealFileSystem))
    }

    pub fn with_fs(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            path: path.into(),
            fs,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RegistryDocument, RegistryError> {
        let fs = Arc::clone(&self.fs);
        let path = self.path.clone();

        let contents = tokio::task::spawn_blocking(move || fs.read_to_string(&path))
            .await
            .map_err(|e| RegistryError::Unavailable(format!("registry read task failed: {e}")))?
            .map_err(|e| RegistryError::Unavailable(format!("{e:#}")))?;

        serde_json::from_str(&contents)
            .map_err(|e| RegistryError::Malformed(format!("{}: {e}", self.path.display())))
    }

    async fn store(&self, doc: &RegistryDocument) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| RegistryError::Malformed(format!("serializing registry: {e}")))?;
        let fs = Arc::clone(&self.fs);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || fs.write(&path, &bytes))
            .await
            .map_err(|e| RegistryError::Unavailable(format!("registry write task failed: {e}")))?
            .map_err(|e| RegistryError::Unavailable(format!("{e:#}")))
    }
}

impl WorkQueueClient for FileRegistry {
    fn fetch_ready(&self) -> RegistryFuture<'_, Vec<UnitRef>> {
        Box::pin(async move {
            let doc = self.load().await?;
            let ready = ready_entries(&doc.units);
            debug!(ready = ready.len(), path = %self.path.display(), "fetched ready units");
            Ok(ready)
        })
    }

    fn report_status(
        &self,
        unit: UnitId,
        status: UnitStatus,
        detail: Option<String>,
    ) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut doc = self.load().await?;

            match doc.units.iter_mut().find(|e| e.unit.id == unit) {
                Some(entry) => {
                    entry.status = status;
                    entry.detail = detail;
                }
                None => {
                    return Err(RegistryError::Malformed(format!(
                        "unit '{unit}' is not listed in {}",
                        self.path.display()
                    )));
                }
            }

            self.store(&doc).await
        })
    }

    fn incomplete_dependencies(&self, deps: Vec<UnitId>) -> RegistryFuture<'_, Vec<UnitId>> {
        Box::pin(async move {
            let doc = self.load().await?;
            Ok(incomplete_among(&doc.units, &deps))
        })
    }
}
