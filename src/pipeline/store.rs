//! Rendered report store: one PDF per successful run, retrievable once.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use super::artifact::cleanup_orphaned_files;
use super::PipelineError;

const REPORT_EXTENSION: &str = "pdf";

/// Reports nobody downloads are dropped after this long.
pub const DEFAULT_REPORT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
    ttl: Duration,
}

impl ReportStore {
    /// Create the directory if needed and drop reports left by a previous process.
    pub fn open(dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir)?;
        cleanup_orphaned_files(dir);
        Ok(Self {
            dir: dir.to_path_buf(),
            ttl: DEFAULT_REPORT_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh id and the path the renderer should write to. Expired reports
    /// are swept first.
    pub fn allocate(&self) -> (Uuid, PathBuf) {
        self.sweep_expired();
        let id = Uuid::new_v4();
        (id, self.path_for(&id))
    }

    pub fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{REPORT_EXTENSION}"))
    }

    /// Read and delete a report. `Ok(None)` if it does not exist or was
    /// already taken.
    ///
    /// The file is renamed aside first, so of two concurrent callers only
    /// one gets the bytes.
    pub fn take(&self, id: &Uuid) -> Result<Option<Vec<u8>>, PipelineError> {
        let path = self.path_for(id);
        let claimed = self.dir.join(format!("{id}.{}.taken", Uuid::new_v4()));
        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let bytes = fs::read(&claimed);
        if let Err(e) = fs::remove_file(&claimed) {
            tracing::warn!(report_id = %id, error = %e, "Failed to delete downloaded report");
        }
        let bytes = bytes?;

        tracing::info!(report_id = %id, size_bytes = bytes.len(), "Report downloaded and removed");
        Ok(Some(bytes))
    }

    /// Delete reports older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot list reports");
                return 0;
            }
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(REPORT_EXTENSION) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            // Clock skew into the future reads as age zero.
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.ttl {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove expired report")
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, ttl_secs = self.ttl.as_secs(), "Expired reports removed");
        }
        removed
    }

    /// Remove a report without reading it (e.g. a partially written file).
    pub fn discard(&self, id: &Uuid) {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(report_id = %id, "Report discarded"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(report_id = %id, error = %e, "Failed to discard report"),
        }
    }
}
