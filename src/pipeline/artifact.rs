//! Uploaded artifact staging and lifecycle.
//!
//! An upload is written to a named temp file owned by exactly one pipeline
//! run. `release()` deletes it at the terminal transition; `Drop` on the
//! inner `NamedTempFile` covers panics and early returns.

use std::fs;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::PipelineError;

pub struct UploadedArtifact {
    file: NamedTempFile,
    content_type: Option<String>,
    size: usize,
    sha256: String,
}

impl UploadedArtifact {
    /// Stage raw upload bytes under `dir`. Empty input is an invalid request.
    pub fn stage(
        bytes: &[u8],
        content_type: Option<&str>,
        dir: &Path,
    ) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::InvalidRequest("Uploaded file is empty".into()));
        }

        fs::create_dir_all(dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(extension_for(content_type))
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;

        Ok(Self {
            file,
            content_type: content_type.map(str::to_string),
            size: bytes.len(),
            sha256: format!("{:x}", Sha256::digest(bytes)),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Full hex SHA-256 of the uploaded bytes.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Hash prefix used as a log correlation id.
    pub fn short_hash(&self) -> &str {
        &self.sha256[..12]
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(fs::read(self.file.path())?)
    }

    /// Delete the backing file now, surfacing any I/O error.
    pub fn release(self) -> Result<(), PipelineError> {
        self.file.close()?;
        Ok(())
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.to_ascii_lowercase()) {
        Some(ct) if ct == "image/png" => ".png",
        Some(ct) if ct == "image/jpeg" || ct == "image/jpg" => ".jpg",
        Some(ct) if ct == "image/tiff" => ".tiff",
        _ => ".bin",
    }
}

/// Remove files left behind by a previous process (crash mid-run).
/// Returns the number of files removed.
pub fn cleanup_orphaned_files(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return 0, // Directory may not exist yet
    };

    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && fs::remove_file(&path).is_ok() {
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!(
            dir = %dir.display(),
            files_cleaned = count,
            "Cleaned orphaned files from previous session"
        );
    }
    count
}
