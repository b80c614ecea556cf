//! Media uploads stored next to the post files

use std::io;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::store::file::{INVALID_NAME_CHARS, POSTS_DIR};

/// Subdirectory of the post folder holding uploads
pub const FILES_DIR: &str = "files";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload has no content")]
    EmptyPayload,

    #[error("Upload name is empty after removing invalid characters: {0:?}")]
    InvalidName(String),

    #[error("Failed to write upload: {0}")]
    Io(#[from] io::Error),
}

/// Writes uploaded bytes under `{data_dir}/Posts/files`
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(POSTS_DIR).join(FILES_DIR),
        }
    }

    /// Store `bytes` as `{name}_{suffix}{ext}` and return its public path
    ///
    /// Without a suffix the current UNIX time in nanoseconds is used. Existing
    /// files are never overwritten.
    pub async fn save(
        &self,
        bytes: &[u8],
        file_name: &str,
        suffix: Option<&str>,
    ) -> Result<String, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::EmptyPayload);
        }

        let path = Path::new(file_name);
        let stem = path
            .file_stem()
            .map(|s| clean_file_name(&s.to_string_lossy()))
            .unwrap_or_default();
        if stem.is_empty() {
            return Err(UploadError::InvalidName(file_name.to_string()));
        }
        let ext = path
            .extension()
            .map(|e| format!(".{}", clean_file_name(&e.to_string_lossy())))
            .filter(|e| e.len() > 1)
            .unwrap_or_default();

        let suffix = match suffix.map(clean_file_name).filter(|s| !s.is_empty()) {
            Some(suffix) => suffix,
            None => OffsetDateTime::now_utc().unix_timestamp_nanos().to_string(),
        };

        let stored_name = format!("{stem}_{suffix}{ext}");
        tokio::fs::create_dir_all(&self.root).await?;

        let target = self.root.join(&stored_name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        info!(path = %target.display(), size = bytes.len(), "Stored upload");
        Ok(format!("/{POSTS_DIR}/{FILES_DIR}/{stored_name}"))
    }
}

/// Strip characters that are not allowed in file names
pub fn clean_file_name(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() && !INVALID_NAME_CHARS.contains(c))
        .collect()
}
