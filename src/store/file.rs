//! JSON File Store
//!
//! Keeps one `{id}.json` file per post in a local directory.
//! Writes go through a temp file in the same directory and are renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{PostStore, StoreError};
use crate::models::Post;

/// Subdirectory of the data dir holding post files
pub const POSTS_DIR: &str = "Posts";

/// Local disk store for post records
pub struct JsonFileStore {
    /// Directory holding `{id}.json` files
    folder: PathBuf,
}

impl JsonFileStore {
    /// Open the store under `data_dir/Posts`, creating it if needed
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        Self::with_folder(data_dir.join(POSTS_DIR))
    }

    /// Open a store rooted directly at `folder`
    pub fn with_folder(folder: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&folder)?;

        let store = Self { folder };

        // Interrupted writes leave temp files behind
        store.cleanup();

        info!(folder = %store.folder.display(), "JSON file store opened");
        Ok(store)
    }

    /// Directory holding the post files
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the file backing `id`
    ///
    /// Ids become file names, so anything that could escape the folder or is
    /// invalid on common file systems is refused.
    fn file_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let usable = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.chars().any(|c| c.is_control() || INVALID_NAME_CHARS.contains(&c));

        if !usable {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.folder.join(format!("{id}.json")))
    }

    /// Remove temp files left by interrupted writes
    pub fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(&self.folder) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

/// Characters rejected in file names on Windows or Unix
pub(crate) const INVALID_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn read_post(path: &Path) -> Result<Post, StoreError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

fn write_atomically(folder: &Path, target: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(folder)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl PostStore for JsonFileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load_all(&self) -> Result<Vec<Post>, StoreError> {
        let mut files = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.folder).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }

        // Records are independent, read them in parallel
        let mut tasks = JoinSet::new();
        for path in files {
            tasks.spawn_blocking(move || read_post(&path));
        }

        let mut posts = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined? {
                Ok(post) => posts.push(post),
                Err(e) => {
                    warn!(error = %e, "Failed to load post file");
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        debug!(count = posts.len(), "Loaded posts from disk");
        Ok(posts)
    }

    async fn upsert(&self, post: &Post) -> Result<(), StoreError> {
        let target = self.file_path(&post.id)?;
        let data = serde_json::to_vec_pretty(post)?;
        let folder = self.folder.clone();

        let size = data.len();
        let written = target.clone();
        tokio::task::spawn_blocking(move || write_atomically(&folder, &target, &data)).await??;

        debug!(id = %post.id, path = %written.display(), size = size, "Stored post file");
        Ok(())
    }

    async fn delete(&self, post: &Post) -> Result<(), StoreError> {
        let target = self.file_path(&post.id)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                debug!(id = %post.id, "Deleted post file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(id = %post.id, "Post file already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample(id: &str) -> Post {
        let mut post = Post::new(format!("Post {id}"));
        post.id = id.to_string();
        post.pub_date = datetime!(2023-01-01 0:00 UTC);
        post.last_modified = datetime!(2023-01-02 0:00 UTC);
        post.categories = vec!["Tech".to_string()];
        post
    }

    #[tokio::test]
    async fn test_upsert_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        store.upsert(&sample("a")).await.unwrap();
        store.upsert(&sample("b")).await.unwrap();

        let mut updated = sample("a");
        updated.title = "Renamed".to_string();
        store.upsert(&updated).await.unwrap();

        let mut posts = store.load_all().await.unwrap();
        posts.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].title, "Renamed");
        assert_eq!(posts[1], sample("b"));
        assert!(dir.path().join("Posts").join("a.json").exists());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let post = sample("gone");

        store.upsert(&post).await.unwrap();
        store.delete(&post).await.unwrap();
        store.delete(&post).await.unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_fails_whole_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.upsert(&sample("good")).await.unwrap();
        fs::write(store.folder().join("bad.json"), b"{not json").unwrap();

        let err = store.load_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_ignores_non_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.upsert(&sample("a")).await.unwrap();
        fs::create_dir_all(store.folder().join("files")).unwrap();
        fs::write(store.folder().join("notes.txt"), b"hello").unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        for id in ["", "..", "../escape", "a/b", "c:d"] {
            let err = store.upsert(&sample(id)).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidId(_)), "id {id:?}");
        }
    }

    #[test]
    fn test_open_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join(POSTS_DIR);
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("leftover.tmp"), b"partial").unwrap();
        fs::write(folder.join("keep.json"), b"{}").unwrap();

        JsonFileStore::open(dir.path()).unwrap();

        assert!(!folder.join("leftover.tmp").exists());
        assert!(folder.join("keep.json").exists());
    }
}
