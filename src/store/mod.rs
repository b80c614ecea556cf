//! Durable post storage
//!
//! Two backends implement [`PostStore`]: JSON files on local disk and rows in
//! a remote table service. The cache and the service only see the trait.

pub mod file;
pub mod table;

use async_trait::async_trait;

use crate::models::Post;

pub use file::JsonFileStore;
pub use table::{TableError, TableStore};

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed post record {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode post: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Post id is not usable as a storage key: {0:?}")]
    InvalidId(String),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Background load task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Read/write contract shared by every backend
///
/// `load_all` returns every record or fails; there is no partial result.
/// `delete` of a record that does not exist succeeds.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Short backend name for logs and status reports
    fn name(&self) -> &'static str;

    /// Connection health for status reports
    fn health(&self) -> &'static str {
        "healthy"
    }

    /// Most recent backend errors, newest last
    fn recent_errors(&self) -> Vec<String> {
        Vec::new()
    }

    async fn load_all(&self) -> Result<Vec<Post>, StoreError>;

    /// Create or update the record keyed by `post.id`
    async fn upsert(&self, post: &Post) -> Result<(), StoreError>;

    async fn delete(&self, post: &Post) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory store with switchable failures
    #[derive(Default)]
    pub struct MemoryStore {
        records: Mutex<BTreeMap<String, Post>>,
        errors: Mutex<Vec<String>>,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
        pub loads: AtomicU64,
        /// Milliseconds each load waits before answering
        pub load_delay_ms: AtomicU64,
    }

    impl MemoryStore {
        pub fn with_posts(posts: Vec<Post>) -> Self {
            let store = Self::default();
            {
                let mut records = store.records.lock().unwrap();
                for post in posts {
                    records.insert(post.id.clone(), post);
                }
            }
            store
        }

        /// Mutate storage without going through the service
        pub fn put_out_of_band(&self, post: Post) {
            self.records.lock().unwrap().insert(post.id.clone(), post);
        }

        pub fn get(&self, id: &str) -> Option<Post> {
            self.records.lock().unwrap().get(id).cloned()
        }

        pub fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        fn unavailable(&self, operation: &str) -> StoreError {
            self.errors
                .lock()
                .unwrap()
                .push(format!("{operation}: store offline"));
            StoreError::Table(TableError::Network("store offline".to_string()))
        }
    }

    #[async_trait]
    impl PostStore for MemoryStore {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn recent_errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }

        async fn load_all(&self) -> Result<Vec<Post>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let delay = self.load_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(self.unavailable("load"));
            }
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn upsert(&self, post: &Post) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(self.unavailable("upsert"));
            }
            self.records
                .lock()
                .unwrap()
                .insert(post.id.clone(), post.clone());
            Ok(())
        }

        async fn delete(&self, post: &Post) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(self.unavailable("delete"));
            }
            self.records.lock().unwrap().remove(&post.id);
            Ok(())
        }
    }
}
