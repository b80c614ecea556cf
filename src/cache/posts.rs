//! Post Cache Implementation
//!
//! Holds all posts newest-first behind an async mutex. Readers get a cheap
//! immutable snapshot and filter it outside the lock; every mutation builds
//! a new sorted list and swaps it in. Store reloads run outside that lock
//! and replay any writes made while they were in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::Post;
use crate::store::{PostStore, StoreError};

/// Default age after which a read triggers a full reload
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Immutable view of the cached posts, newest first
pub type Snapshot = Arc<Vec<Arc<Post>>>;

/// When the cache reloads from the backend on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Reload on read once the last full load is older than the window
    Windowed(Duration),
    /// Only reload on an explicit `refresh()`
    Explicit,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy::Windowed(DEFAULT_FRESHNESS_WINDOW)
    }
}

/// Cache counters for status reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub reads: u64,
    pub reloads: u64,
    pub failed_reloads: u64,
}

/// Upper bound on how often stale reads retry a failed reload
const RELOAD_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A write made while a reload was in flight
enum PendingWrite {
    Upsert(Arc<Post>),
    Remove(String),
}

impl PendingWrite {
    fn apply(&self, posts: &mut Vec<Arc<Post>>) {
        match self {
            PendingWrite::Upsert(post) => {
                posts.retain(|p| p.id != post.id);
                posts.push(Arc::clone(post));
                sort_newest_first(posts);
            }
            PendingWrite::Remove(id) => posts.retain(|p| &p.id != id),
        }
    }
}

struct CacheState {
    posts: Snapshot,
    /// Time of the last successful full load
    loaded_at: Instant,
    /// Stale reads wait until this instant after a failed reload
    retry_at: Option<Instant>,
    /// Writes since the running reload started; replayed over its result
    pending: Option<Vec<PendingWrite>>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            posts: Arc::new(Vec::new()),
            loaded_at: Instant::now(),
            retry_at: None,
            pending: None,
        }
    }

    fn needs_reload(&self, window: Duration) -> bool {
        self.loaded_at.elapsed() > window && self.retry_at.map_or(true, |at| Instant::now() >= at)
    }

    fn replace_all(&mut self, posts: Vec<Post>) {
        let mut posts: Vec<Arc<Post>> = posts.into_iter().map(Arc::new).collect();
        sort_newest_first(&mut posts);

        if let Some(pending) = self.pending.take() {
            for write in &pending {
                write.apply(&mut posts);
            }
        }

        self.posts = Arc::new(posts);
        self.loaded_at = Instant::now();
        self.retry_at = None;
    }

    /// Apply a write to a new list and remember it for a running reload
    fn write(&mut self, write: PendingWrite) {
        let mut posts = self.posts.as_ref().clone();
        write.apply(&mut posts);
        self.posts = Arc::new(posts);

        if let Some(pending) = self.pending.as_mut() {
            pending.push(write);
        }
    }
}

/// Descending publish date; `sort_by` is stable so ties keep their order
fn sort_newest_first(posts: &mut [Arc<Post>]) {
    posts.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));
}

/// Sorted in-memory mirror of the post store
///
/// The state lock is only held for short, synchronous updates. Reloads run
/// outside it, one at a time, behind `reload`.
pub struct PostCache {
    store: Arc<dyn PostStore>,
    policy: RefreshPolicy,
    state: Mutex<CacheState>,
    reload: Mutex<()>,
    reads: AtomicU64,
    reloads: AtomicU64,
    failed_reloads: AtomicU64,
}

impl PostCache {
    /// Populate the cache from the store
    ///
    /// Fails if the initial load fails; a cache is never served half-built.
    pub async fn load(store: Arc<dyn PostStore>, policy: RefreshPolicy) -> Result<Self, StoreError> {
        let posts = store.load_all().await?;
        let count = posts.len();

        let mut state = CacheState::new();
        state.replace_all(posts);

        info!(
            backend = store.name(),
            posts = count,
            policy = ?policy,
            "Post cache loaded"
        );

        Ok(Self {
            store,
            policy,
            state: Mutex::new(state),
            reload: Mutex::new(()),
            reads: AtomicU64::new(0),
            reloads: AtomicU64::new(1),
            failed_reloads: AtomicU64::new(0),
        })
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    async fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.state.lock().await.posts)
    }

    /// Current posts, newest first
    ///
    /// Under the windowed policy a stale cache is reloaded first. Only one
    /// reader reloads; readers arriving meanwhile get the current posts. If
    /// the reload fails the previous posts are returned and a later read
    /// retries once the retry delay has passed.
    pub async fn posts(&self) -> Snapshot {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let RefreshPolicy::Windowed(window) = self.policy else {
            return self.snapshot().await;
        };

        {
            let state = self.state.lock().await;
            if !state.needs_reload(window) {
                return Arc::clone(&state.posts);
            }
        }

        let Ok(_reloading) = self.reload.try_lock() else {
            debug!("Reload already running, serving current posts");
            return self.snapshot().await;
        };

        // Another reader may have finished a reload before we got the guard
        {
            let state = self.state.lock().await;
            if !state.needs_reload(window) {
                return Arc::clone(&state.posts);
            }
        }

        debug!("Post cache stale, reloading");
        match self.reload_from_store().await {
            Ok(count) => debug!(posts = count, "Post cache reloaded"),
            Err(e) => warn!(error = %e, "Post cache reload failed, serving stale posts"),
        }

        self.snapshot().await
    }

    /// Load everything from the store without holding the state lock
    ///
    /// Callers hold the `reload` guard.
    async fn reload_from_store(&self) -> Result<usize, StoreError> {
        self.state.lock().await.pending = Some(Vec::new());

        let result = self.store.load_all().await;

        let mut state = self.state.lock().await;
        match result {
            Ok(posts) => {
                state.replace_all(posts);
                self.reloads.fetch_add(1, Ordering::Relaxed);
                Ok(state.posts.len())
            }
            Err(e) => {
                state.pending = None;
                state.retry_at = Some(Instant::now() + self.retry_delay());
                self.failed_reloads.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        match self.policy {
            RefreshPolicy::Windowed(window) => window.min(RELOAD_RETRY_DELAY),
            RefreshPolicy::Explicit => Duration::ZERO,
        }
    }

    /// Insert a post, replacing any entry with the same id
    pub async fn add(&self, post: Post) -> Arc<Post> {
        let post = Arc::new(post);
        let mut state = self.state.lock().await;
        state.write(PendingWrite::Upsert(Arc::clone(&post)));

        debug!(id = %post.id, entries = state.posts.len(), "Cached post");
        post
    }

    /// Drop the entry with the post's id; absent ids are ignored
    pub async fn remove(&self, post: &Post) -> bool {
        let mut state = self.state.lock().await;
        let present = state.posts.iter().any(|p| p.id == post.id);

        // Recorded even when absent so a running reload cannot bring it back
        if present || state.pending.is_some() {
            state.write(PendingWrite::Remove(post.id.clone()));
        }

        if present {
            debug!(id = %post.id, entries = state.posts.len(), "Removed cached post");
        }
        present
    }

    /// Re-establish newest-first order
    pub async fn sort(&self) {
        let mut state = self.state.lock().await;
        let mut posts = state.posts.as_ref().clone();
        sort_newest_first(&mut posts);
        state.posts = Arc::new(posts);
    }

    /// Discard everything and reload from the store
    ///
    /// Waits for a reload already in progress, then loads again. On failure
    /// the current posts and freshness time stay as they were.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let _reloading = self.reload.lock().await;

        match self.reload_from_store().await {
            Ok(count) => {
                info!(posts = count, "Post cache refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Post cache refresh failed");
                Err(e)
            }
        }
    }

    /// Number of cached posts, without triggering a reload
    pub async fn len(&self) -> usize {
        self.state.lock().await.posts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len().await,
            reads: self.reads.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            failed_reloads: self.failed_reloads.load(Ordering::Relaxed),
        }
    }

    /// Log current cache metrics
    pub async fn log_metrics(&self) {
        let stats = self.stats().await;
        debug!(
            entries = stats.entries,
            reads = stats.reads,
            reloads = stats.reloads,
            failed_reloads = stats.failed_reloads,
            "Post cache metrics"
        );
    }
}
