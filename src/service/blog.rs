//! Blog Service
//!
//! Every read filters the cached posts by visibility at the time of the
//! request. Every write goes to the store first and reaches the cache only
//! after the store confirmed it.

use std::collections::BTreeMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::upload::{UploadError, UploadStore};
use crate::cache::PostCache;
use crate::config::BlogOptions;
use crate::models::{Comment, Post};
use crate::store::StoreError;

/// Source of "now" for visibility and timestamps
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Who is making a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    admin: bool,
}

impl Caller {
    pub const fn anonymous() -> Self {
        Self { admin: false }
    }

    pub const fn administrator() -> Self {
        Self { admin: true }
    }

    pub fn is_admin(self) -> bool {
        self.admin
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlogError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Administrator access required")]
    Forbidden,

    #[error("Post not found: {0}")]
    PostNotFound(String),

    #[error("Comment not found: {0}")]
    CommentNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Upload failed: {0}")]
    Upload(#[source] std::io::Error),
}

impl From<UploadError> for BlogError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Io(e) => BlogError::Upload(e),
            other => BlogError::Validation(other.to_string()),
        }
    }
}

/// Case-insensitive comparison without allocating
fn same_text(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

fn is_visible(post: &Post, caller: Caller, now: OffsetDateTime) -> bool {
    caller.is_admin() || (post.is_published && post.pub_date <= now)
}

/// Read and write operations over the cached posts
pub struct BlogService {
    cache: Arc<PostCache>,
    uploads: UploadStore,
    options: BlogOptions,
    clock: Clock,
}

impl BlogService {
    pub fn new(cache: Arc<PostCache>, uploads: UploadStore, options: BlogOptions) -> Self {
        Self {
            cache,
            uploads,
            options,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &BlogOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<PostCache> {
        &self.cache
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    async fn visible_posts(&self, caller: Caller) -> Vec<Arc<Post>> {
        let snapshot = self.cache.posts().await;
        let now = self.now();
        snapshot
            .iter()
            .filter(|p| is_visible(p, caller, now))
            .cloned()
            .collect()
    }

    /// All visible posts, newest first
    pub async fn posts(&self, caller: Caller) -> Vec<Arc<Post>> {
        self.visible_posts(caller).await
    }

    /// Visible posts after skipping `skip` and taking at most `count`
    pub async fn posts_page(&self, caller: Caller, count: usize, skip: usize) -> Vec<Arc<Post>> {
        self.visible_posts(caller)
            .await
            .into_iter()
            .skip(skip)
            .take(count)
            .collect()
    }

    /// Hidden posts look exactly like missing ones
    pub async fn post_by_id(&self, caller: Caller, id: &str) -> Option<Arc<Post>> {
        let snapshot = self.cache.posts().await;
        let post = snapshot.iter().find(|p| same_text(&p.id, id))?;
        is_visible(post, caller, self.now()).then(|| Arc::clone(post))
    }

    pub async fn post_by_slug(&self, caller: Caller, slug: &str) -> Option<Arc<Post>> {
        let snapshot = self.cache.posts().await;
        let post = snapshot.iter().find(|p| same_text(&p.slug, slug))?;
        is_visible(post, caller, self.now()).then(|| Arc::clone(post))
    }

    /// Visible posts grouped by publish year, each group newest first
    pub async fn posts_by_year(&self, caller: Caller) -> BTreeMap<i32, Vec<Arc<Post>>> {
        let mut years: BTreeMap<i32, Vec<Arc<Post>>> = BTreeMap::new();
        for post in self.visible_posts(caller).await {
            years.entry(post.pub_date.year()).or_default().push(post);
        }
        years
    }

    pub async fn posts_by_category(&self, caller: Caller, category: &str) -> Vec<Arc<Post>> {
        self.visible_posts(caller)
            .await
            .into_iter()
            .filter(|p| p.has_category(category))
            .collect()
    }

    /// Distinct lower-cased categories in first-seen order
    pub async fn categories(&self, caller: Caller) -> Vec<String> {
        let mut seen = Vec::new();
        for post in self.visible_posts(caller).await {
            for category in &post.categories {
                let category = category.to_lowercase();
                if !seen.contains(&category) {
                    seen.push(category);
                }
            }
        }
        seen
    }

    /// Persist a post and then update the cache with it
    pub async fn save_post(&self, caller: Caller, post: Post) -> Result<Arc<Post>, BlogError> {
        if !caller.is_admin() {
            return Err(BlogError::Forbidden);
        }
        self.validate(&post).await?;
        self.persist(post).await
    }

    async fn validate(&self, post: &Post) -> Result<(), BlogError> {
        if post.id.trim().is_empty() {
            return Err(BlogError::Validation("post id is required".to_string()));
        }
        if post.slug.trim().is_empty() {
            return Err(BlogError::Validation("post slug is required".to_string()));
        }

        if post.is_published {
            let snapshot = self.cache.posts().await;
            let taken = snapshot
                .iter()
                .any(|p| p.is_published && p.id != post.id && same_text(&p.slug, &post.slug));
            if taken {
                return Err(BlogError::Validation(format!(
                    "slug {:?} is already used by a published post",
                    post.slug
                )));
            }
        }
        Ok(())
    }

    async fn persist(&self, mut post: Post) -> Result<Arc<Post>, BlogError> {
        post.last_modified = self.now();

        if let Err(e) = self.cache.store().upsert(&post).await {
            warn!(id = %post.id, error = %e, "Failed to save post");
            return Err(e.into());
        }

        info!(id = %post.id, slug = %post.slug, "Saved post");
        Ok(self.cache.add(post).await)
    }

    /// Delete from the store, then from the cache
    pub async fn delete_post(&self, caller: Caller, post: &Post) -> Result<(), BlogError> {
        if !caller.is_admin() {
            return Err(BlogError::Forbidden);
        }

        if let Err(e) = self.cache.store().delete(post).await {
            warn!(id = %post.id, error = %e, "Failed to delete post");
            return Err(e.into());
        }

        self.cache.remove(post).await;
        info!(id = %post.id, "Deleted post");
        Ok(())
    }

    /// Reload the cache from the store
    ///
    /// Callers without administrator rights are ignored without an error.
    pub async fn force_refresh(&self, caller: Caller) -> Result<(), BlogError> {
        if !caller.is_admin() {
            debug!("Ignoring refresh from non-administrator");
            return Ok(());
        }
        self.cache.refresh().await?;
        Ok(())
    }

    /// Append a comment to a visible post that still accepts comments
    pub async fn add_comment(
        &self,
        caller: Caller,
        post_id: &str,
        author: &str,
        email: &str,
        content: &str,
    ) -> Result<Comment, BlogError> {
        if author.trim().is_empty() || content.trim().is_empty() {
            return Err(BlogError::Validation(
                "comment author and content are required".to_string(),
            ));
        }

        let post = self
            .post_by_id(caller, post_id)
            .await
            .ok_or_else(|| BlogError::PostNotFound(post_id.to_string()))?;

        let now = self.now();
        if !post.are_comments_open(self.options.comments_close_after_days, now) {
            return Err(BlogError::Validation("comments are closed".to_string()));
        }

        let comment = Comment::new(author.trim(), email.trim(), content, caller.is_admin(), now);
        let mut updated = Post::clone(&post);
        updated.comments.push(comment.clone());
        self.persist(updated).await?;

        debug!(post = %post.id, comment = %comment.id, "Added comment");
        Ok(comment)
    }

    pub async fn delete_comment(
        &self,
        caller: Caller,
        post_id: &str,
        comment_id: &str,
    ) -> Result<(), BlogError> {
        if !caller.is_admin() {
            return Err(BlogError::Forbidden);
        }

        let post = self
            .post_by_id(caller, post_id)
            .await
            .ok_or_else(|| BlogError::PostNotFound(post_id.to_string()))?;

        let mut updated = Post::clone(&post);
        let before = updated.comments.len();
        updated.comments.retain(|c| c.id != comment_id);
        if updated.comments.len() == before {
            return Err(BlogError::CommentNotFound(comment_id.to_string()));
        }

        self.persist(updated).await?;
        debug!(post = %post.id, comment = comment_id, "Deleted comment");
        Ok(())
    }

    /// Store an uploaded file and return its public path
    pub async fn save_file(
        &self,
        caller: Caller,
        bytes: &[u8],
        file_name: &str,
        suffix: Option<&str>,
    ) -> Result<String, BlogError> {
        if !caller.is_admin() {
            return Err(BlogError::Forbidden);
        }
        Ok(self.uploads.save(bytes, file_name, suffix).await?)
    }
}
