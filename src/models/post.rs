//! Post and comment records
//!
//! Field names are PascalCase on the wire so post files written by earlier
//! deployments stay readable.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// A single blog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Post {
    /// Stable identity, never reused
    #[serde(rename = "ID")]
    pub id: String,
    pub title: String,
    /// URL-friendly name, unique among published posts
    pub slug: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub pub_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// A reader comment attached to a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Comment {
    #[serde(rename = "ID")]
    pub id: String,
    pub author: String,
    #[serde(default)]
    pub email: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub pub_date: OffsetDateTime,
    /// Written by the blog administrator
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "approved_by_default")]
    pub is_approved: bool,
}

fn approved_by_default() -> bool {
    true
}

/// Generate a fresh opaque identifier
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Post {
    /// Create an unpublished draft with a fresh id and a slug derived from the title
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let now = OffsetDateTime::now_utc();
        Self {
            id: new_id(),
            slug: Self::create_slug(&title),
            title,
            excerpt: String::new(),
            content: String::new(),
            pub_date: now,
            last_modified: now,
            is_published: false,
            categories: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Derive a URL slug from a title
    ///
    /// Lower-cases, transliterates to ASCII and joins words with `-`.
    pub fn create_slug(title: &str) -> String {
        slug::slugify(title)
    }

    /// Public link for this post
    pub fn encoded_link(&self) -> String {
        format!("/blog/{}/", urlencoding::encode(&self.slug))
    }

    /// Case-insensitive category membership
    pub fn has_category(&self, category: &str) -> bool {
        let needle = category.to_lowercase();
        self.categories.iter().any(|c| c.to_lowercase() == needle)
    }

    /// Whether new comments are still accepted at `now`
    pub fn are_comments_open(&self, close_after_days: u32, now: OffsetDateTime) -> bool {
        self.pub_date + Duration::days(i64::from(close_after_days)) >= now
    }
}

impl Comment {
    pub fn new(
        author: impl Into<String>,
        email: impl Into<String>,
        content: impl Into<String>,
        is_admin: bool,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: new_id(),
            author: author.into(),
            email: email.into(),
            content: content.into(),
            pub_date: now,
            is_admin,
            is_approved: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_new_post_defaults() {
        let post = Post::new("Hello, Wörld: Part 2!");
        assert_eq!(post.slug, "hello-world-part-2");
        assert_eq!(post.id.len(), 32);
        assert!(!post.is_published);
        assert_eq!(post.pub_date, post.last_modified);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn test_encoded_link() {
        let mut post = Post::new("Some title");
        post.slug = "some-title".to_string();
        assert_eq!(post.encoded_link(), "/blog/some-title/");
    }

    #[test]
    fn test_has_category_ignores_case() {
        let mut post = Post::new("x");
        post.categories = vec!["Tech".to_string(), "Life".to_string()];
        assert!(post.has_category("tech"));
        assert!(post.has_category("LIFE"));
        assert!(!post.has_category("travel"));
    }

    #[test]
    fn test_comments_window() {
        let mut post = Post::new("x");
        post.pub_date = datetime!(2023-01-01 0:00 UTC);
        assert!(post.are_comments_open(10, datetime!(2023-01-11 0:00 UTC)));
        assert!(!post.are_comments_open(10, datetime!(2023-01-11 0:01 UTC)));
        assert!(!post.are_comments_open(0, datetime!(2023-01-02 0:00 UTC)));
    }

    #[test]
    fn test_deserialize_legacy_post_file() {
        let json = r#"{
            "ID": "abc",
            "Title": "First",
            "Slug": "first",
            "Excerpt": "short",
            "Content": "<p>body</p>",
            "PubDate": "2023-06-01T10:00:00.1234567Z",
            "LastModified": "2023-06-02T10:00:00Z",
            "IsPublished": true,
            "Categories": ["Tech"],
            "Comments": [{
                "ID": "c1",
                "Author": "Ann",
                "Email": "ann@example.com",
                "Content": "Nice",
                "PubDate": "2023-06-03T10:00:00Z",
                "IsAdmin": false
            }]
        }"#;

        let post: Post = serde_json::from_str(json).unwrap();
        assert_eq!(post.id, "abc");
        assert_eq!(post.pub_date.year(), 2023);
        assert!(post.is_published);
        assert_eq!(post.categories, vec!["Tech".to_string()]);
        assert_eq!(post.comments.len(), 1);
        assert!(post.comments[0].is_approved);
    }

    #[test]
    fn test_serialize_uses_pascal_case() {
        let post = Post::new("Title");
        let json = serde_json::to_string(&post).unwrap();
        assert!(json.contains("\"ID\""));
        assert!(json.contains("\"PubDate\""));
        assert!(json.contains("\"IsPublished\""));
    }
}
