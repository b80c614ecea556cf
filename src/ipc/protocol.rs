//! Socket protocol definitions
//!
//! Newline-delimited JSON objects tagged by `type`. Each request line gets
//! exactly one response line.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::config::BlogOptions;
use crate::models::{Comment, Post};

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Requests sent by front ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Promote this connection to administrator
    Authenticate { token: String },
    /// Visible posts, newest first; `count` defaults to the page size
    ListPosts {
        count: Option<usize>,
        skip: Option<usize>,
    },
    GetPost { id: String },
    GetPostBySlug { slug: String },
    PostsByYear,
    PostsByCategory { category: String },
    Categories,
    SavePost { post: Post },
    DeletePost { id: String },
    #[serde(rename_all = "camelCase")]
    AddComment {
        post_id: String,
        author: String,
        #[serde(default)]
        email: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteComment { post_id: String, comment_id: String },
    /// Upload a file; `data` is base64
    #[serde(rename_all = "camelCase")]
    SaveFile {
        file_name: String,
        suffix: Option<String>,
        data: String,
    },
    /// Reload the post cache from storage
    Refresh,
    GetStatus,
}

/// Responses sent back on the same connection
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Success {
        message: Option<String>,
    },
    Error {
        error: String,
    },
    Posts {
        posts: Vec<Arc<Post>>,
    },
    /// `post` is null when nothing visible matched
    Post {
        post: Option<Arc<Post>>,
    },
    PostsByYear {
        years: BTreeMap<i32, Vec<Arc<Post>>>,
    },
    Categories {
        categories: Vec<String>,
    },
    Comment {
        comment: Comment,
    },
    FileSaved {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        version: u32,
        backend: String,
        backend_health: String,
        /// Latest storage errors, oldest first
        recent_errors: Vec<String>,
        posts: usize,
        cache: CacheStats,
        options: BlogOptions,
    },
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_parse_list_posts_command() {
        let cmd = parse_command(br#"{"type":"listPosts","count":2,"skip":4}"#).unwrap();
        match cmd {
            Command::ListPosts { count, skip } => {
                assert_eq!(count, Some(2));
                assert_eq!(skip, Some(4));
            }
            _ => panic!("Expected ListPosts command"),
        }

        let cmd = parse_command(br#"{"type":"listPosts"}"#).unwrap();
        assert!(matches!(cmd, Command::ListPosts { count: None, skip: None }));
    }

    #[test]
    fn test_parse_save_post_command() {
        let json = r#"{"type":"savePost","post":{
            "ID":"p1","Title":"Hello","Slug":"hello",
            "PubDate":"2024-01-01T00:00:00Z","LastModified":"2024-01-01T00:00:00Z",
            "IsPublished":true,"Categories":["Tech"]}}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::SavePost { post } => {
                assert_eq!(post.id, "p1");
                assert!(post.is_published);
                assert!(post.comments.is_empty());
            }
            _ => panic!("Expected SavePost command"),
        }
    }

    #[test]
    fn test_parse_comment_and_file_commands() {
        let cmd = parse_command(
            br#"{"type":"addComment","postId":"p1","author":"Ann","content":"Hi"}"#,
        )
        .unwrap();
        match cmd {
            Command::AddComment { post_id, email, .. } => {
                assert_eq!(post_id, "p1");
                assert_eq!(email, "");
            }
            _ => panic!("Expected AddComment command"),
        }

        let cmd =
            parse_command(br#"{"type":"saveFile","fileName":"a.png","data":"aGk="}"#).unwrap();
        assert!(matches!(cmd, Command::SaveFile { suffix: None, .. }));
    }

    #[test]
    fn test_parse_unit_commands() {
        assert!(matches!(
            parse_command(br#"{"type":"getStatus"}"#).unwrap(),
            Command::GetStatus
        ));
        assert!(matches!(
            parse_command(br#"{"type":"refresh"}"#).unwrap(),
            Command::Refresh
        ));
        assert!(parse_command(br#"{"type":"publishEverything"}"#).is_err());
    }

    #[test]
    fn test_serialize_missing_post_as_null() {
        let json = serialize_response(&Response::Post { post: None }).unwrap();
        assert_eq!(json, b"{\"type\":\"post\",\"post\":null}\n");
    }

    #[test]
    fn test_serialize_posts_by_year() {
        let mut post = Post::new("Year");
        post.pub_date = datetime!(2023-05-01 0:00 UTC);
        let mut years = BTreeMap::new();
        years.insert(2023, vec![Arc::new(post)]);

        let json = serialize_response(&Response::PostsByYear { years }).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["type"], "postsByYear");
        assert_eq!(value["years"]["2023"][0]["Title"], "Year");
    }

    #[test]
    fn test_serialize_status_response() {
        let response = Response::Status {
            version: PROTOCOL_VERSION,
            backend: "file".to_string(),
            backend_health: "degraded".to_string(),
            recent_errors: vec!["2024-01-01T00:00:00Z query *: Server busy".to_string()],
            posts: 3,
            cache: CacheStats {
                entries: 3,
                reads: 10,
                reloads: 1,
                failed_reloads: 0,
            },
            options: BlogOptions::default(),
        };
        let json = serialize_response(&response).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["backendHealth"], "degraded");
        assert_eq!(value["recentErrors"][0], "2024-01-01T00:00:00Z query *: Server busy");
        assert_eq!(value["options"]["postsPerPage"], 4);
        assert_eq!(value["options"]["listView"], "titlesAndExcerpts");
    }

    #[test]
    fn test_serialize_error_response() {
        let response = Response::Error {
            error: "Post not found".to_string(),
        };
        let json = String::from_utf8(serialize_response(&response).unwrap()).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.ends_with('\n'));
    }
}
