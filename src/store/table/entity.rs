//! Table entity types and Post conversion
//!
//! Table rows only hold flat scalar columns, so categories and comments are
//! stored as JSON text. Each post is keyed by partition = id, row = slug and
//! also carries its id in an `ID` column.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::models::{Comment, Post};

/// Deserialize a list column that might be JSON text, an inline array, or null.
/// Rows written by other tools sometimes inline the array, and older rows
/// lack the column entirely.
fn deserialize_json_column<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    struct JsonColumnVisitor<T>(PhantomData<T>);

    impl<'de, T: DeserializeOwned> de::Visitor<'de> for JsonColumnVisitor<T> {
        type Value = Vec<T>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a JSON array, a string containing a JSON array, or null")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Vec<T>, E> {
            if value.trim().is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str(value).map_err(de::Error::custom)
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<T>, A::Error> {
            let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(item) = seq.next_element::<serde_json::Value>()? {
                items.push(serde_json::from_value(item).map_err(de::Error::custom)?);
            }
            Ok(items)
        }

        fn visit_none<E: de::Error>(self) -> Result<Vec<T>, E> {
            Ok(Vec::new())
        }

        fn visit_unit<E: de::Error>(self) -> Result<Vec<T>, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(JsonColumnVisitor(PhantomData))
}

fn serialize_json_column<S, T>(items: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    let text = serde_json::to_string(items).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&text)
}

/// Post row as stored in the table service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostEntity {
    /// Post id
    pub partition_key: String,
    /// Post slug at the time the row was written
    pub row_key: String,
    /// Absent on rows written without the id column
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub slug: String,
    pub title: String,
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
    #[serde(
        default,
        deserialize_with = "deserialize_json_column",
        serialize_with = "serialize_json_column"
    )]
    pub categories: Vec<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_json_column",
        serialize_with = "serialize_json_column"
    )]
    pub comments: Vec<Comment>,
}

/// One page of a table query
#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    /// Entities in this page
    #[serde(default)]
    pub value: Vec<PostEntity>,
}

/// Continuation token from `x-ms-continuation-*` response headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next_partition_key: String,
    pub next_row_key: Option<String>,
}

impl From<&Post> for PostEntity {
    fn from(post: &Post) -> Self {
        Self {
            partition_key: post.id.clone(),
            row_key: post.slug.clone(),
            id: Some(post.id.clone()),
            slug: post.slug.clone(),
            title: post.title.clone(),
            excerpt: post.excerpt.clone(),
            content: post.content.clone(),
            pub_date: post.pub_date,
            last_modified: post.last_modified,
            is_published: post.is_published,
            categories: post.categories.clone(),
            comments: post.comments.clone(),
        }
    }
}

impl From<PostEntity> for Post {
    fn from(entity: PostEntity) -> Self {
        let id = match entity.id {
            Some(id) if !id.is_empty() => id,
            _ => entity.partition_key,
        };
        let slug = if entity.slug.is_empty() {
            entity.row_key
        } else {
            entity.slug
        };

        Self {
            id,
            title: entity.title,
            slug,
            excerpt: entity.excerpt,
            content: entity.content,
            pub_date: entity.pub_date,
            last_modified: entity.last_modified,
            is_published: entity.is_published,
            categories: entity.categories,
            comments: entity.comments,
        }
    }
}
