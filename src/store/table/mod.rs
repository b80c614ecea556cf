//! Cloud table backend
//!
//! Stores each post as one row of an Azure-Table-compatible service, keyed
//! by partition = post id and row = slug. Loads read the whole table.

pub mod client;
pub mod entity;
pub mod errors;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{PostStore, StoreError};
use crate::models::Post;

pub use client::TableClient;
pub use entity::PostEntity;
pub use errors::TableError;

/// Post store backed by a table service
#[derive(Clone)]
pub struct TableStore {
    client: TableClient,
}

impl TableStore {
    /// Connect to the table, creating it when missing
    pub async fn connect(endpoint: &str, table_name: &str, sas: &str) -> Result<Self, StoreError> {
        let client = TableClient::connect(endpoint, table_name, sas).await?;
        Ok(Self { client })
    }

    async fn delete_row(&self, partition_key: &str, row_key: &str) -> Result<(), StoreError> {
        match self.client.delete_entity(partition_key, row_key).await {
            Ok(()) => Ok(()),
            Err(TableError::NotFound(_)) => {
                debug!(id = partition_key, slug = row_key, "Row already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Keep one post per id, the most recently modified
///
/// A renamed slug leaves an older row in the post's partition until the
/// cleanup after the write succeeds.
fn latest_per_id(posts: Vec<Post>) -> Vec<Post> {
    let mut by_id: BTreeMap<String, Post> = BTreeMap::new();

    for post in posts {
        match by_id.entry(post.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(post);
            }
            Entry::Occupied(mut slot) => {
                warn!(id = %post.id, "Several rows for one post, keeping the newest");
                if post.last_modified > slot.get().last_modified {
                    slot.insert(post);
                }
            }
        }
    }

    by_id.into_values().collect()
}

#[async_trait]
impl PostStore for TableStore {
    fn name(&self) -> &'static str {
        "table"
    }

    fn health(&self) -> &'static str {
        self.client.health_status()
    }

    fn recent_errors(&self) -> Vec<String> {
        self.client
            .recent_errors()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    async fn load_all(&self) -> Result<Vec<Post>, StoreError> {
        let entities = self.client.query_entities(None).await?;
        Ok(latest_per_id(entities.into_iter().map(Post::from).collect()))
    }

    async fn upsert(&self, post: &Post) -> Result<(), StoreError> {
        self.client.insert_or_merge(&PostEntity::from(post)).await?;

        // Rows left under an earlier slug
        let rows = self.client.query_entities(Some(&post.id)).await?;
        for row in rows.iter().filter(|row| row.row_key != post.slug) {
            debug!(id = %post.id, slug = %row.row_key, "Removing row for old slug");
            self.delete_row(&row.partition_key, &row.row_key).await?;
        }
        Ok(())
    }

    async fn delete(&self, post: &Post) -> Result<(), StoreError> {
        let rows = self.client.query_entities(Some(&post.id)).await?;
        if rows.is_empty() {
            debug!(id = %post.id, "Row already absent");
        }

        for row in &rows {
            self.delete_row(&row.partition_key, &row.row_key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn post(id: &str, slug: &str, last_modified: time::OffsetDateTime) -> Post {
        let mut post = Post::new(format!("Post {id}"));
        post.id = id.to_string();
        post.slug = slug.to_string();
        post.last_modified = last_modified;
        post
    }

    #[test]
    fn test_latest_per_id_keeps_newest_row() {
        let posts = latest_per_id(vec![
            post("a", "old-slug", datetime!(2023-01-01 0:00 UTC)),
            post("b", "b", datetime!(2023-01-01 0:00 UTC)),
            post("a", "new-slug", datetime!(2023-02-01 0:00 UTC)),
        ]);

        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, "a");
        assert_eq!(posts[0].slug, "new-slug");
        assert_eq!(posts[1].id, "b");
    }

    #[test]
    fn test_latest_per_id_keeps_distinct_posts() {
        let posts = latest_per_id(vec![
            post("a", "same", datetime!(2023-01-01 0:00 UTC)),
            post("b", "same", datetime!(2023-01-01 0:00 UTC)),
        ]);
        assert_eq!(posts.len(), 2);
    }
}
