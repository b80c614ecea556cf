//! Blog records

pub mod post;

pub use post::{new_id, Comment, Post};
