//! Blog operations on top of the post cache

pub mod blog;
pub mod upload;

pub use blog::{BlogError, BlogService, Caller, Clock};
pub use upload::{UploadError, UploadStore};
