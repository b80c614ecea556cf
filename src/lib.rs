//! Miniblog - cached blog post service
//!
//! Posts live in a storage backend (JSON files or a cloud table) and are
//! mirrored in an in-memory cache that serves all reads.

pub mod cache;
pub mod config;
pub mod ipc;
pub mod models;
pub mod service;
pub mod store;
