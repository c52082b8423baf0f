//! Storage backends for Cairn.
//!
//! This crate provides concrete implementations of the
//! [`PersiDict`](cairn_core::PersiDict) trait:
//!
//! - [`FileDirBackend`] — one file per item on a local or shared
//!   filesystem, with atomic replace and stat-derived ETags
//! - [`S3Backend`] — S3-compatible object storage with native ETags and
//!   server-side conditional operations
//! - [`MemoryBackend`] — process-local store with counter ETags, used for
//!   tests, scratch data, and as the cache store for the wrappers

pub mod filedir;
pub mod memory;
pub mod s3;
pub mod signing;

pub use filedir::{FileDirBackend, FileDirOptions};
pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Options};
