//! Composable wrappers around Cairn dictionaries.
//!
//! Wrappers own no items — backends do. Each wrapper holds its inner
//! dictionary (and any cache dictionaries) as exclusive handles and
//! mediates caching or policy while preserving the conditional-operation
//! protocol:
//!
//! - [`MutableCacheWrapper`] — value + ETag caches with conditional-aware
//!   coherence over a mutable main store
//! - [`AppendOnlyCacheWrapper`] — aggressive caching for stores whose items
//!   never change once written
//! - [`WriteOnceWrapper`] — first-write-wins policy with optional sampled
//!   consistency checks
//! - [`MultiFormatContainer`] — one key-space exposed through several
//!   serialization formats

pub mod append_only;
pub mod multi;
pub mod mutable;
pub mod write_once;

pub use append_only::AppendOnlyCacheWrapper;
pub use multi::MultiFormatContainer;
pub use mutable::MutableCacheWrapper;
pub use write_once::WriteOnceWrapper;
