//! Concurrent image cache for a viewer: decode workers insert, views reserve
//! and read, and the folder controller trims the cache to its working set.

pub mod cache;
pub mod collection;
pub mod error;
pub mod files;
pub mod loader;

pub use cache::{Cache, CacheSection, ImageCache, Pinned, TryReserve};
pub use error::{CacheError, LoadError};
