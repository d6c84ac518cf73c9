use std::path::PathBuf;

/// Errors reported by [`crate::cache::Cache`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// `get` was called for a key with no entry. Correct reserve/release
    /// discipline never reaches this.
    #[error("no cache entry for {key}")]
    NotFound { key: String },
}

/// Errors produced while decoding an image for the cache.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("{}: decoder panicked", path.display())]
    Panicked { path: PathBuf },
}
