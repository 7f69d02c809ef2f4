//! Storage error types.
//!
//! One enum covers both backends so callers can hold an
//! `Arc<dyn LogStore>` without caring which tier is behind it. Backend
//! errors convert via `#[from]`; not-found conditions are modeled as
//! `Ok(None)` on lookups, so the explicit variants here are reserved for
//! operations that require the owner to exist (sequence reservation).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] loghouse_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("test not found: {0}")]
    TestNotFound(String),

    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
}
